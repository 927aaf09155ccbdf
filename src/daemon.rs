use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use crate::config::Config;
use crate::domains::instance::Storage;
use crate::domains::repo;
use crate::domains::storage::State;
use crate::logging::LogEvery;

pub const PID_FILE_NAME: &str = "daemon.pid";

fn pid_file(repo_path: &Path) -> Result<PathBuf> {
    Ok(repo::state_dir(repo_path)?.join(PID_FILE_NAME))
}

/// The auto-confirm loop. Loads the stored instances, forces auto-yes on,
/// and polls each started, non-paused instance; a detected prompt gets an
/// Enter plus a diff-stats refresh. SIGINT/SIGTERM stop the loop and the
/// instances are saved back before exit.
///
/// The daemon only runs while no controller holds the repo lock, so its
/// start-up load and shutdown save never race a controller's writes.
pub async fn run_daemon(cfg: &Config, repo_path: &Path) -> Result<()> {
    log::info!("starting daemon for repo: {}", repo_path.display());

    let mut storage = Storage::new(State::load(repo_path));
    let mut instances = storage
        .load_instances()
        .context("failed to load instances")?;

    for instance in &mut instances {
        // The daemon exists to confirm prompts; its own view is always yes.
        instance.auto_yes = true;
        if instance.started() && !instance.paused() {
            if let Err(e) = instance.start(false).await {
                log::warn!("daemon could not adopt instance {}: {e}", instance.title);
            }
        }
    }

    let poll_interval = Duration::from_millis(cfg.daemon_poll_interval.max(1));
    let mut every = LogEvery::new(Duration::from_secs(60));
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("daemon received SIGINT");
                break;
            }
            _ = terminate => {
                log::info!("daemon received SIGTERM");
                break;
            }
            _ = ticker.tick() => {
                poll_instances(&mut instances, &mut every).await;
            }
        }
    }

    if let Err(e) = storage.save_instances(&instances) {
        log::error!("failed to save instances when terminating daemon: {e}");
    }
    if let Ok(path) = pid_file(repo_path) {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

async fn poll_instances(
    instances: &mut [crate::domains::instance::Instance],
    every: &mut LogEvery,
) {
    for instance in instances.iter_mut() {
        if !instance.started() || instance.paused() {
            continue;
        }
        match instance.has_updated().await {
            Ok((_, true)) => {
                if let Err(e) = instance.tap_enter().await {
                    if every.should_log() {
                        log::warn!("could not tap enter for {}: {e}", instance.title);
                    }
                }
                if let Err(e) = instance.update_diff_stats().await {
                    if every.should_log() {
                        log::warn!("could not update diff stats for {}: {e}", instance.title);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                if every.should_log() {
                    log::warn!("could not poll instance {}: {e}", instance.title);
                }
            }
        }
    }
}

/// Re-exec this binary as a detached daemon for the repository and record its
/// PID in the state directory.
pub fn launch_daemon(repo_path: &Path) -> Result<()> {
    let exe = std::env::current_exe().context("failed to get executable path")?;
    let canonical = repo::canonical_repo_path(repo_path)?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--daemon")
        .arg("--repo-path")
        .arg(&canonical)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // A fresh process group keeps terminal signals from reaching the daemon.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().context("failed to start daemon process")?;
    log::info!(
        "started daemon child process with PID {} for repo {}",
        child.id(),
        canonical.display()
    );

    fs::write(pid_file(repo_path)?, child.id().to_string())
        .context("failed to write PID file")?;
    Ok(())
}

/// Stop a running daemon for the repository, if any. A missing PID file means
/// no daemon; that is success, not an error.
pub fn stop_daemon(repo_path: &Path) -> Result<()> {
    let path = pid_file(repo_path)?;
    let data = match fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("failed to read PID file"),
    };

    let pid: i32 = data
        .trim()
        .parse()
        .context("invalid PID file format")?;

    #[cfg(unix)]
    {
        // SIGTERM so the daemon saves its instances before exiting. A dead
        // PID (ESRCH) just means it is already gone.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).with_context(|| format!("failed to stop daemon process {pid}"));
            }
        }
    }

    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e).context("failed to remove PID file");
        }
    }
    log::info!("daemon process (PID {pid}) stopped");
    Ok(())
}
