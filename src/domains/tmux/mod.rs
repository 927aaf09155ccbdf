mod attach;

pub use attach::{AttachGuard, DetachHandle, DETACH_KEY};

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::domains::repo;
use crate::error::{CoreError, Result};

/// Prefix for every session this controller owns, followed by the repo hash
/// and the sanitized instance title: `claudesquad_<hash>_<title>`.
pub const TMUX_PREFIX: &str = "claudesquad_";

/// Session-scoped environment variable carrying the canonical repo path, so
/// orphan-detection tooling can recover which repository a session belongs to.
pub const REPO_ENV_VAR: &str = "CLAUDE_SQUAD_REPO";

pub const SCROLLBACK_LINES: u32 = 10_000;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One detached tmux session per instance. All control operations go through
/// the tmux binary; only `attach` opens a pseudoterminal.
#[derive(Debug)]
pub struct TmuxSession {
    session_name: String,
    program: String,
    repo_path: PathBuf,
    attach: Option<DetachHandle>,
}

pub fn session_name_for(repo_hash: &str, sanitized_title: &str) -> String {
    format!("{TMUX_PREFIX}{repo_hash}_{sanitized_title}")
}

impl TmuxSession {
    pub fn new(title: &str, program: &str, repo_path: &Path) -> anyhow::Result<Self> {
        let hash = repo::repo_hash(repo_path)?;
        let sanitized = repo::sanitize_title(title)?;
        Ok(TmuxSession {
            session_name: session_name_for(&hash, &sanitized),
            program: program.to_string(),
            repo_path: repo::canonical_repo_path(repo_path)?,
            attach: None,
        })
    }

    /// Rebuild a handle for a stored instance without re-deriving the name;
    /// the persisted name stays authoritative across restarts.
    pub fn from_parts(session_name: &str, program: &str, repo_path: &Path) -> anyhow::Result<Self> {
        Ok(TmuxSession {
            session_name: session_name.to_string(),
            program: program.to_string(),
            repo_path: repo::canonical_repo_path(repo_path)?,
            attach: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.session_name
    }

    /// Create the detached session running `program` in `work_dir`, with
    /// scrollback and mouse input enabled and the repo path recorded in the
    /// session environment.
    pub async fn start(&self, work_dir: &Path) -> Result<()> {
        run_tmux(&[
            "new-session",
            "-d",
            "-s",
            &self.session_name,
            "-c",
            &work_dir.to_string_lossy(),
            &self.program,
        ])
        .await?;

        let scrollback = SCROLLBACK_LINES.to_string();
        run_tmux(&[
            "set-option",
            "-t",
            &self.session_name,
            "history-limit",
            &scrollback,
        ])
        .await?;
        run_tmux(&["set-option", "-t", &self.session_name, "mouse", "on"]).await?;
        run_tmux(&[
            "set-environment",
            "-t",
            &self.session_name,
            REPO_ENV_VAR,
            &self.repo_path.to_string_lossy(),
        ])
        .await?;

        log::info!("started tmux session {}", self.session_name);
        Ok(())
    }

    /// Adopt an already-running session with this exact name, if any.
    /// Returns whether one was found.
    pub async fn restore(&self) -> Result<bool> {
        if has_session(&self.session_name).await? {
            log::info!("restored existing tmux session {}", self.session_name);
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn has_session(&self) -> Result<bool> {
        has_session(&self.session_name).await
    }

    /// Attach the controlling terminal to the session through a
    /// pseudoterminal. Returns when the user presses the detach key (Ctrl-Q),
    /// the session ends, or `detach` is called from another task. Dropping
    /// the returned future tears the attachment down via the guard's drop.
    pub async fn attach(&mut self) -> Result<()> {
        if !self.has_session().await? {
            return Err(CoreError::SessionLost(self.session_name.clone()));
        }
        let guard = AttachGuard::spawn(&self.session_name)?;
        self.attach = Some(guard.handle());
        guard.wait().await;
        self.attach = None;
        Ok(())
    }

    /// Stop the attach pumps and release the pseudoterminal, leaving the
    /// underlying session running. Errors when no attach is active.
    pub fn detach(&mut self) -> Result<()> {
        match self.attach.take() {
            Some(handle) => {
                handle.stop();
                Ok(())
            }
            None => Err(CoreError::Io(std::io::Error::other("not attached"))),
        }
    }

    /// Like `detach`, but fine to call when nothing is attached.
    pub fn detach_safely(&mut self) {
        if let Some(handle) = self.attach.take() {
            handle.stop();
        }
    }

    /// Inject literal keystrokes without attaching.
    pub async fn send_keys(&self, text: &str) -> Result<()> {
        run_tmux(&["send-keys", "-t", &self.session_name, "-l", text]).await?;
        Ok(())
    }

    /// Send a bare Enter, the auto-confirm reply to a prompt.
    pub async fn tap_enter(&self) -> Result<()> {
        run_tmux(&["send-keys", "-t", &self.session_name, "Enter"]).await?;
        Ok(())
    }

    /// Dump the pane contents: the visible region, or the full scrollback
    /// when `history` is set.
    pub async fn capture(&self, history: bool) -> Result<String> {
        let mut args = vec!["capture-pane", "-p", "-t", self.session_name.as_str()];
        if history {
            args.extend(["-S", "-"]);
        }
        let output = run_tmux(&args).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.detach_safely();
        kill_session(&self.session_name).await
    }
}

/// Exact-name existence check. The `=` prefix keeps tmux from treating the
/// name as a prefix pattern.
pub async fn has_session(name: &str) -> Result<bool> {
    let target = format!("={name}");
    match run_tmux(&["has-session", "-t", &target]).await {
        Ok(_) => Ok(true),
        Err(CoreError::SubprocessFailed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn kill_session(name: &str) -> Result<()> {
    run_tmux(&["kill-session", "-t", name]).await?;
    log::info!("killed tmux session {name}");
    Ok(())
}

/// All session names currently known to the tmux server. A missing server,
/// or a host without tmux installed at all, is an empty list rather than an
/// error.
pub async fn list_sessions() -> Result<Vec<String>> {
    match run_tmux(&["list-sessions", "-F", "#{session_name}"]).await {
        Ok(output) => Ok(String::from_utf8_lossy(&output)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()),
        Err(CoreError::SubprocessFailed { .. }) => Ok(Vec::new()),
        Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Kill every session whose name starts with `prefix`. Used by `reset` with
/// the per-repo prefix `claudesquad_<hash>`.
pub async fn cleanup_sessions_by_prefix(prefix: &str) -> Result<()> {
    for name in list_sessions().await? {
        if name.starts_with(prefix) {
            if let Err(e) = kill_session(&name).await {
                log::warn!("failed to kill session {name}: {e}");
            }
        }
    }
    Ok(())
}

/// Read the repository path recorded in a session's environment.
pub async fn session_repo_path(name: &str) -> Result<Option<String>> {
    match run_tmux(&["show-environment", "-t", name, REPO_ENV_VAR]).await {
        Ok(output) => Ok(parse_env_output(&String::from_utf8_lossy(&output))),
        Err(CoreError::SubprocessFailed { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_env_output(output: &str) -> Option<String> {
    let line = output.lines().next()?;
    let (key, value) = line.split_once('=')?;
    if key != REPO_ENV_VAR {
        return None;
    }
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

async fn run_tmux(args: &[&str]) -> Result<Vec<u8>> {
    let command = format!("tmux {}", args.join(" "));
    let output = tokio::time::timeout(QUERY_TIMEOUT, Command::new("tmux").args(args).output())
        .await
        .map_err(|_| CoreError::SubprocessTimeout {
            command: command.clone(),
        })?
        .map_err(CoreError::Io)?;

    if !output.status.success() {
        return Err(CoreError::SubprocessFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn session_names_are_namespaced_by_repo_hash() {
        let tmp = TempDir::new().unwrap();
        let session = TmuxSession::new("fix login", "claude", tmp.path()).unwrap();
        let hash = repo::repo_hash(tmp.path()).unwrap();
        assert_eq!(session.name(), format!("claudesquad_{hash}_fixlogin"));
    }

    #[test]
    fn dots_in_titles_become_underscores() {
        let tmp = TempDir::new().unwrap();
        let session = TmuxSession::new("v1.2 bump", "claude", tmp.path()).unwrap();
        assert!(session.name().ends_with("_v1_2bump"));
    }

    #[test]
    fn empty_title_is_rejected() {
        let tmp = TempDir::new().unwrap();
        assert!(TmuxSession::new("  ", "claude", tmp.path()).is_err());
    }

    #[test]
    fn env_output_parsing() {
        assert_eq!(
            parse_env_output("CLAUDE_SQUAD_REPO=/home/user/repo\n"),
            Some("/home/user/repo".to_string())
        );
        assert_eq!(parse_env_output("-CLAUDE_SQUAD_REPO"), None);
        assert_eq!(parse_env_output("OTHER=/x"), None);
        assert_eq!(parse_env_output(""), None);
    }

    #[test]
    fn detach_without_attach_is_an_error_but_safe_variant_is_not() {
        let tmp = TempDir::new().unwrap();
        let mut session = TmuxSession::new("t", "claude", tmp.path()).unwrap();
        assert!(session.detach().is_err());
        session.detach_safely();
    }
}
