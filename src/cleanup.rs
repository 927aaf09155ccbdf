use anyhow::Result;
use std::io::{BufRead, Write};
use std::path::Path;

use crate::domains::tmux;

/// Where a session stands relative to its recorded repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Repo path recorded and still on disk.
    Active,
    /// Repo path recorded but the directory is gone.
    Orphaned,
    /// No recorded repo path (created before repo tracking).
    Unknown,
}

#[derive(Debug)]
pub struct SessionInfo {
    pub name: String,
    pub repo_path: Option<String>,
    pub kind: SessionKind,
}

/// A claude-squad session name is `claudesquad_<8 hex>_<title>`.
pub fn is_claudesquad_session(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(tmux::TMUX_PREFIX) else {
        return false;
    };
    let Some((hash, title)) = rest.split_once('_') else {
        return false;
    };
    hash.len() == 8
        && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        && !title.is_empty()
}

/// All claude-squad sessions on the host, classified by whether their
/// recorded repository still exists.
pub async fn survey_sessions() -> Result<Vec<SessionInfo>> {
    let mut infos = Vec::new();
    for name in tmux::list_sessions().await? {
        if !is_claudesquad_session(&name) {
            continue;
        }
        let info = match tmux::session_repo_path(&name).await? {
            Some(repo_path) => {
                let kind = if Path::new(&repo_path).is_dir() {
                    SessionKind::Active
                } else {
                    SessionKind::Orphaned
                };
                SessionInfo {
                    name,
                    repo_path: Some(repo_path),
                    kind,
                }
            }
            None => SessionInfo {
                name,
                repo_path: None,
                kind: SessionKind::Unknown,
            },
        };
        infos.push(info);
    }
    Ok(infos)
}

/// `cs cleanup`: list sessions, point out orphans, and offer to kill them.
/// With `kill_all`, every claude-squad session dies without prompting.
pub async fn run(kill_all: bool) -> Result<()> {
    if kill_all {
        return kill_all_sessions().await;
    }

    let infos = survey_sessions().await?;
    if infos.is_empty() {
        println!("No claude-squad tmux sessions found");
        return Ok(());
    }

    let active: Vec<_> = infos.iter().filter(|i| i.kind == SessionKind::Active).collect();
    let orphaned: Vec<_> = infos.iter().filter(|i| i.kind == SessionKind::Orphaned).collect();
    let unknown: Vec<_> = infos.iter().filter(|i| i.kind == SessionKind::Unknown).collect();

    println!("Found {} claude-squad session(s):\n", infos.len());

    if !active.is_empty() {
        println!("Active sessions ({}):", active.len());
        for info in &active {
            println!("  - {}\n    repo: {}", info.name, info.repo_path.as_deref().unwrap_or("?"));
        }
        println!();
    }

    if !unknown.is_empty() {
        println!("Unknown sessions ({}) - created before repo tracking:", unknown.len());
        for info in &unknown {
            println!("  - {}", info.name);
        }
        println!();
    }

    if orphaned.is_empty() {
        println!("No orphaned sessions found - all clean!");
        println!("\nCommands:");
        println!("  cs cleanup --kill-all         Kill all sessions");
        println!("  tmux kill-session -t <name>   Kill specific session");
        return Ok(());
    }

    println!("Orphaned sessions ({}) - repository no longer exists:", orphaned.len());
    for info in &orphaned {
        println!(
            "  - {}\n    repo: {} (not found)",
            info.name,
            info.repo_path.as_deref().unwrap_or("?")
        );
    }
    println!();

    print!("Kill orphaned sessions? [y/N]: ");
    std::io::stdout().flush()?;
    let mut response = String::new();
    std::io::stdin().lock().read_line(&mut response)?;
    if !matches!(response.trim(), "y" | "Y") {
        println!("Cleanup cancelled");
        return Ok(());
    }

    println!("\nKilling orphaned sessions...");
    for info in &orphaned {
        println!("  Killing: {}", info.name);
        if let Err(e) = tmux::kill_session(&info.name).await {
            log::warn!("failed to kill session {}: {e}", info.name);
            println!("  Warning: Failed to kill {}", info.name);
        }
    }
    println!("\nCleanup complete!");
    Ok(())
}

async fn kill_all_sessions() -> Result<()> {
    let infos = survey_sessions().await?;
    if infos.is_empty() {
        println!("No sessions to clean up");
        return Ok(());
    }

    println!("Killing {} session(s)...", infos.len());
    for info in &infos {
        println!("  Killing: {}", info.name);
        if let Err(e) = tmux::kill_session(&info.name).await {
            log::warn!("failed to kill session {}: {e}", info.name);
            println!("  Warning: Failed to kill {}", info.name);
        }
    }
    println!("\nCleanup complete!");
    Ok(())
}
