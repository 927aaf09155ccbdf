use clap::{Parser, Subcommand};
use std::path::PathBuf;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Claude Squad - Manage multiple AI agents like Claude Code, Aider, Codex, and Amp.
#[derive(Debug, Parser)]
#[command(
    name = "cs",
    about = "Claude Squad - Manage multiple AI agents like Claude Code, Aider, Codex, and Amp.",
    version = VERSION
)]
pub struct Cli {
    /// Program to run in new instances (e.g. 'aider --model ollama_chat/gemma3:1b')
    #[arg(short = 'p', long = "program")]
    pub program: Option<String>,

    /// [experimental] If enabled, all instances will automatically accept prompts
    #[arg(short = 'y', long = "autoyes")]
    pub auto_yes: bool,

    /// Run a program that loads all sessions and runs autoyes mode on them.
    #[arg(long, hide = true)]
    pub daemon: bool,

    /// Repository path for daemon mode
    #[arg(long = "repo-path", hide = true)]
    pub repo_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Reset all stored instances for the current repository
    Reset,
    /// List or clean up claude-squad tmux sessions
    Cleanup {
        /// Kill all claude-squad sessions without prompting
        #[arg(long = "kill-all")]
        kill_all: bool,
    },
    /// Print debug information like config paths
    Debug,
    /// Print the version number of claude-squad
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_from<I, T>(itr: I) -> Cli
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString>,
    {
        let iter = std::iter::once(std::ffi::OsString::from("cs"))
            .chain(itr.into_iter().map(Into::into));
        Cli::parse_from(iter)
    }

    #[test]
    fn parses_no_args() {
        let cli = parse_from::<[&str; 0], &str>([]);
        assert!(cli.command.is_none());
        assert!(cli.program.is_none());
        assert!(!cli.auto_yes);
    }

    #[test]
    fn parses_program_and_autoyes_flags() {
        let cli = parse_from(["-p", "aider", "-y"]);
        assert_eq!(cli.program.as_deref(), Some("aider"));
        assert!(cli.auto_yes);
    }

    #[test]
    fn parses_hidden_daemon_flags() {
        let cli = parse_from(["--daemon", "--repo-path", "/tmp/repo"]);
        assert!(cli.daemon);
        assert_eq!(cli.repo_path.as_deref(), Some(std::path::Path::new("/tmp/repo")));
    }

    #[test]
    fn parses_cleanup_with_kill_all() {
        let cli = parse_from(["cleanup", "--kill-all"]);
        match cli.command {
            Some(Commands::Cleanup { kill_all }) => assert!(kill_all),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn daemon_flags_are_hidden_from_help() {
        use clap::CommandFactory;
        let mut cmd = Cli::command();
        let help = cmd.render_help().to_string();
        assert!(!help.contains("--daemon"));
        assert!(!help.contains("--repo-path"));
        assert!(help.contains("--autoyes"));
    }
}
