use anyhow::{anyhow, Result};
use clap::Parser;

use claude_squad::app;
use claude_squad::cleanup;
use claude_squad::cli::{Cli, Commands};
use claude_squad::config;
use claude_squad::daemon;
use claude_squad::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Version) => {
            println!("claude-squad version {}", env!("CARGO_PKG_VERSION"));
            println!(
                "https://github.com/smtg-ai/claude-squad/releases/tag/v{}",
                env!("CARGO_PKG_VERSION")
            );
            Ok(())
        }
        Some(Commands::Debug) => {
            logging::init_logging(false);
            let cfg = config::load_config();
            println!(
                "Config: {}\n{}",
                config::config_path()?.display(),
                serde_json::to_string_pretty(&cfg)?
            );
            Ok(())
        }
        Some(Commands::Reset) => {
            logging::init_logging(false);
            app::reset(&std::env::current_dir()?).await
        }
        Some(Commands::Cleanup { kill_all }) => {
            logging::init_logging(false);
            cleanup::run(kill_all).await
        }
        None => {
            logging::init_logging(cli.daemon);

            if cli.daemon {
                let repo_path = cli
                    .repo_path
                    .ok_or_else(|| anyhow!("--repo-path is required in daemon mode"))?;
                let cfg = config::load_config();
                return daemon::run_daemon(&cfg, &repo_path).await;
            }

            let cwd = std::env::current_dir()?;
            let mut controller = app::Controller::new(&cwd, cli.program, cli.auto_yes).await?;
            let auto_yes = controller.auto_yes();
            let repo_path = controller.repo_path().to_path_buf();

            let result = controller.run().await;

            // The lock is gone once the controller drops; only then may the
            // daemon take over the repo.
            drop(controller);
            if auto_yes {
                if let Err(e) = daemon::launch_daemon(&repo_path) {
                    log::error!("failed to launch daemon: {e}");
                }
            }
            result
        }
    }
}
