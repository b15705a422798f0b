use clap::Parser;
use hookguard::cli::{self, Cli, Commands};
use hookguard::config::AppConfig;
use hookguard::coordination::{install_panic_hook, install_signal_handlers, ShutdownCoordinator};
use hookguard::error::GuardError;
use hookguard::logging::{init_logging, init_logging_simple};
use hookguard::supervisor::Supervisor;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command() {
        Commands::Run => {
            init_logging(&config.logging, &config.reports_dir());
            run_supervisor(config).await?;
        }
        Commands::Status => {
            init_logging_simple();
            cli::show_status(&config)?;
        }
        Commands::CheckHeartbeat => {
            init_logging_simple();
            let verdict = cli::check_heartbeat(&config);
            println!("{}", verdict.reason());
            if !verdict.is_healthy() {
                std::process::exit(1);
            }
        }
        Commands::Health => {
            init_logging_simple();
            cli::validate(&config)?;
            let snapshot = cli::collect_health(&config).await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Stop { force } => {
            init_logging_simple();
            cli::stop_supervisor(&config, force)?;
        }
    }

    Ok(())
}

async fn run_supervisor(config: AppConfig) -> anyhow::Result<()> {
    let shutdown = Arc::new(ShutdownCoordinator::new());
    install_signal_handlers(shutdown.clone());
    install_panic_hook(shutdown.clone());

    let supervisor = Supervisor::new(config, shutdown)?;
    match supervisor.run().await {
        Ok(()) => Ok(()),
        // single instance per repository; a second launch is not an error
        Err(GuardError::AlreadyRunning(lock)) => {
            info!(%lock, "another guard supervisor instance is already running, exiting");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "guard supervisor failed");
            Err(e.into())
        }
    }
}
