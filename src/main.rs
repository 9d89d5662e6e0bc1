use anyhow::Result;
use clap::Parser;
use shm_compute::cli::{self, Cli, Command};
use shm_compute::{init_logger, Config, Server};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    config.validate()?;

    init_logger(&config.log_level);

    match cli.command {
        Command::Serve => {
            let server = Server::new(config)?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Interrupt received, shutting down"),
                    Err(e) => error!("Cannot listen for interrupt: {}", e),
                }
                let _ = shutdown_tx.send(true);
            });

            let stats = server.run(shutdown_rx).await?;
            println!(
                "served {} requests on {} channels ({} unregistered, {} abandoned, {} protocol violations, {} failed)",
                stats.requests_served,
                stats.accepted,
                stats.unregistered,
                stats.abandoned,
                stats.protocol_violations,
                stats.failed
            );
        }

        Command::Call { name, operation } => {
            let response =
                tokio::task::spawn_blocking(move || cli::call(&config, name.as_deref(), &operation)).await??;
            println!("{}", cli::describe(&response));
        }

        Command::Init { path } => {
            Config::default().save_to_file(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}
