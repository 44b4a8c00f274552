use anyhow::Result;
use clap::Parser;
use snapferry_daemon::cli::{Cli, Command, LogFormat};
use snapferry_daemon::DaemonConfig;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match &cli.command {
        Command::Serve { config } => {
            let config = DaemonConfig::load(config)?;
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("interrupt received");
                        signal.cancel();
                    }
                    Err(e) => tracing::error!("cannot listen for interrupt: {}", e),
                }
            });
            snapferry_daemon::serve(config, shutdown).await
        }
        _ => cli.run().await,
    }
}
