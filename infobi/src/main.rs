use clap::Parser;
use infobi::{Application, Config, config::Args, telemetry};
use tokio::signal;

/// Resolves on Ctrl+C, or SIGTERM on unix. A signal handler that cannot be installed leaves
/// the other one in charge.
async fn termination() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Ctrl+C handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => tracing::info!("Interrupted, draining in-flight queries"),
        _ = terminate => tracing::info!("Terminated, draining in-flight queries"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!(
            "Configuration is valid: {} connection(s), {} report(s).",
            config.connections.len(),
            config.reports.len()
        );
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;
    tracing::debug!(config = %args.config, "Loaded configuration");

    Application::new(config)?.serve(termination()).await
}
