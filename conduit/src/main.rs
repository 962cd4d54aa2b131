#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use std::sync::Arc;

use args::Args;
use clap::Parser;
use conduit_config::Config;
use conduit_gateway::{BackgroundTasks, Gateway, HttpExecutor};
use conduit_server::Server;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(listen_address) = args.listen_address {
        config.server.listen_address = Some(listen_address);
    }

    let telemetry = conduit_telemetry::init(config.telemetry.as_ref(), &args.log)?;

    tracing::info!(
        config_path = %args.config.display(),
        store = ?config.store,
        "starting conduit"
    );

    let store = conduit_store::open(&config.store).await?;
    let gateway = Gateway::new(store, &config, Arc::new(HttpExecutor::default()));

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_clone.cancel();
    });

    let tasks = BackgroundTasks::spawn(&gateway, &config, &shutdown);
    let server = Server::new(&config, gateway);
    let served = server.serve(shutdown.clone()).await;

    // the listener may fail on its own; stop the jobs either way
    shutdown.cancel();
    tasks.join().await;
    if let Err(e) = telemetry.force_flush() {
        tracing::warn!(error = %e, "telemetry flush failed");
    }

    served?;
    tracing::info!("conduit stopped");
    Ok(())
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
