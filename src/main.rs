use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use metals_processor::{
    kafka::KafkaConnector,
    metrics::ProcessorMetrics,
    processor::Processor,
    settings::Settings,
    state::SharedState,
    status,
    store::MongoConnector,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let settings = Settings::new(args.config.as_deref()).context("cannot load config")?;
    let metrics = ProcessorMetrics::new().context("registering metrics")?;
    let state = Arc::new(SharedState::new(metrics));
    let cancel = CancellationToken::new();

    info!("starting metals processor");
    let listener = status::bind(settings.status_addr()?).await?;
    let status = tokio::spawn({
        let (state, cancel) = (state.clone(), cancel.clone());
        async move {
            if let Err(e) = status::serve(listener, state, cancel).await {
                error!("status server stopped: {e:#}");
            }
        }
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    let processor = Processor::new(
        KafkaConnector::new(settings.kafka()),
        MongoConnector::new(settings.mongo()),
        settings.processor(),
        settings.processor_id(),
        state,
        cancel.clone(),
    );
    processor.run().await;

    cancel.cancel();
    if let Err(e) = status.await {
        error!("status server task: {e}");
    }
    info!("stopped");
    Ok(())
}

/// `LOG_LEVEL` takes precedence over `RUST_LOG`
fn init_tracing() {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("listening for ctrl-c: {e}");
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
                error!("listening for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
