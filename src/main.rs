use std::net::{Ipv4Addr, SocketAddr};

use accounts::config::Configuration;
use accounts::telemetry;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Configuration::default().from_env().read();

    let tracer = telemetry::init(&config.telemetry)?;
    let metrics = if config.telemetry.prometheus {
        Some(telemetry::setup_metrics_recorder()?)
    } else {
        None
    };

    let state = accounts::initialize_state(config.clone(), metrics).await?;
    let app = accounts::app(state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, name = %config.name, version = %config.version, "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "cannot listen for shutdown signal");
            }
        })
        .await?;

    if let Some(tracer) = tracer {
        tracer.shutdown()?;
    }

    Ok(())
}
