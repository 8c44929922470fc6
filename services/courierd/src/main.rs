// Broker daemon entry point.
mod config;
mod observability;

use anyhow::{Context, Result};
use config::DaemonConfig;
use courier_broker::{Broker, BrokerConfig};
use courier_kv::RedisBus;
use courier_wire::BusMessage;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let daemon_config = DaemonConfig::from_env().context("load daemon config")?;
    observability::init_logging();
    let metrics_handle = observability::install_metrics_recorder()?;

    let bus = RedisBus::connect(&daemon_config.redis_address)
        .await
        .context("connect to kv store")?;
    let mut broker = Broker::spawn(
        Arc::new(bus),
        BrokerConfig {
            source_key: daemon_config.source_key.clone(),
            registration_timeout: daemon_config.registration_timeout,
        },
    );
    tracing::info!(source_key = %daemon_config.source_key, "broker started");

    let metrics_app = observability::metrics_router(metrics_handle);
    let metrics_addr = daemon_config.metrics_bind;
    let metrics_task = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(metrics_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(error = %err, addr = %metrics_addr, "failed to bind metrics listener");
                return;
            }
        };
        if let Err(err) = axum::serve(listener, metrics_app.into_make_service()).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });
    tracing::info!(addr = %metrics_addr, "metrics listener started");

    // Drain the update-environment stream; the orchestration layer watching
    // these logs launches the per-environment provisioners.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = broker.next_update() => match update {
                Some(payload) => {
                    if let Ok(message) = BusMessage::parse(&payload) {
                        tracing::info!(
                            environment = %message.environment_id(),
                            "update-environment envelope routed"
                        );
                    }
                }
                None => break,
            }
        }
    }

    broker.shutdown();
    metrics_task.abort();
    tracing::info!("broker stopped");
    Ok(())
}
