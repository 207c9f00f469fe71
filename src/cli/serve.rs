//! `bothost serve` - run the supervisor.

use std::sync::Arc;

use crate::config::Config;
use crate::db::connect_from_config;
use crate::gateway::DiscordGateway;
use crate::lifecycle::InstanceRuntime;

pub async fn run_serve(start: Vec<String>) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let store = connect_from_config(&config.database).await?;
    let gateway = Arc::new(DiscordGateway::new(&config.gateway)?);
    let runtime = InstanceRuntime::from_config(&config, store, gateway);

    tracing::info!(
        backend = config.database.backend.as_str(),
        enforce_validation = config.sandbox.enforce_validation,
        "bothost supervisor starting"
    );

    if config.resume_active {
        let started = runtime.resume_active().await?;
        tracing::info!(started, "Resumed previously active instances");
    }
    let corrected = runtime.reconcile().await?;
    if corrected > 0 {
        tracing::info!(corrected, "Persisted active flags reconciled");
    }

    for id in &start {
        if !runtime.start(id).await {
            tracing::warn!(id = %id, "Instance did not start");
        }
    }

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutdown signal received");
    for live in runtime.registry().summaries().await {
        tracing::info!(
            id = %live.id,
            name = %live.name,
            bot_user = %live.username,
            uptime_secs = (chrono::Utc::now() - live.started_at).num_seconds(),
            "Stopping instance"
        );
    }
    runtime.stop_all().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
