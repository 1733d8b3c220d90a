//! matineed — Matinee watch-together daemon.
//!
//! `matineed serve` runs the authority; `matineed connect <addr> <name>`
//! joins an existing session as a receiver. Either way the process drives
//! the playlist orchestrator on a fixed polling interval and logs the
//! application event stream.

use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::TcpListener;

use matinee_core::config::MatineeConfig;
use matinee_core::event::AppEvent;
use matinee_net::registry::ConnectionRegistry;
use matinee_net::session::{ClientSession, ServerSession};
use matinee_net::Context;
use matinee_playlist::probe::{self, InstantProbe};
use matinee_playlist::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = MatineeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MatineeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MatineeConfig::default()
    });

    let mode = std::env::args().nth(1).unwrap_or_else(|| "serve".into());
    let ctx = Context::new(config);
    let registry = ConnectionRegistry::new();
    registry.spawn_sweep(Duration::from_secs(1));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // Event stream log
    {
        let mut events = ctx.events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    AppEvent::Stats {
                        latency_micros,
                        queued_bytes,
                    } => tracing::debug!(latency_micros, queued_bytes, "stats"),
                    other => tracing::info!(event = ?other, "application event"),
                }
            }
        });
    }

    // The daemon has no demuxer attached; the probe seam reports a fixed
    // duration so playlist plumbing stays exercisable headless.
    let media_probe = probe::shared(InstantProbe { duration_secs: 0.0 });
    let mut orchestrator = Orchestrator::new(ctx.clone(), media_probe);

    match mode.as_str() {
        "serve" => {
            let bind = format!("{}:{}", ctx.config.network.bind_addr, ctx.config.network.port);
            let listener = TcpListener::bind(&bind)
                .await
                .with_context(|| format!("failed to bind {bind}"))?;
            tracing::info!(addr = %listener.local_addr()?, "matineed serving");

            let session = ServerSession::start(ctx.clone(), registry, listener)?;
            orchestrator.switch_server(session.clone());

            let poll = Duration::from_millis(ctx.config.session.poll_interval_ms);
            let orchestrator_task =
                tokio::spawn(orchestrator.run(poll, shutdown_tx.subscribe()));

            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => tracing::info!("shutting down"),
                r = orchestrator_task => tracing::error!("orchestrator exited: {r:?}"),
            }
            session.shutdown();
        }
        "connect" => {
            let addr = std::env::args()
                .nth(2)
                .context("usage: matineed connect <addr> <username>")?;
            let username = std::env::args().nth(3).unwrap_or_else(|| "guest".into());
            registry.allow_self_destruct();

            let password = ctx.config.playback.password.clone();
            let session =
                ClientSession::connect(ctx.clone(), &registry, &addr, &username, password).await?;
            tracing::info!(user_id = session.local_id(), peer = %addr, "connected");
            orchestrator.switch_client(session.clone());

            let poll = Duration::from_millis(ctx.config.session.poll_interval_ms);
            let orchestrator_task =
                tokio::spawn(orchestrator.run(poll, shutdown_tx.subscribe()));

            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => tracing::info!("shutting down"),
                r = orchestrator_task => tracing::error!("orchestrator exited: {r:?}"),
            }
            session.disconnect();
        }
        other => anyhow::bail!("unknown mode {other}, expected serve|connect"),
    }

    Ok(())
}
