// src/main.rs

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// --- Module Declarations ---
mod bot;
mod breaker;
mod command_service;
mod config;
mod db;
mod error;
mod irc;

// --- Imports ---
use crate::bot::CommandRelay;
use crate::breaker::CircuitBreaker;
use crate::command_service::{GuardedCommandService, HEALTH_PROBE_INTERVAL, HttpCommandService};
use crate::config::load_settings;
use crate::db::MemoryChannelStore;
use crate::error::Result as AppResult;
use crate::irc::reconnect::{ConnectionControl, PING_INTERVAL};
use crate::irc::{
    ConnectionManager, ConnectionStatus, LoggingHandler, MessageHandler, Outbound, PingMonitor,
    ReconnectionManager,
};

const NETSPLIT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> AppResult<()> {
    // Setup tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_PKG_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load Configuration
    let settings = load_settings()?;
    tracing::info!("Configuration loaded: {:?}", settings);

    let root = CancellationToken::new();
    let store = Arc::new(MemoryChannelStore::new());

    // The relay needs the connection's transport and status, and the
    // connection needs the handler, so the handler is bound late.
    let handler = Arc::new(LateHandler::default());
    let manager = ConnectionManager::new(
        settings.connection_config(),
        settings.transport_config(),
        settings.credentials(),
        store,
        handler.clone(),
        root.clone(),
    );

    let command_settings = &settings.command_service;
    let relay: Arc<dyn MessageHandler> = match &command_settings.url {
        Some(url) => {
            let http = HttpCommandService::new(url, Duration::from_secs(command_settings.timeout_secs))?;
            let breaker = Arc::new(CircuitBreaker::new(
                "command-service",
                command_settings.breaker_threshold,
                Duration::from_secs(command_settings.breaker_timeout_secs),
            ));
            let guarded = Arc::new(GuardedCommandService::new(Arc::new(http), breaker));
            tokio::spawn(guarded.clone().run_health_probe(HEALTH_PROBE_INTERVAL, root.clone()));
            let outbound = Arc::new(Outbound::new(manager.transport(), manager.status()));
            tracing::info!(url = %url, "Relaying commands to external service");
            Arc::new(CommandRelay::new(
                command_settings.command_prefix.clone(),
                guarded,
                outbound,
            ))
        }
        None => {
            tracing::info!("No command service configured, messages are only logged");
            Arc::new(LoggingHandler)
        }
    };
    handler.bind(relay);

    let control: Arc<dyn ConnectionControl> = manager.clone();
    let reconnect = ReconnectionManager::new(control.clone(), settings.reconnect_config(), root.clone());
    let ping = PingMonitor::new(control, reconnect.clone());

    tokio::spawn(manager.netsplit().run_sweeper(NETSPLIT_SWEEP_INTERVAL, root.clone()));
    tokio::spawn(log_status_changes(manager.status(), root.clone()));

    if let Err(e) = manager.connect().await {
        tracing::error!(error = %e, "Initial connection failed, reconnecting in the background");
        reconnect.trigger_reconnect("initial connection failed");
    }
    tokio::spawn(reconnect.clone().run());
    tokio::spawn(ping.run(root.clone()));
    tracing::info!(interval_secs = PING_INTERVAL.as_secs(), "Liveness monitoring started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    manager.quit("Shutting down").await;
    root.cancel();

    Ok(())
}

async fn log_status_changes(
    mut status: tokio::sync::watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                tracing::debug!(status = ?current, "Connection status changed");
            }
        }
    }
}

/// Forwards to a handler installed after construction.
#[derive(Default)]
struct LateHandler {
    inner: parking_lot::RwLock<Option<Arc<dyn MessageHandler>>>,
}

impl LateHandler {
    fn bind(&self, handler: Arc<dyn MessageHandler>) {
        *self.inner.write() = Some(handler);
    }
}

#[async_trait::async_trait]
impl MessageHandler for LateHandler {
    async fn handle(&self, message: irc::PrivateMessage) {
        let handler = self.inner.read().clone();
        match handler {
            Some(handler) => handler.handle(message).await,
            None => tracing::debug!("Message arrived before a handler was bound"),
        }
    }
}
