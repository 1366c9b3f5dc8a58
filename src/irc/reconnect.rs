use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::error::Result;

pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PING_TIMEOUT: Duration = Duration::from_secs(90);

/// The side of the connection the reconnect and liveness loops drive.
#[async_trait]
pub trait ConnectionControl: Send + Sync {
    fn is_connected(&self) -> bool;
    fn is_registered(&self) -> bool;
    /// Time since the last PONG, or since registration when none arrived yet.
    fn since_last_pong(&self) -> Option<Duration>;
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self, reason: &str);
    async fn send_ping(&self) -> Result<()>;
    /// Rejoins the channels held before the connection was lost.
    async fn rejoin_previous(&self);
    fn on_reconnect_failed(&self, _reason: &str, _attempt: u32, _retry_in: Duration) {}
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub monitor_interval: Duration,
    pub settle_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            monitor_interval: MONITOR_INTERVAL,
            settle_delay: SETTLE_DELAY,
        }
    }
}

struct ReconnectState {
    in_flight: bool,
    backoff: Duration,
    attempts: u32,
}

pub struct ReconnectionManager {
    target: Arc<dyn ConnectionControl>,
    config: ReconnectConfig,
    state: Mutex<ReconnectState>,
    cancel: CancellationToken,
}

impl ReconnectionManager {
    pub fn new(
        target: Arc<dyn ConnectionControl>,
        config: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let backoff = config.min_backoff;
        Arc::new(Self {
            target,
            config,
            state: Mutex::new(ReconnectState {
                in_flight: false,
                backoff,
                attempts: 0,
            }),
            cancel,
        })
    }

    pub fn in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    pub fn current_backoff(&self) -> Duration {
        self.state.lock().backoff
    }

    /// Polls connectivity and starts a reconnection when the link is down.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.target.is_connected() {
                        self.trigger_reconnect("connection lost");
                    }
                }
            }
        }
        tracing::debug!("Reconnection monitor stopped");
    }

    /// Starts a reconnection unless one is already running. Returns whether
    /// a new one was started.
    pub fn trigger_reconnect(self: &Arc<Self>, reason: &str) -> bool {
        {
            let mut state = self.state.lock();
            if state.in_flight {
                tracing::debug!(reason, "Reconnection already in progress");
                return false;
            }
            state.in_flight = true;
        }
        tracing::warn!(reason, "Starting reconnection");
        let manager = Arc::clone(self);
        let reason = reason.to_string();
        tokio::spawn(async move {
            manager.reconnect_loop(&reason).await;
            manager.state.lock().in_flight = false;
        });
        true
    }

    async fn reconnect_loop(&self, reason: &str) {
        loop {
            self.target.disconnect(reason).await;
            if self.sleep_or_cancel(self.config.settle_delay).await {
                return;
            }

            match self.target.connect().await {
                Ok(()) => {
                    let attempts = {
                        let mut state = self.state.lock();
                        state.backoff = self.config.min_backoff;
                        std::mem::take(&mut state.attempts)
                    };
                    tracing::info!(outcome = "success", failed_attempts = attempts, "Reconnected");
                    self.target.rejoin_previous().await;
                    return;
                }
                Err(e) => {
                    let (delay, attempt) = {
                        let mut state = self.state.lock();
                        state.attempts += 1;
                        let delay = state.backoff;
                        state.backoff = (state.backoff * 2).min(self.config.max_backoff);
                        (delay, state.attempts)
                    };
                    tracing::error!(error = %e, attempt, retry_in_secs = delay.as_secs(), "Reconnection attempt failed");
                    self.target.on_reconnect_failed(&e.to_string(), attempt, delay);
                    if self.sleep_or_cancel(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true when cancelled before `delay` elapsed.
    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

/// Sends PINGs while registered and forces a reconnect when PONGs stop.
pub struct PingMonitor {
    target: Arc<dyn ConnectionControl>,
    reconnect: Arc<ReconnectionManager>,
    interval: Duration,
    timeout: Duration,
}

impl PingMonitor {
    pub fn new(target: Arc<dyn ConnectionControl>, reconnect: Arc<ReconnectionManager>) -> Self {
        Self::with_timing(target, reconnect, PING_INTERVAL, PING_TIMEOUT)
    }

    pub fn with_timing(
        target: Arc<dyn ConnectionControl>,
        reconnect: Arc<ReconnectionManager>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            target,
            reconnect,
            interval,
            timeout,
        }
    }

    /// One liveness sample. Returns true when a reconnect was forced.
    pub async fn check(&self) -> bool {
        if !self.target.is_registered() {
            return false;
        }
        match self.target.since_last_pong() {
            Some(silence) if silence > self.timeout => {
                tracing::warn!(silence_secs = silence.as_secs(), "Ping timeout");
                self.reconnect.trigger_reconnect("ping timeout");
                true
            }
            _ => {
                if let Err(e) = self.target.send_ping().await {
                    tracing::debug!(error = %e, "Failed to send liveness PING");
                }
                false
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
        tracing::debug!("Ping monitor stopped");
    }
}
