use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::error::Result;
use super::irc_parser::CMD_JOIN;
use super::transport::Transport;
use crate::db::key;

pub const REJOIN_FLOOR: Duration = Duration::from_secs(5);
pub const REJOIN_MAX: Duration = Duration::from_secs(300);

#[async_trait]
pub trait JoinSender: Send + Sync {
    async fn send_join(&self, channel: &str) -> Result<()>;
}

#[async_trait]
impl JoinSender for Transport {
    async fn send_join(&self, channel: &str) -> Result<()> {
        self.write(&format!("{CMD_JOIN} {channel}")).await
    }
}

struct ChannelBackoff {
    next_delay: Duration,
    banned: bool,
    pending: Option<JoinHandle<()>>,
}

/// Per-channel rejoin backoff after kicks and bans.
///
/// The delay doubles on every scheduled rejoin and only drops back to the
/// floor once a JOIN for the channel is confirmed by the server.
pub struct RejoinScheduler {
    floor: Duration,
    max: Duration,
    channels: Mutex<HashMap<String, ChannelBackoff>>,
}

impl RejoinScheduler {
    pub fn new(floor: Duration, max: Duration) -> Arc<Self> {
        Arc::new(Self {
            floor,
            max: max.max(floor),
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Schedules a rejoin of `channel`, replacing any rejoin already
    /// pending for it. Returns the delay used, or `None` when the channel is
    /// flagged banned.
    pub fn schedule(self: &Arc<Self>, channel: &str, sender: Arc<dyn JoinSender>) -> Option<Duration> {
        let mut channels = self.channels.lock();
        let entry = channels.entry(key(channel)).or_insert_with(|| ChannelBackoff {
            next_delay: self.floor,
            banned: false,
            pending: None,
        });
        if entry.banned {
            tracing::info!(channel.name = %channel, "Channel flagged banned, not rejoining");
            return None;
        }

        let delay = entry.next_delay;
        entry.next_delay = (delay * 2).min(self.max);
        if let Some(pending) = entry.pending.take() {
            pending.abort();
        }

        let scheduler = Arc::clone(self);
        let name = channel.to_string();
        entry.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if scheduler.is_banned(&name) {
                return;
            }
            tracing::info!(channel.name = %name, "Attempting rejoin");
            if let Err(e) = sender.send_join(&name).await {
                tracing::warn!(channel.name = %name, error = %e, "Rejoin failed to send");
            }
        }));
        tracing::info!(channel.name = %channel, delay_secs = delay.as_secs(), "Rejoin scheduled");
        Some(delay)
    }

    /// A JOIN for `channel` was confirmed; its backoff returns to the floor.
    pub fn on_joined(&self, channel: &str) {
        if let Some(entry) = self.channels.lock().get_mut(&key(channel)) {
            entry.next_delay = self.floor;
            entry.pending = None;
        }
    }

    pub fn flag_banned(&self, channel: &str, banned: bool) {
        let mut channels = self.channels.lock();
        let entry = channels.entry(key(channel)).or_insert_with(|| ChannelBackoff {
            next_delay: self.floor,
            banned,
            pending: None,
        });
        entry.banned = banned;
        if banned && let Some(pending) = entry.pending.take() {
            pending.abort();
        }
    }

    pub fn is_banned(&self, channel: &str) -> bool {
        self.channels
            .lock()
            .get(&key(channel))
            .is_some_and(|entry| entry.banned)
    }

    pub fn next_delay(&self, channel: &str) -> Duration {
        self.channels
            .lock()
            .get(&key(channel))
            .map_or(self.floor, |entry| entry.next_delay)
    }

    /// Drops every pending rejoin; the backoff levels are kept.
    pub fn cancel_pending(&self) {
        for entry in self.channels.lock().values_mut() {
            if let Some(pending) = entry.pending.take() {
                pending.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl JoinSender for Recorder {
        async fn send_join(&self, channel: &str) -> Result<()> {
            self.0.lock().push(channel.to_string());
            Ok(())
        }
    }

    fn scheduler() -> (Arc<RejoinScheduler>, Arc<Recorder>) {
        (RejoinScheduler::new(REJOIN_FLOOR, Duration::from_secs(20)), Arc::new(Recorder::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_caps() {
        let (scheduler, recorder) = scheduler();
        let delays: Vec<_> = (0..4)
            .filter_map(|_| scheduler.schedule("#rust", recorder.clone()))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(20)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_fires_after_delay() {
        let (scheduler, recorder) = scheduler();
        scheduler.schedule("#rust", recorder.clone());
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(recorder.0.lock().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*recorder.0.lock(), vec!["#rust"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_join_and_keeps_channel_name() {
        let (scheduler, recorder) = scheduler();
        scheduler.schedule("#Rust", recorder.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.schedule("#rust", recorder.clone());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*recorder.0.lock(), vec!["#rust"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_only_on_confirmed_join() {
        let (scheduler, recorder) = scheduler();
        scheduler.schedule("#rust", recorder.clone());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(scheduler.next_delay("#rust"), Duration::from_secs(10));

        scheduler.on_joined("#RUST");
        assert_eq!(scheduler.next_delay("#rust"), REJOIN_FLOOR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_channel_is_skipped() {
        let (scheduler, recorder) = scheduler();
        scheduler.schedule("#rust", recorder.clone());
        scheduler.flag_banned("#rust", true);
        assert_eq!(scheduler.schedule("#rust", recorder.clone()), None);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(recorder.0.lock().is_empty());

        scheduler.flag_banned("#rust", false);
        assert!(scheduler.schedule("#rust", recorder.clone()).is_some());
    }
}
