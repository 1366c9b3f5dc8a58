use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::db::key;

#[derive(Debug, Clone)]
pub struct NetsplitConfig {
    pub quit_window: Duration,
    pub rejoin_window: Duration,
    pub threshold: usize,
    pub cooldown: Duration,
}

impl Default for NetsplitConfig {
    fn default() -> Self {
        Self {
            quit_window: Duration::from_secs(5),
            rejoin_window: Duration::from_secs(10),
            threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetsplitEvent {
    Detected { nicks: Vec<String> },
    Recovered { nicks: Vec<String> },
}

pub trait NetsplitObserver: Send + Sync {
    fn on_netsplit_event(&self, event: &NetsplitEvent);
}

#[derive(Default)]
struct Windows {
    quits: HashMap<String, (String, Instant)>,
    joins: HashMap<String, Instant>,
    last_declared: Option<Instant>,
    split: Option<ActiveSplit>,
}

struct ActiveSplit {
    declared_at: Instant,
    nicks: HashSet<String>,
}

/// Tells a netsplit apart from ordinary churn by quit and join density.
pub struct NetsplitDetector {
    config: NetsplitConfig,
    windows: Mutex<Windows>,
    observers: Vec<Arc<dyn NetsplitObserver>>,
}

impl NetsplitDetector {
    pub fn new(config: NetsplitConfig, observers: Vec<Arc<dyn NetsplitObserver>>) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
            observers,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.windows.lock().split.is_some()
    }

    pub fn on_quit(&self, nick: &str) -> Option<NetsplitEvent> {
        self.on_quit_at(nick, Instant::now())
    }

    /// How long a declared split waits for its users before it is dropped.
    fn split_horizon(&self) -> Duration {
        self.config.cooldown + self.config.rejoin_window
    }

    fn expire_split(&self, windows: &mut Windows, now: Instant) {
        let horizon = self.split_horizon();
        if let Some(split) = windows
            .split
            .take_if(|split| now.duration_since(split.declared_at) > horizon)
        {
            tracing::info!(users = split.nicks.len(), "Netsplit expired without recovery");
        }
    }

    /// True when `nick` quit recently or is waiting out a declared split.
    pub fn recently_quit(&self, nick: &str) -> bool {
        let windows = self.windows.lock();
        windows.quits.contains_key(&key(nick))
            || windows
                .split
                .as_ref()
                .is_some_and(|split| split.nicks.iter().any(|n| n.eq_ignore_ascii_case(nick)))
    }

    /// Forgets every window and any declared split.
    pub fn reset(&self) {
        *self.windows.lock() = Windows::default();
    }

    pub fn on_quit_at(&self, nick: &str, now: Instant) -> Option<NetsplitEvent> {
        let event = {
            let mut windows = self.windows.lock();
            self.expire_split(&mut windows, now);
            windows.quits.insert(key(nick), (nick.to_string(), now));

            let recent: Vec<String> = windows
                .quits
                .values()
                .filter(|(_, at)| now.duration_since(*at) <= self.config.quit_window)
                .map(|(nick, _)| nick.clone())
                .collect();

            if let Some(split) = windows.split.as_mut() {
                split.nicks.insert(nick.to_string());
                None
            } else if recent.len() < self.config.threshold {
                None
            } else if windows
                .last_declared
                .is_some_and(|at| now.duration_since(at) < self.config.cooldown)
            {
                tracing::debug!(quits = recent.len(), "Quit burst inside netsplit cooldown");
                None
            } else {
                windows.last_declared = Some(now);
                windows.split = Some(ActiveSplit {
                    declared_at: now,
                    nicks: recent.iter().cloned().collect(),
                });
                let mut nicks = recent;
                nicks.sort();
                tracing::warn!(users = nicks.len(), "Netsplit detected");
                Some(NetsplitEvent::Detected { nicks })
            }
        };
        self.notify(event)
    }

    pub fn on_join(&self, nick: &str) -> Option<NetsplitEvent> {
        self.on_join_at(nick, Instant::now())
    }

    pub fn on_join_at(&self, nick: &str, now: Instant) -> Option<NetsplitEvent> {
        let event = {
            let mut windows = self.windows.lock();
            self.expire_split(&mut windows, now);
            windows.joins.insert(key(nick), now);

            let Some(split) = windows.split.as_ref() else {
                return None;
            };
            let rejoined = windows
                .joins
                .values()
                .filter(|at| **at >= split.declared_at)
                .filter(|at| now.duration_since(**at) <= self.config.rejoin_window)
                .count();
            if rejoined < self.config.threshold {
                None
            } else {
                let split = windows.split.take();
                let mut nicks: Vec<String> = split
                    .map(|split| split.nicks.into_iter().collect())
                    .unwrap_or_default();
                nicks.sort();
                tracing::info!(users = nicks.len(), "Netsplit recovered");
                Some(NetsplitEvent::Recovered { nicks })
            }
        };
        self.notify(event)
    }

    fn notify(&self, event: Option<NetsplitEvent>) -> Option<NetsplitEvent> {
        if let Some(event) = &event {
            for observer in &self.observers {
                observer.on_netsplit_event(event);
            }
        }
        event
    }

    /// Evicts timestamps older than twice their window.
    pub fn sweep_at(&self, now: Instant) {
        let mut windows = self.windows.lock();
        self.expire_split(&mut windows, now);
        let quit_horizon = self.config.quit_window * 2;
        let join_horizon = self.config.rejoin_window * 2;
        windows
            .quits
            .retain(|_, (_, at)| now.duration_since(*at) <= quit_horizon);
        windows
            .joins
            .retain(|_, at| now.duration_since(*at) <= join_horizon);
    }

    pub fn tracked(&self) -> (usize, usize) {
        let windows = self.windows.lock();
        (windows.quits.len(), windows.joins.len())
    }

    /// Sweeps on `interval` until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep_at(Instant::now()),
            }
        }
        tracing::debug!("Netsplit sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<NetsplitEvent>>);

    impl NetsplitObserver for Recorder {
        fn on_netsplit_event(&self, event: &NetsplitEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn detector() -> (NetsplitDetector, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let detector = NetsplitDetector::new(NetsplitConfig::default(), vec![recorder.clone()]);
        (detector, recorder)
    }

    #[test]
    fn test_three_quits_in_window_declare_netsplit() {
        let (detector, recorder) = detector();
        let t0 = Instant::now();
        assert_eq!(detector.on_quit_at("a", t0), None);
        assert_eq!(detector.on_quit_at("b", t0 + Duration::from_secs(1)), None);
        let event = detector.on_quit_at("c", t0 + Duration::from_secs(2));
        assert_eq!(
            event,
            Some(NetsplitEvent::Detected {
                nicks: vec!["a".into(), "b".into(), "c".into()]
            })
        );
        assert_eq!(recorder.0.lock().len(), 1);
        assert!(detector.in_progress());
    }

    #[test]
    fn test_cooldown_suppresses_redeclaration() {
        let (detector, recorder) = detector();
        let t0 = Instant::now();
        for (i, nick) in ["a", "b", "c"].into_iter().enumerate() {
            detector.on_quit_at(nick, t0 + Duration::from_secs(i as u64));
        }
        for nick in ["a", "b", "c"] {
            detector.on_join_at(nick, t0 + Duration::from_secs(8));
        }
        assert!(!detector.in_progress());

        let t1 = t0 + Duration::from_secs(20);
        assert_eq!(detector.on_quit_at("d", t1), None);
        assert_eq!(detector.on_quit_at("e", t1), None);
        assert_eq!(detector.on_quit_at("f", t1), None, "cooldown still running");
        let detections = recorder
            .0
            .lock()
            .iter()
            .filter(|e| matches!(e, NetsplitEvent::Detected { .. }))
            .count();
        assert_eq!(detections, 1);
    }

    #[test]
    fn test_fourth_quit_outside_window_does_not_redeclare() {
        let (detector, _) = detector();
        let t0 = Instant::now();
        detector.on_quit_at("a", t0);
        detector.on_quit_at("b", t0);
        assert!(detector.on_quit_at("c", t0).is_some());
        assert_eq!(detector.on_quit_at("d", t0 + Duration::from_secs(20)), None);
    }

    #[test]
    fn test_slow_churn_is_not_a_netsplit() {
        let (detector, recorder) = detector();
        let t0 = Instant::now();
        for i in 0..10u64 {
            detector.on_quit_at(&format!("u{i}"), t0 + Duration::from_secs(i * 3));
        }
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn test_recovery_reports_affected_nicks() {
        let (detector, recorder) = detector();
        let t0 = Instant::now();
        for nick in ["a", "b", "c"] {
            detector.on_quit_at(nick, t0);
        }
        detector.on_quit_at("d", t0 + Duration::from_secs(1));
        detector.on_join_at("a", t0 + Duration::from_secs(30));
        detector.on_join_at("b", t0 + Duration::from_secs(31));
        let event = detector.on_join_at("d", t0 + Duration::from_secs(32));
        assert_eq!(
            event,
            Some(NetsplitEvent::Recovered {
                nicks: vec!["a".into(), "b".into(), "c".into(), "d".into()]
            })
        );
        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[test]
    fn test_joins_before_the_split_do_not_count() {
        let (detector, _) = detector();
        let t0 = Instant::now();
        for nick in ["x", "y", "z"] {
            detector.on_join_at(nick, t0);
        }
        for nick in ["a", "b", "c"] {
            detector.on_quit_at(nick, t0 + Duration::from_secs(1));
        }
        assert_eq!(detector.on_join_at("a", t0 + Duration::from_secs(2)), None);
        assert!(detector.in_progress());
    }

    #[test]
    fn test_unrecovered_split_expires_and_a_later_burst_is_declared() {
        let (detector, recorder) = detector();
        let t0 = Instant::now();
        for nick in ["a", "b", "c"] {
            detector.on_quit_at(nick, t0);
        }
        detector.on_join_at("a", t0 + Duration::from_secs(5));
        assert!(detector.in_progress());

        let later = t0 + Duration::from_secs(600);
        for nick in ["d", "e"] {
            assert_eq!(detector.on_quit_at(nick, later), None);
        }
        assert!(!detector.in_progress(), "stale split is dropped on the next quit");
        assert_eq!(
            detector.on_quit_at("f", later),
            Some(NetsplitEvent::Detected {
                nicks: vec!["d".into(), "e".into(), "f".into()]
            })
        );
        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[test]
    fn test_sweep_expires_split_and_reset_clears_everything() {
        let (detector, _) = detector();
        let t0 = Instant::now();
        for nick in ["a", "b", "c"] {
            detector.on_quit_at(nick, t0);
        }
        assert!(detector.recently_quit("A"));
        detector.sweep_at(t0 + Duration::from_secs(39));
        assert!(detector.in_progress());
        assert!(detector.recently_quit("a"), "split members stay recognisable");
        detector.sweep_at(t0 + Duration::from_secs(41));
        assert!(!detector.in_progress());
        assert!(!detector.recently_quit("a"));

        for nick in ["x", "y", "z"] {
            detector.on_quit_at(nick, t0 + Duration::from_secs(100));
        }
        assert!(detector.in_progress());
        detector.reset();
        assert!(!detector.in_progress());
        assert_eq!(detector.tracked(), (0, 0));
    }

    #[test]
    fn test_sweep_evicts_old_entries() {
        let (detector, _) = detector();
        let t0 = Instant::now();
        detector.on_quit_at("a", t0);
        detector.on_join_at("b", t0);
        detector.sweep_at(t0 + Duration::from_secs(11));
        assert_eq!(detector.tracked(), (0, 1));
        detector.sweep_at(t0 + Duration::from_secs(21));
        assert_eq!(detector.tracked(), (0, 0));
    }
}
