use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::ctcp;
use super::irc_parser::{CMD_NOTICE, CMD_PRIVMSG, MAX_LINE_LEN};
use super::splitter::split;
use super::transport::Transport;
use super::types::ConnectionStatus;

/// Room left for the `:nick!user@host ` source the server prepends when it
/// relays our line: nick 30, user 10, host 63, plus the separators.
pub const SOURCE_PREFIX_ALLOWANCE: usize = 30 + 10 + 63 + 4;
pub const SPLIT_CLEANUP_DELAY: Duration = Duration::from_secs(30);
const UNDELIVERED_NOTICE_WAIT: Duration = Duration::from_secs(300);
const UNDELIVERED_NOTICE: &str = "Sorry, a reply could not be delivered.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitSendError {
    #[error("Only {sent} of {total} parts were delivered")]
    Partial { id: Uuid, sent: usize, total: usize },
    #[error("None of the {total} parts could be delivered")]
    AllFailed { id: Uuid, total: usize },
}

/// One multi-part send, kept for observability.
#[derive(Debug, Clone)]
pub struct SplitState {
    pub id: Uuid,
    pub target: String,
    pub parts: Vec<String>,
    pub next_part: usize,
    pub sent_at: Vec<DateTime<Utc>>,
    /// `None` while in flight, then whether every part went out.
    pub succeeded: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub id: Uuid,
    pub parts: usize,
}

/// Byte budget for the text of one `COMMAND target :text` line.
pub fn text_budget(command: &str, target: &str) -> usize {
    let overhead = command.len() + 1 + target.len() + 2 + 2 + SOURCE_PREFIX_ALLOWANCE;
    MAX_LINE_LEN.saturating_sub(overhead).max(1)
}

/// Sends chat text, splitting it to fit the protocol line limit.
pub struct Outbound {
    transport: Arc<Transport>,
    status: watch::Receiver<ConnectionStatus>,
    splits: Arc<Mutex<HashMap<Uuid, SplitState>>>,
    cleanups: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    cleanup_delay: Duration,
}

impl Outbound {
    pub fn new(transport: Arc<Transport>, status: watch::Receiver<ConnectionStatus>) -> Self {
        Self::with_cleanup_delay(transport, status, SPLIT_CLEANUP_DELAY)
    }

    pub fn with_cleanup_delay(
        transport: Arc<Transport>,
        status: watch::Receiver<ConnectionStatus>,
        cleanup_delay: Duration,
    ) -> Self {
        Self {
            transport,
            status,
            splits: Arc::new(Mutex::new(HashMap::new())),
            cleanups: Arc::new(Mutex::new(HashMap::new())),
            cleanup_delay,
        }
    }

    pub async fn send_message(&self, target: &str, text: &str) -> Result<SendReport, SplitSendError> {
        let parts = prepare_parts(text, text_budget(CMD_PRIVMSG, target), |part| part.to_string());
        self.send_parts(CMD_PRIVMSG, target, parts).await
    }

    pub async fn send_notice(&self, target: &str, text: &str) -> Result<SendReport, SplitSendError> {
        let parts = prepare_parts(text, text_budget(CMD_NOTICE, target), |part| part.to_string());
        self.send_parts(CMD_NOTICE, target, parts).await
    }

    pub async fn send_action(&self, target: &str, text: &str) -> Result<SendReport, SplitSendError> {
        let wrapper = ctcp::encode("ACTION", Some("")).len();
        let budget = text_budget(CMD_PRIVMSG, target).saturating_sub(wrapper).max(1);
        let parts = prepare_parts(text, budget, |part| ctcp::encode("ACTION", Some(part)));
        self.send_parts(CMD_PRIVMSG, target, parts).await
    }

    pub fn split_states(&self) -> Vec<SplitState> {
        self.splits.lock().values().cloned().collect()
    }

    async fn send_parts(
        &self,
        command: &str,
        target: &str,
        parts: Vec<String>,
    ) -> Result<SendReport, SplitSendError> {
        let id = Uuid::new_v4();
        let total = parts.len();
        if total == 0 {
            return Ok(SendReport { id, parts: 0 });
        }
        self.splits.lock().insert(
            id,
            SplitState {
                id,
                target: target.to_string(),
                parts: parts.clone(),
                next_part: 0,
                sent_at: Vec::with_capacity(total),
                succeeded: None,
            },
        );

        let mut failure = None;
        for (index, part) in parts.iter().enumerate() {
            match self.transport.write(&format!("{command} {target} :{part}")).await {
                Ok(()) => {
                    if let Some(state) = self.splits.lock().get_mut(&id) {
                        state.next_part = index + 1;
                        state.sent_at.push(Utc::now());
                    }
                }
                Err(e) => {
                    tracing::warn!(irc.target = %target, part = index + 1, total, error = %e, "Failed to send message part");
                    failure = Some(index);
                    break;
                }
            }
        }

        if let Some(state) = self.splits.lock().get_mut(&id) {
            state.succeeded = Some(failure.is_none());
        }
        self.schedule_cleanup(id);

        match failure {
            None => Ok(SendReport { id, parts: total }),
            Some(0) => {
                self.notice_when_back(target);
                Err(SplitSendError::AllFailed { id, total })
            }
            Some(sent) => Err(SplitSendError::Partial { id, sent, total }),
        }
    }

    /// Removes the finished state for `id` after the cleanup delay.
    /// Rescheduling the same id restarts its timer.
    fn schedule_cleanup(&self, id: Uuid) {
        let splits = Arc::clone(&self.splits);
        let cleanups = Arc::clone(&self.cleanups);
        let delay = self.cleanup_delay;
        let mut pending = self.cleanups.lock();
        if let Some(previous) = pending.remove(&id) {
            previous.abort();
        }
        pending.insert(
            id,
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                splits.lock().remove(&id);
                cleanups.lock().remove(&id);
            }),
        );
    }

    fn notice_when_back(&self, target: &str) {
        let transport = Arc::clone(&self.transport);
        let mut status = self.status.clone();
        let target = target.to_string();
        tokio::spawn(async move {
            let back = tokio::time::timeout(
                UNDELIVERED_NOTICE_WAIT,
                status.wait_for(ConnectionStatus::is_registered),
            )
            .await
            .is_ok_and(|registered| registered.is_ok());
            if !back {
                tracing::warn!(irc.target = %target, "Dropping undelivered-message notice");
                return;
            }
            let line = format!("{CMD_NOTICE} {target} :{UNDELIVERED_NOTICE}");
            if let Err(e) = transport.write(&line).await {
                tracing::warn!(irc.target = %target, error = %e, "Failed to send undelivered-message notice");
            }
        });
    }
}

fn prepare_parts(text: &str, budget: usize, wrap: impl Fn(&str) -> String) -> Vec<String> {
    text.split(['\r', '\n'])
        .filter(|line| !line.trim().is_empty())
        .flat_map(|line| split(line, budget))
        .filter(|part| !part.is_empty())
        .map(|part| wrap(&part))
        .collect()
}
