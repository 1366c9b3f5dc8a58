use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConnectionStatus {
    Initializing,
    Connecting {
        attempt: u32,
    },
    Authenticating {
        attempt: u32,
    },
    Registered {
        nick: String,
    },
    Reconnecting {
        reason: String,
        failed_attempt: u32,
        retry_in: Duration,
    },
    Disconnected {
        reason: String,
    },
}

impl ConnectionStatus {
    pub fn is_registered(&self) -> bool {
        matches!(self, ConnectionStatus::Registered { .. })
    }
}

/// A chat line addressed to a channel the bot sits in, or to the bot itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub target: String,
    pub sender_nick: String,
    pub sender_user: Option<String>,
    pub sender_host: Option<String>,
    pub text: String,
    /// Where a reply should go: the channel, or the sender for queries.
    pub reply_to: String,
    pub timestamp: DateTime<Utc>,
}

impl PrivateMessage {
    pub fn is_channel_message(&self) -> bool {
        super::irc_parser::is_channel(&self.target)
    }
}

/// Receives every chat message that is not a CTCP request.
///
/// Each call runs on its own task, so a slow handler never holds up the
/// connection's read loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: PrivateMessage);
}

/// Handler that only logs, used when no command layer is configured.
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: PrivateMessage) {
        tracing::info!(
            irc.target = %message.target,
            irc.nick = %message.sender_nick,
            "{}",
            message.text
        );
    }
}
