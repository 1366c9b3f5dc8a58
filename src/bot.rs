use std::sync::Arc;

use async_trait::async_trait;

use crate::breaker::BreakerError;
use crate::command_service::{CommandRequest, GuardedCommandService};
use crate::irc::outbound::Outbound;
use crate::irc::types::{MessageHandler, PrivateMessage};

pub const UNAVAILABLE_REPLY: &str = "The command service is unavailable right now, try again later.";
pub const FAILED_REPLY: &str = "That command failed.";

/// Relays prefixed chat commands to the external command service.
pub struct CommandRelay {
    prefix: String,
    service: Arc<GuardedCommandService>,
    outbound: Arc<Outbound>,
}

impl CommandRelay {
    pub fn new(prefix: impl Into<String>, service: Arc<GuardedCommandService>, outbound: Arc<Outbound>) -> Self {
        Self {
            prefix: prefix.into(),
            service,
            outbound,
        }
    }

    fn parse(&self, message: &PrivateMessage) -> Option<CommandRequest> {
        let rest = message.text.trim().strip_prefix(self.prefix.as_str())?;
        let mut words = rest.split_whitespace();
        let command = words.next()?.to_lowercase();
        let hostmask = match (&message.sender_user, &message.sender_host) {
            (Some(user), Some(host)) => Some(format!("{}!{user}@{host}", message.sender_nick)),
            _ => None,
        };
        Some(CommandRequest {
            command,
            args: words.map(str::to_string).collect(),
            nick: message.sender_nick.clone(),
            hostmask,
            channel: message
                .is_channel_message()
                .then(|| message.target.clone()),
        })
    }

    async fn reply(&self, target: &str, text: &str, notice: bool) {
        let result = if notice {
            self.outbound.send_notice(target, text).await
        } else {
            self.outbound.send_message(target, text).await
        };
        if let Err(e) = result {
            tracing::warn!(irc.target = %target, error = %e, "Failed to deliver command reply");
        }
    }
}

#[async_trait]
impl MessageHandler for CommandRelay {
    async fn handle(&self, message: PrivateMessage) {
        let Some(request) = self.parse(&message) else {
            return;
        };
        tracing::debug!(irc.nick = %request.nick, command = %request.command, "Relaying command");

        match self.service.execute(&request).await {
            Ok(reply) => {
                if let Some(text) = reply.reply {
                    self.reply(&message.reply_to, &text, reply.notice).await;
                }
            }
            Err(BreakerError::Open) => {
                tracing::info!(command = %request.command, "Command rejected, circuit open");
                self.reply(&message.reply_to, UNAVAILABLE_REPLY, true).await;
            }
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(command = %request.command, error = %e, "Command service call failed");
                self.reply(&message.reply_to, FAILED_REPLY, true).await;
            }
        }
    }
}
