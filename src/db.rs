// src/db.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Case-folds a channel or nickname into a store key.
pub fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend unavailable: {0}")]
    Unavailable(String),
    #[error("Store write failed for {channel}: {reason}")]
    Write { channel: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMembership {
    pub channel: String,
    pub nick: String,
    pub is_op: bool,
    pub is_halfop: bool,
    pub is_voice: bool,
    pub hostmask: Option<String>,
    pub account: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelMembership {
    pub fn new(channel: &str, nick: &str) -> Self {
        let now = Utc::now();
        Self {
            channel: channel.to_string(),
            nick: nick.to_string(),
            is_op: false,
            is_halfop: false,
            is_voice: false,
            hostmask: None,
            account: None,
            joined_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotChannelStatus {
    pub channel: String,
    pub is_joined: bool,
    pub is_op: bool,
    pub is_halfop: bool,
    pub is_voice: bool,
    pub user_count: usize,
    pub op_count: usize,
    pub voice_count: usize,
    pub topic: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
}

impl BotChannelStatus {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            is_joined: false,
            is_op: false,
            is_halfop: false,
            is_voice: false,
            user_count: 0,
            op_count: 0,
            voice_count: 0,
            topic: None,
            joined_at: None,
        }
    }
}

/// Persistence seam for channel membership and the bot's own channel state.
///
/// Keys are case-insensitive. Membership mutations do not touch the derived
/// counts; callers follow each one with [`ChannelStore::recompute_counts`].
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn upsert_member(&self, member: ChannelMembership) -> Result<(), StoreError>;
    async fn upsert_members(
        &self,
        channel: &str,
        members: Vec<ChannelMembership>,
    ) -> Result<(), StoreError>;
    async fn remove_member(&self, channel: &str, nick: &str) -> Result<(), StoreError>;
    /// Removes `nick` from every channel, returning the channels it was in.
    async fn remove_nick_everywhere(&self, nick: &str) -> Result<Vec<String>, StoreError>;
    /// Renames `old` to `new` in every channel, returning the channels touched.
    async fn rename_nick(&self, old: &str, new: &str) -> Result<Vec<String>, StoreError>;
    async fn clear_channel(&self, channel: &str) -> Result<(), StoreError>;
    async fn member(
        &self,
        channel: &str,
        nick: &str,
    ) -> Result<Option<ChannelMembership>, StoreError>;
    async fn members(&self, channel: &str) -> Result<Vec<ChannelMembership>, StoreError>;
    async fn upsert_bot_status(&self, status: BotChannelStatus) -> Result<(), StoreError>;
    async fn bot_status(&self, channel: &str) -> Result<Option<BotChannelStatus>, StoreError>;
    async fn joined_channels(&self) -> Result<Vec<String>, StoreError>;
    async fn recompute_counts(&self, channel: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
struct StoreInner {
    members: HashMap<String, HashMap<String, ChannelMembership>>,
    statuses: HashMap<String, BotChannelStatus>,
}

/// In-process store used by the binary and by tests.
#[derive(Default)]
pub struct MemoryChannelStore {
    inner: RwLock<StoreInner>,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn upsert_member(&self, member: ChannelMembership) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let channel = guard.members.entry(key(&member.channel)).or_default();
        match channel.get_mut(&key(&member.nick)) {
            Some(existing) => {
                existing.nick = member.nick;
                existing.is_op = member.is_op;
                existing.is_halfop = member.is_halfop;
                existing.is_voice = member.is_voice;
                existing.hostmask = member.hostmask.or(existing.hostmask.take());
                existing.account = member.account.or(existing.account.take());
                existing.updated_at = Utc::now();
            }
            None => {
                channel.insert(key(&member.nick), member);
            }
        }
        Ok(())
    }

    async fn upsert_members(
        &self,
        channel: &str,
        members: Vec<ChannelMembership>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let rows = guard.members.entry(key(channel)).or_default();
        let now = Utc::now();
        for member in members {
            match rows.get_mut(&key(&member.nick)) {
                Some(existing) => {
                    existing.is_op = member.is_op;
                    existing.is_halfop = member.is_halfop;
                    existing.is_voice = member.is_voice;
                    existing.updated_at = now;
                }
                None => {
                    rows.insert(key(&member.nick), member);
                }
            }
        }
        tracing::trace!(channel.name = %channel, rows = rows.len(), "Batched membership upsert");
        Ok(())
    }

    async fn remove_member(&self, channel: &str, nick: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(rows) = guard.members.get_mut(&key(channel)) {
            rows.remove(&key(nick));
        }
        Ok(())
    }

    async fn remove_nick_everywhere(&self, nick: &str) -> Result<Vec<String>, StoreError> {
        let mut guard = self.inner.write().await;
        let nick_key = key(nick);
        let mut touched = Vec::new();
        for (channel, rows) in guard.members.iter_mut() {
            if rows.remove(&nick_key).is_some() {
                touched.push(channel.clone());
            }
        }
        Ok(touched)
    }

    async fn rename_nick(&self, old: &str, new: &str) -> Result<Vec<String>, StoreError> {
        let mut guard = self.inner.write().await;
        let (old_key, new_key) = (key(old), key(new));
        let mut touched = Vec::new();
        for (channel, rows) in guard.members.iter_mut() {
            if let Some(mut row) = rows.remove(&old_key) {
                row.nick = new.to_string();
                row.updated_at = Utc::now();
                rows.insert(new_key.clone(), row);
                touched.push(channel.clone());
            }
        }
        Ok(touched)
    }

    async fn clear_channel(&self, channel: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.members.remove(&key(channel));
        Ok(())
    }

    async fn member(
        &self,
        channel: &str,
        nick: &str,
    ) -> Result<Option<ChannelMembership>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .members
            .get(&key(channel))
            .and_then(|rows| rows.get(&key(nick)))
            .cloned())
    }

    async fn members(&self, channel: &str) -> Result<Vec<ChannelMembership>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .members
            .get(&key(channel))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_bot_status(&self, status: BotChannelStatus) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.statuses.insert(key(&status.channel), status);
        Ok(())
    }

    async fn bot_status(&self, channel: &str) -> Result<Option<BotChannelStatus>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.statuses.get(&key(channel)).cloned())
    }

    async fn joined_channels(&self) -> Result<Vec<String>, StoreError> {
        let guard = self.inner.read().await;
        let mut channels: Vec<String> = guard
            .statuses
            .values()
            .filter(|status| status.is_joined)
            .map(|status| status.channel.clone())
            .collect();
        channels.sort();
        Ok(channels)
    }

    async fn recompute_counts(&self, channel: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let channel_key = key(channel);
        let (users, ops, voices) = guard
            .members
            .get(&channel_key)
            .map(|rows| {
                (
                    rows.len(),
                    rows.values().filter(|m| m.is_op).count(),
                    rows.values().filter(|m| m.is_voice).count(),
                )
            })
            .unwrap_or((0, 0, 0));
        let status = guard
            .statuses
            .entry(channel_key)
            .or_insert_with(|| BotChannelStatus::new(channel));
        status.user_count = users;
        status.op_count = ops;
        status.voice_count = voices;
        Ok(())
    }
}
