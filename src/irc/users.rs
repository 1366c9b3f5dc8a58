use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use super::irc_parser::{
    ERR_NOSUCHNICK, ERR_WASNOSUCHNICK, IrcMessage, RPL_ENDOFWHOIS, RPL_ENDOFWHOWAS,
    RPL_WHOISACCOUNT, RPL_WHOISACTUALLY, RPL_WHOISCHANNELS, RPL_WHOISHOST, RPL_WHOISIDLE,
    RPL_WHOISMODES, RPL_WHOISOPERATOR, RPL_WHOISSERVER, RPL_WHOISUSER, RPL_WHOWASUSER,
};
use crate::db::key;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserInfo {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
    pub realname: Option<String>,
    pub account: Option<String>,
    pub server: Option<String>,
    pub actual_host: Option<String>,
    pub is_operator: bool,
    pub idle_secs: Option<u64>,
    pub channels: Vec<String>,
    pub modes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UserInfo {
    pub fn new(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            user: None,
            host: None,
            realname: None,
            account: None,
            server: None,
            actual_host: None,
            is_operator: false,
            idle_secs: None,
            channels: Vec::new(),
            modes: None,
            updated_at: Utc::now(),
        }
    }

    pub fn hostmask(&self) -> Option<String> {
        match (&self.user, &self.host) {
            (Some(user), Some(host)) => Some(format!("{}!{user}@{host}", self.nick)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    Whois,
    Whowas,
}

impl LookupKind {
    pub fn command(self) -> &'static str {
        match self {
            LookupKind::Whois => "WHOIS",
            LookupKind::Whowas => "WHOWAS",
        }
    }
}

struct PendingLookup {
    info: UserInfo,
    found: bool,
    waiters: Vec<oneshot::Sender<Option<UserInfo>>>,
}

#[derive(Default)]
struct CacheInner {
    users: HashMap<String, UserInfo>,
    pending: HashMap<(LookupKind, String), PendingLookup>,
}

/// Identity data learned about other users, keyed by case-folded nick.
#[derive(Default)]
pub struct UserCache {
    inner: Mutex<CacheInner>,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the `user@host` seen in a message prefix.
    pub fn observe(&self, nick: &str, user: Option<&str>, host: Option<&str>) {
        let mut inner = self.inner.lock();
        let entry = inner
            .users
            .entry(key(nick))
            .or_insert_with(|| UserInfo::new(nick));
        entry.nick = nick.to_string();
        if let Some(user) = user {
            entry.user = Some(user.to_string());
        }
        if let Some(host) = host {
            entry.host = Some(host.to_string());
        }
        entry.updated_at = Utc::now();
    }

    pub fn is_known(&self, nick: &str) -> bool {
        self.inner.lock().users.contains_key(&key(nick))
    }

    pub fn get(&self, nick: &str) -> Option<UserInfo> {
        self.inner.lock().users.get(&key(nick)).cloned()
    }

    pub fn rename(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock();
        if let Some(mut info) = inner.users.remove(&key(old)) {
            info.nick = new.to_string();
            info.updated_at = Utc::now();
            inner.users.insert(key(new), info);
        }
    }

    /// Drops a user who is no longer visible to the bot.
    pub fn forget(&self, nick: &str) -> bool {
        self.inner.lock().users.remove(&key(nick)).is_some()
    }

    /// Drops cached identity for `nicks`; returns how many entries went away.
    pub fn invalidate<S: AsRef<str>>(&self, nicks: &[S]) -> usize {
        let mut inner = self.inner.lock();
        nicks
            .iter()
            .filter(|nick| inner.users.remove(&key(nick.as_ref())).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers interest in a lookup. The flag is true when no lookup for
    /// the nick is outstanding, meaning the caller must send the query.
    pub fn begin_lookup(
        &self,
        kind: LookupKind,
        nick: &str,
    ) -> (oneshot::Receiver<Option<UserInfo>>, bool) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let pending = inner
            .pending
            .entry((kind, key(nick)))
            .or_insert_with(|| PendingLookup {
                info: UserInfo::new(nick),
                found: false,
                waiters: Vec::new(),
            });
        pending.waiters.retain(|waiter| !waiter.is_closed());
        let first = pending.waiters.is_empty();
        pending.waiters.push(tx);
        (rx, first)
    }

    /// Forgets a lookup whose waiters have all gone away.
    pub fn abandon_lookup(&self, kind: LookupKind, nick: &str) {
        let mut inner = self.inner.lock();
        let lookup_key = (kind, key(nick));
        if let Some(pending) = inner.pending.get_mut(&lookup_key) {
            pending.waiters.retain(|waiter| !waiter.is_closed());
            if pending.waiters.is_empty() {
                inner.pending.remove(&lookup_key);
            }
        }
    }

    /// Fails every outstanding lookup, used when the connection goes away.
    pub fn clear_lookups(&self) {
        self.inner.lock().pending.clear();
    }

    /// Folds one WHOIS/WHOWAS numeric into the matching lookup. Returns
    /// false when the message is not part of such a reply.
    pub fn on_lookup_reply(&self, message: &IrcMessage<'_>) -> bool {
        let Some(command) = message.command() else {
            return false;
        };
        let Some(nick) = message.param(1) else {
            return false;
        };
        let kind = match command {
            RPL_WHOWASUSER | ERR_WASNOSUCHNICK | RPL_ENDOFWHOWAS => LookupKind::Whowas,
            RPL_WHOISUSER | RPL_WHOISSERVER | RPL_WHOISOPERATOR | RPL_WHOISIDLE
            | RPL_ENDOFWHOIS | RPL_WHOISCHANNELS | RPL_WHOISACCOUNT | RPL_WHOISACTUALLY
            | RPL_WHOISHOST | RPL_WHOISMODES | ERR_NOSUCHNICK => LookupKind::Whois,
            _ => return false,
        };

        let mut inner = self.inner.lock();
        let lookup_key = (kind, key(nick));

        if matches!(command, RPL_ENDOFWHOIS | RPL_ENDOFWHOWAS) {
            if let Some(pending) = inner.pending.remove(&lookup_key) {
                let result = pending.found.then_some(pending.info);
                if let Some(info) = &result
                    && kind == LookupKind::Whois
                {
                    inner.users.insert(key(nick), info.clone());
                }
                for waiter in pending.waiters {
                    let _ = waiter.send(result.clone());
                }
            }
            return true;
        }

        let Some(pending) = inner.pending.get_mut(&lookup_key) else {
            tracing::trace!(irc.nick = %nick, command, "Unsolicited lookup reply");
            return true;
        };
        let info = &mut pending.info;
        match command {
            RPL_WHOISUSER | RPL_WHOWASUSER => {
                pending.found = true;
                info.nick = nick.to_string();
                info.user = message.param(2).map(str::to_string);
                info.host = message.param(3).map(str::to_string);
                info.realname = message.trailing().map(str::to_string);
            }
            RPL_WHOISSERVER => info.server = message.param(2).map(str::to_string),
            RPL_WHOISOPERATOR => info.is_operator = true,
            RPL_WHOISIDLE => info.idle_secs = message.param(2).and_then(|s| s.parse().ok()),
            RPL_WHOISCHANNELS => {
                info.channels = message
                    .trailing()
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(|c| c.trim_start_matches(['@', '%', '+', '~', '&']).to_string())
                    .collect();
            }
            RPL_WHOISACCOUNT => info.account = message.param(2).map(str::to_string),
            RPL_WHOISACTUALLY => {
                info.actual_host = message
                    .param(2)
                    .map(|host| host.rsplit('@').next().unwrap_or(host).to_string());
            }
            RPL_WHOISHOST => {
                info.actual_host = message
                    .trailing()
                    .and_then(|text| text.split_whitespace().find(|w| w.contains('@')))
                    .map(|mask| mask.rsplit('@').next().unwrap_or(mask).to_string());
            }
            RPL_WHOISMODES => {
                info.modes = message
                    .trailing()
                    .and_then(|text| text.split_whitespace().find(|w| w.starts_with('+')))
                    .map(str::to_string);
            }
            ERR_NOSUCHNICK | ERR_WASNOSUCHNICK => pending.found = false,
            _ => {}
        }
        info.updated_at = Utc::now();
        true
    }
}
