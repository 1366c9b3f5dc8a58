use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::irc_parser::nick_of;
use crate::db::{BotChannelStatus, ChannelMembership, ChannelStore, StoreError, key};

pub const NAMES_DEBOUNCE: Duration = Duration::from_millis(500);

/// Channel user-mode prefixes as they appear in NAMES replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberModes {
    pub op: bool,
    pub halfop: bool,
    pub voice: bool,
}

/// Splits one NAMES entry into its modes and the bare `nick[!user@host]`.
pub fn parse_names_entry(entry: &str) -> (MemberModes, &str) {
    let mut modes = MemberModes::default();
    let name = entry.trim_start_matches(|c: char| match c {
        // Owner and admin outrank op and are tracked as op.
        '~' | '&' | '@' => {
            modes.op = true;
            true
        }
        '%' => {
            modes.halfop = true;
            true
        }
        '+' => {
            modes.voice = true;
            true
        }
        _ => false,
    });
    (modes, name)
}

/// Which channel modes carry a parameter. Starts from a common default and
/// follows the CHANMODES and PREFIX tokens of RPL_ISUPPORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelModeTypes {
    /// CHANMODES types A and B: a parameter in both directions.
    always: String,
    /// CHANMODES type C: a parameter only when set.
    when_set: String,
    /// Membership modes from PREFIX, each naming a nick.
    membership: String,
}

impl Default for ChannelModeTypes {
    fn default() -> Self {
        Self {
            always: "beIk".to_string(),
            when_set: "l".to_string(),
            membership: "qaohv".to_string(),
        }
    }
}

impl ChannelModeTypes {
    /// Folds one ISUPPORT token in. Returns true when it changed the table.
    pub fn apply_isupport(&mut self, token: &str) -> bool {
        if let Some(value) = token.strip_prefix("CHANMODES=") {
            let mut groups = value.split(',');
            let (Some(a), Some(b), Some(c)) = (groups.next(), groups.next(), groups.next()) else {
                return false;
            };
            self.always = format!("{a}{b}");
            self.when_set = c.to_string();
            true
        } else if let Some(value) = token.strip_prefix("PREFIX=") {
            let Some(letters) = value
                .strip_prefix('(')
                .and_then(|rest| rest.split_once(')'))
                .map(|(letters, _)| letters)
            else {
                return false;
            };
            self.membership = letters.to_string();
            true
        } else {
            false
        }
    }

    fn is_membership(&self, mode: char) -> bool {
        self.membership.contains(mode)
    }

    fn takes_param(&self, mode: char, adding: bool) -> bool {
        self.always.contains(mode) || (adding && self.when_set.contains(mode))
    }
}

#[derive(Default)]
struct NamesBuffer {
    entries: HashMap<String, ChannelMembership>,
    flush: Option<JoinHandle<()>>,
}

struct TrackerInner {
    own_nick: String,
    names: HashMap<String, NamesBuffer>,
    mode_types: ChannelModeTypes,
}

/// Mirrors channel membership and the bot's own channel state into a
/// [`ChannelStore`]. Every hook is called from the connection's read loop.
pub struct ChannelStateTracker {
    store: Arc<dyn ChannelStore>,
    debounce: Duration,
    inner: Mutex<TrackerInner>,
}

impl ChannelStateTracker {
    pub fn new(store: Arc<dyn ChannelStore>, own_nick: &str) -> Arc<Self> {
        Self::with_debounce(store, own_nick, NAMES_DEBOUNCE)
    }

    pub fn with_debounce(store: Arc<dyn ChannelStore>, own_nick: &str, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            debounce,
            inner: Mutex::new(TrackerInner {
                own_nick: own_nick.to_string(),
                names: HashMap::new(),
                mode_types: ChannelModeTypes::default(),
            }),
        })
    }

    pub fn store(&self) -> &Arc<dyn ChannelStore> {
        &self.store
    }

    pub fn set_own_nick(&self, nick: &str) {
        self.inner.lock().own_nick = nick.to_string();
    }

    pub fn apply_isupport(&self, token: &str) {
        let mut inner = self.inner.lock();
        if inner.mode_types.apply_isupport(token) {
            tracing::debug!(token, "Channel mode table updated");
        }
    }

    fn is_self(&self, nick: &str) -> bool {
        self.inner.lock().own_nick.eq_ignore_ascii_case(nick)
    }

    /// Buffers one 353 line. The batch is written once no further NAMES line
    /// for the channel arrives within the debounce delay.
    pub async fn on_names_reply(self: &Arc<Self>, channel: &str, names: &str) -> Result<(), StoreError> {
        let mut own_modes = None;
        {
            let mut inner = self.inner.lock();
            let own_nick = inner.own_nick.clone();
            let buffer = inner.names.entry(key(channel)).or_default();
            for entry in names.split_whitespace() {
                let (modes, name) = parse_names_entry(entry);
                let nick = nick_of(name);
                if nick.is_empty() {
                    continue;
                }
                if nick.eq_ignore_ascii_case(&own_nick) {
                    own_modes = Some((nick.to_string(), modes));
                }
                let mut member = ChannelMembership::new(channel, nick);
                member.is_op = modes.op;
                member.is_halfop = modes.halfop;
                member.is_voice = modes.voice;
                if name.contains('!') {
                    member.hostmask = Some(name.to_string());
                }
                buffer.entries.insert(key(nick), member);
            }

            if let Some(pending) = buffer.flush.take() {
                pending.abort();
            }
            let tracker = Arc::clone(self);
            let channel = channel.to_string();
            let delay = self.debounce;
            buffer.flush = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = tracker.flush_names(&channel).await {
                    tracing::warn!(channel.name = %channel, error = %e, "Failed to store NAMES batch");
                }
            }));
        }

        // The bot's own modes are never left waiting on the batch.
        if let Some((nick, modes)) = own_modes {
            let mut member = ChannelMembership::new(channel, &nick);
            member.is_op = modes.op;
            member.is_halfop = modes.halfop;
            member.is_voice = modes.voice;
            self.store.upsert_member(member).await?;
            self.update_bot_status(channel, |status| {
                status.is_op = modes.op;
                status.is_halfop = modes.halfop;
                status.is_voice = modes.voice;
            })
            .await?;
        }
        Ok(())
    }

    /// Writes the buffered NAMES entries for `channel` as one batch.
    pub async fn flush_names(&self, channel: &str) -> Result<usize, StoreError> {
        let entries: Vec<ChannelMembership> = {
            let mut inner = self.inner.lock();
            match inner.names.remove(&key(channel)) {
                Some(buffer) => buffer.entries.into_values().collect(),
                None => return Ok(0),
            }
        };
        let count = entries.len();
        self.store.upsert_members(channel, entries).await?;
        self.store.recompute_counts(channel).await?;
        tracing::debug!(channel.name = %channel, members = count, "Stored NAMES batch");
        Ok(count)
    }

    pub fn on_end_of_names(&self, channel: &str) {
        let buffered = self
            .inner
            .lock()
            .names
            .get(&key(channel))
            .map_or(0, |buffer| buffer.entries.len());
        tracing::debug!(channel.name = %channel, buffered, "End of NAMES");
    }

    pub async fn on_join(
        &self,
        channel: &str,
        nick: &str,
        user: Option<&str>,
        host: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.is_self(nick) {
            self.store.clear_channel(channel).await?;
            self.update_bot_status(channel, |status| {
                status.is_joined = true;
                status.is_op = false;
                status.is_halfop = false;
                status.is_voice = false;
                status.joined_at = Some(Utc::now());
            })
            .await?;
            tracing::info!(channel.name = %channel, "Joined channel");
            return Ok(());
        }

        let mut member = ChannelMembership::new(channel, nick);
        if let (Some(user), Some(host)) = (user, host) {
            member.hostmask = Some(format!("{nick}!{user}@{host}"));
        }
        self.store.upsert_member(member).await?;
        self.store.recompute_counts(channel).await
    }

    pub async fn on_part(&self, channel: &str, nick: &str) -> Result<(), StoreError> {
        if self.is_self(nick) {
            return self.leave_channel(channel).await;
        }
        {
            let mut inner = self.inner.lock();
            if let Some(buffer) = inner.names.get_mut(&key(channel)) {
                buffer.entries.remove(&key(nick));
            }
        }
        self.store.remove_member(channel, nick).await?;
        self.store.recompute_counts(channel).await
    }

    pub async fn on_kick(&self, channel: &str, victim: &str) -> Result<(), StoreError> {
        self.on_part(channel, victim).await
    }

    /// Removes a quitting user everywhere. Returns the channels they were in.
    pub async fn on_quit(&self, nick: &str) -> Result<Vec<String>, StoreError> {
        if self.is_self(nick) {
            return Ok(Vec::new());
        }
        let buffered: Vec<String> = {
            let mut inner = self.inner.lock();
            inner
                .names
                .values_mut()
                .filter_map(|buffer| buffer.entries.remove(&key(nick)))
                .map(|member| member.channel)
                .collect()
        };
        let mut channels = self.store.remove_nick_everywhere(nick).await?;
        for channel in &channels {
            self.store.recompute_counts(channel).await?;
        }
        for channel in buffered {
            if !channels.iter().any(|c| c.eq_ignore_ascii_case(&channel)) {
                channels.push(channel);
            }
        }
        Ok(channels)
    }

    /// True while `nick` is a tracked member of any channel, including
    /// NAMES entries not yet written.
    pub async fn shares_channel(&self, nick: &str) -> Result<bool, StoreError> {
        let nick_key = key(nick);
        let buffered = self
            .inner
            .lock()
            .names
            .values()
            .any(|buffer| buffer.entries.contains_key(&nick_key));
        if buffered {
            return Ok(true);
        }
        for channel in self.store.joined_channels().await? {
            if self.store.member(&channel, nick).await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Applies a channel MODE change. `args` are the parameters following
    /// the mode string.
    pub async fn on_mode(&self, channel: &str, modes: &str, args: &[&str]) -> Result<(), StoreError> {
        let types = self.inner.lock().mode_types.clone();
        let mut args = args.iter();
        let mut adding = true;
        for mode in modes.chars() {
            match mode {
                '+' => adding = true,
                '-' => adding = false,
                m if types.is_membership(m) => {
                    let Some(subject) = args.next() else {
                        continue;
                    };
                    self.apply_member_mode(channel, subject, mode, adding).await?;
                }
                m if types.takes_param(m, adding) => {
                    args.next();
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn apply_member_mode(
        &self,
        channel: &str,
        subject: &str,
        mode: char,
        adding: bool,
    ) -> Result<(), StoreError> {
        let apply = |op: &mut bool, halfop: &mut bool, voice: &mut bool| match mode {
            'o' | 'q' | 'a' => *op = adding,
            'h' => *halfop = adding,
            'v' => *voice = adding,
            _ => {}
        };

        if self.is_self(subject) {
            self.update_bot_status(channel, |status| {
                apply(&mut status.is_op, &mut status.is_halfop, &mut status.is_voice)
            })
            .await?;
        }

        if let Some(mut member) = self.store.member(channel, subject).await? {
            apply(&mut member.is_op, &mut member.is_halfop, &mut member.is_voice);
            self.store.upsert_member(member).await?;
            self.store.recompute_counts(channel).await?;
        } else {
            tracing::debug!(channel.name = %channel, irc.nick = %subject, "MODE for untracked member");
        }
        Ok(())
    }

    pub async fn on_nick_change(&self, old: &str, new: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            if inner.own_nick.eq_ignore_ascii_case(old) {
                inner.own_nick = new.to_string();
            }
            for buffer in inner.names.values_mut() {
                if let Some(mut member) = buffer.entries.remove(&key(old)) {
                    member.nick = new.to_string();
                    buffer.entries.insert(key(new), member);
                }
            }
        }
        let channels = self.store.rename_nick(old, new).await?;
        for channel in &channels {
            self.store.recompute_counts(channel).await?;
        }
        Ok(())
    }

    pub async fn on_topic(&self, channel: &str, topic: Option<&str>) -> Result<(), StoreError> {
        let topic = topic.filter(|t| !t.is_empty()).map(str::to_string);
        self.update_bot_status(channel, |status| status.topic = topic).await
    }

    pub async fn joined_channels(&self) -> Result<Vec<String>, StoreError> {
        self.store.joined_channels().await
    }

    /// Forgets every channel after the connection is lost. Returns the
    /// channels that were joined so they can be rejoined.
    pub async fn reset(&self) -> Result<Vec<String>, StoreError> {
        {
            let mut inner = self.inner.lock();
            inner.mode_types = ChannelModeTypes::default();
            for (_, buffer) in inner.names.drain() {
                if let Some(flush) = buffer.flush {
                    flush.abort();
                }
            }
        }
        let joined = self.store.joined_channels().await?;
        for channel in &joined {
            self.leave_channel(channel).await?;
        }
        Ok(joined)
    }

    async fn leave_channel(&self, channel: &str) -> Result<(), StoreError> {
        if let Some(buffer) = self.inner.lock().names.remove(&key(channel))
            && let Some(flush) = buffer.flush
        {
            flush.abort();
        }
        self.store.clear_channel(channel).await?;
        self.update_bot_status(channel, |status| {
            status.is_joined = false;
            status.is_op = false;
            status.is_halfop = false;
            status.is_voice = false;
        })
        .await
    }

    async fn update_bot_status<F>(&self, channel: &str, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BotChannelStatus),
    {
        let mut status = self
            .store
            .bot_status(channel)
            .await?
            .unwrap_or_else(|| BotChannelStatus::new(channel));
        update(&mut status);
        self.store.upsert_bot_status(status).await?;
        self.store.recompute_counts(channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryChannelStore;

    fn tracker() -> (Arc<ChannelStateTracker>, Arc<MemoryChannelStore>) {
        let store = Arc::new(MemoryChannelStore::new());
        (ChannelStateTracker::new(store.clone(), "kestrel"), store)
    }

    #[test]
    fn test_names_prefixes() {
        let (modes, name) = parse_names_entry("@+alice");
        assert!(modes.op && modes.voice && !modes.halfop);
        assert_eq!(name, "alice");
        let (modes, name) = parse_names_entry("%bob!b@host");
        assert!(modes.halfop);
        assert_eq!(name, "bob!b@host");
        assert_eq!(parse_names_entry("carol").0, MemberModes::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_names_burst_is_debounced_into_one_batch() {
        let (tracker, store) = tracker();
        tracker.on_join("#rust", "kestrel", None, None).await.unwrap();

        tracker.on_names_reply("#rust", "@alice +bob").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tracker.on_names_reply("#rust", "carol dave").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(
            store.members("#rust").await.unwrap().is_empty(),
            "timer restarts on every NAMES line"
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        let members = store.members("#rust").await.unwrap();
        assert_eq!(members.len(), 4);
        let status = store.bot_status("#rust").await.unwrap().unwrap();
        assert_eq!(status.user_count, 4);
        assert_eq!(status.op_count, 1);
        assert_eq!(status.voice_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_modes_are_written_immediately() {
        let (tracker, store) = tracker();
        tracker.on_join("#rust", "kestrel", None, None).await.unwrap();
        tracker.on_names_reply("#rust", "@kestrel alice").await.unwrap();

        let status = store.bot_status("#rust").await.unwrap().unwrap();
        assert!(status.is_op, "own op status must not wait for the batch");
        assert!(store.member("#rust", "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_self_part_clears_all_members() {
        let (tracker, store) = tracker();
        tracker.on_join("#rust", "kestrel", None, None).await.unwrap();
        tracker.on_join("#rust", "alice", Some("a"), Some("h")).await.unwrap();
        tracker.on_join("#rust", "bob", None, None).await.unwrap();
        assert_eq!(
            store.member("#rust", "alice").await.unwrap().unwrap().hostmask.as_deref(),
            Some("alice!a@h")
        );

        tracker.on_kick("#rust", "kestrel").await.unwrap();
        assert!(store.members("#rust").await.unwrap().is_empty());
        let status = store.bot_status("#rust").await.unwrap().unwrap();
        assert!(!status.is_joined);
        assert_eq!(status.user_count, 0);
    }

    #[tokio::test]
    async fn test_mode_changes_update_subject_and_counts() {
        let (tracker, store) = tracker();
        tracker.on_join("#rust", "kestrel", None, None).await.unwrap();
        tracker.on_join("#rust", "alice", None, None).await.unwrap();
        tracker.on_join("#rust", "bob", None, None).await.unwrap();

        tracker
            .on_mode("#rust", "+ob-v+l", &["alice", "*!*@spam", "bob", "50"])
            .await
            .unwrap();
        assert!(store.member("#rust", "alice").await.unwrap().unwrap().is_op);
        assert!(!store.member("#rust", "bob").await.unwrap().unwrap().is_voice);
        assert_eq!(store.bot_status("#rust").await.unwrap().unwrap().op_count, 1);

        tracker.on_mode("#rust", "+v", &["kestrel"]).await.unwrap();
        assert!(store.bot_status("#rust").await.unwrap().unwrap().is_voice);
    }

    #[tokio::test]
    async fn test_quit_and_nick_change() {
        let (tracker, store) = tracker();
        for channel in ["#a", "#b"] {
            tracker.on_join(channel, "kestrel", None, None).await.unwrap();
            tracker.on_join(channel, "alice", None, None).await.unwrap();
        }
        tracker.on_nick_change("alice", "alicia").await.unwrap();
        assert!(store.member("#b", "alicia").await.unwrap().is_some());

        let mut left = tracker.on_quit("alicia").await.unwrap();
        left.sort();
        assert_eq!(left, vec!["#a", "#b"]);
        assert_eq!(store.bot_status("#a").await.unwrap().unwrap().user_count, 0);

        tracker.on_nick_change("kestrel", "kestrel_").await.unwrap();
        tracker.on_part("#a", "kestrel_").await.unwrap();
        assert_eq!(store.joined_channels().await.unwrap(), vec!["#b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departures_during_names_burst_are_not_written_back() {
        let (tracker, store) = tracker();
        for channel in ["#rust", "#tokio"] {
            tracker.on_join(channel, "kestrel", None, None).await.unwrap();
        }
        tracker.on_names_reply("#rust", "alice bob carol").await.unwrap();
        tracker.on_names_reply("#tokio", "carol dave").await.unwrap();

        tracker.on_part("#rust", "alice").await.unwrap();
        tracker.on_kick("#rust", "bob").await.unwrap();
        let mut left = tracker.on_quit("carol").await.unwrap();
        left.sort();
        assert_eq!(left, vec!["#rust", "#tokio"], "buffered channels count as membership");

        tokio::time::sleep(NAMES_DEBOUNCE * 2).await;
        assert!(store.members("#rust").await.unwrap().is_empty());
        let tokio_members: Vec<String> = store
            .members("#tokio")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.nick)
            .collect();
        assert_eq!(tokio_members, vec!["dave"]);
        assert_eq!(store.bot_status("#rust").await.unwrap().unwrap().user_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shares_channel_sees_buffered_and_stored_members() {
        let (tracker, _store) = tracker();
        tracker.on_join("#rust", "kestrel", None, None).await.unwrap();
        tracker.on_names_reply("#rust", "alice").await.unwrap();
        assert!(tracker.shares_channel("ALICE").await.unwrap());

        tokio::time::sleep(NAMES_DEBOUNCE * 2).await;
        assert!(tracker.shares_channel("alice").await.unwrap());
        tracker.on_part("#rust", "alice").await.unwrap();
        assert!(!tracker.shares_channel("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_mode_arguments_follow_the_default_table() {
        let (tracker, store) = tracker();
        tracker.on_join("#rust", "kestrel", None, None).await.unwrap();
        for nick in ["alice", "bob"] {
            tracker.on_join("#rust", nick, None, None).await.unwrap();
        }

        // -k consumes its key even when removing; -l takes nothing.
        tracker
            .on_mode("#rust", "+ov-k-l+v", &["alice", "bob", "secret", "kestrel"])
            .await
            .unwrap();
        let alice = store.member("#rust", "alice").await.unwrap().unwrap();
        let bob = store.member("#rust", "bob").await.unwrap().unwrap();
        assert!(alice.is_op && !alice.is_voice);
        assert!(bob.is_voice && !bob.is_op);
        assert!(store.bot_status("#rust").await.unwrap().unwrap().is_voice);
    }

    #[tokio::test]
    async fn test_isupport_chanmodes_shift_the_argument_cursor() {
        let (tracker, store) = tracker();
        tracker.on_join("#rust", "kestrel", None, None).await.unwrap();
        tracker.on_join("#rust", "alice", None, None).await.unwrap();
        tracker.apply_isupport("CHANMODES=beI,k,fjl,imnpst");
        tracker.apply_isupport("PREFIX=(ov)@+");

        tracker.on_mode("#rust", "+jo", &["3:5", "alice"]).await.unwrap();
        assert!(store.member("#rust", "alice").await.unwrap().unwrap().is_op);

        // Halfop is not a membership mode on this server and takes no nick.
        tracker.on_mode("#rust", "+hv", &["alice"]).await.unwrap();
        let alice = store.member("#rust", "alice").await.unwrap().unwrap();
        assert!(alice.is_voice && !alice.is_halfop);

        tracker.reset().await.unwrap();
        let mut expected = ChannelModeTypes::default();
        assert!(!expected.apply_isupport("NETWORK=Test"));
        assert!(!expected.apply_isupport("CHANMODES=broken"));
        assert_eq!(tracker.inner.lock().mode_types, ChannelModeTypes::default());
    }

    #[tokio::test]
    async fn test_reset_returns_joined_channels() {
        let (tracker, store) = tracker();
        tracker.on_join("#a", "kestrel", None, None).await.unwrap();
        tracker.on_topic("#a", Some("hello")).await.unwrap();
        let joined = tracker.reset().await.unwrap();
        assert_eq!(joined, vec!["#a"]);
        assert!(store.joined_channels().await.unwrap().is_empty());
        assert_eq!(
            store.bot_status("#a").await.unwrap().unwrap().topic.as_deref(),
            Some("hello")
        );
    }
}
