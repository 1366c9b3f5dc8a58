use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthOutcome, AuthSignal, Authenticator, Credentials};
use super::channel::ChannelStateTracker;
use super::ctcp::{CtcpHandler, CtcpOutcome};
use super::error::{IrcError, Result};
use super::irc_parser::*;
use super::netsplit::{NetsplitConfig, NetsplitDetector, NetsplitEvent, NetsplitObserver};
use super::nick::NickPolicy;
use super::reconnect::ConnectionControl;
use super::rejoin::{REJOIN_FLOOR, REJOIN_MAX, RejoinScheduler};
use super::transport::{Transport, TransportConfig, TransportEvent};
use super::types::{ConnectionStatus, MessageHandler, PrivateMessage};
use super::users::{LookupKind, UserCache, UserInfo};
use crate::db::{ChannelStore, StoreError, key};

pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const AUTOJOIN_DELAY: Duration = Duration::from_secs(1);
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub nick: String,
    pub alt_nicks: Vec<String>,
    pub username: String,
    pub realname: String,
    pub autojoin: Vec<String>,
    pub disabled: Vec<String>,
    pub ctcp_version: String,
    pub registration_timeout: Duration,
    pub autojoin_delay: Duration,
    pub lookup_timeout: Duration,
    pub rejoin_floor: Duration,
    pub rejoin_max: Duration,
    pub netsplit: NetsplitConfig,
}

impl ConnectionConfig {
    pub fn new(nick: impl Into<String>) -> Self {
        let nick = nick.into();
        Self {
            username: nick.clone(),
            realname: nick.clone(),
            nick,
            alt_nicks: Vec::new(),
            autojoin: Vec::new(),
            disabled: Vec::new(),
            ctcp_version: format!("kestrel {}", env!("CARGO_PKG_VERSION")),
            registration_timeout: REGISTRATION_TIMEOUT,
            autojoin_delay: AUTOJOIN_DELAY,
            lookup_timeout: LOOKUP_TIMEOUT,
            rejoin_floor: REJOIN_FLOOR,
            rejoin_max: REJOIN_MAX,
            netsplit: NetsplitConfig::default(),
        }
    }
}

struct Session {
    registered: bool,
    current_nick: String,
    nicks: NickPolicy,
    last_ping_at: Option<Instant>,
    last_pong_at: Option<Instant>,
    auth: Option<AuthOutcome>,
    identified: bool,
}

impl Session {
    fn new(config: &ConnectionConfig) -> Self {
        Self {
            registered: false,
            current_nick: config.nick.clone(),
            nicks: NickPolicy::new(config.nick.clone(), config.alt_nicks.clone()),
            last_ping_at: None,
            last_pong_at: None,
            auth: None,
            identified: false,
        }
    }
}

/// Drops cached identities of users coming back from a netsplit.
struct InvalidateOnRecovery {
    users: Arc<UserCache>,
}

impl NetsplitObserver for InvalidateOnRecovery {
    fn on_netsplit_event(&self, event: &NetsplitEvent) {
        if let NetsplitEvent::Recovered { nicks } = event {
            let dropped = self.users.invalidate(nicks.as_slice());
            tracing::info!(users = nicks.len(), dropped, "Invalidated identities after netsplit");
        }
    }
}

/// Owns the registration state machine and routes every inbound line.
pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    config: ConnectionConfig,
    disabled: HashSet<String>,
    transport: Arc<Transport>,
    auth: Authenticator,
    ctcp: CtcpHandler,
    tracker: Arc<ChannelStateTracker>,
    netsplit: Arc<NetsplitDetector>,
    users: Arc<UserCache>,
    rejoin: Arc<RejoinScheduler>,
    handler: Arc<dyn MessageHandler>,
    session: Mutex<Session>,
    status_tx: watch::Sender<ConnectionStatus>,
    previous_channels: Mutex<Vec<String>>,
    autojoin_task: Mutex<Option<JoinHandle<()>>>,
    attempts: AtomicU32,
    next_generation: AtomicU64,
    live_generation: AtomicU64,
    root: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: TransportConfig,
        credentials: Credentials,
        store: Arc<dyn ChannelStore>,
        handler: Arc<dyn MessageHandler>,
        root: CancellationToken,
    ) -> Arc<Self> {
        let users = Arc::new(UserCache::new());
        let invalidator: Arc<dyn NetsplitObserver> = Arc::new(InvalidateOnRecovery {
            users: users.clone(),
        });
        let netsplit = Arc::new(NetsplitDetector::new(config.netsplit.clone(), vec![invalidator]));
        let (status_tx, _) = watch::channel(ConnectionStatus::Initializing);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            disabled: config.disabled.iter().map(|c| key(c)).collect(),
            transport: Arc::new(Transport::new(transport)),
            auth: Authenticator::new(credentials),
            ctcp: CtcpHandler::new(config.ctcp_version.clone()),
            tracker: ChannelStateTracker::new(store, &config.nick),
            netsplit,
            users,
            rejoin: RejoinScheduler::new(config.rejoin_floor, config.rejoin_max),
            handler,
            session: Mutex::new(Session::new(&config)),
            status_tx,
            previous_channels: Mutex::new(Vec::new()),
            autojoin_task: Mutex::new(None),
            attempts: AtomicU32::new(0),
            next_generation: AtomicU64::new(0),
            live_generation: AtomicU64::new(0),
            root,
            config,
        })
    }

    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.transport)
    }

    pub fn netsplit(&self) -> Arc<NetsplitDetector> {
        Arc::clone(&self.netsplit)
    }

    pub fn users(&self) -> Arc<UserCache> {
        Arc::clone(&self.users)
    }

    pub fn tracker(&self) -> Arc<ChannelStateTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_nick(&self) -> String {
        self.session.lock().current_nick.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_registered(&self) -> bool {
        self.session.lock().registered
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    fn is_disabled(&self, channel: &str) -> bool {
        self.disabled.contains(&key(channel))
    }

    /// Opens the transport, authenticates and waits for registration.
    pub async fn connect(&self) -> Result<()> {
        self.disconnect("starting new connection").await;

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_status(ConnectionStatus::Connecting { attempt });
        *self.session.lock() = Session::new(&self.config);
        self.tracker.set_own_nick(&self.config.nick);

        let Some(me) = self.me.upgrade() else {
            return Err(IrcError::NotConnected);
        };
        let (events, cancel) = self.transport.connect(&self.root).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.live_generation.store(generation, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Authenticating { attempt });
        let mut status_rx = self.status_tx.subscribe();
        tokio::spawn(me.read_loop(generation, events, cancel.clone()));

        let registration = vec![
            format!("{CMD_NICK} {}", self.config.nick),
            format!("{CMD_USER} {} 0 * :{}", self.config.username, self.config.realname),
        ];
        match self.auth.authenticate(&self.transport, &registration, &cancel).await {
            Ok(outcome) => self.session.lock().auth = Some(outcome),
            Err(e) => {
                self.disconnect("authentication aborted").await;
                return Err(e);
            }
        }
        self.identify_if_pending().await;

        let timeout = self.config.registration_timeout;
        let waited = tokio::select! {
            _ = cancel.cancelled() => return Err(IrcError::ConnectionClosed("cancelled".to_string())),
            waited = tokio::time::timeout(
                timeout,
                status_rx.wait_for(|s| s.is_registered() || matches!(s, ConnectionStatus::Disconnected { .. })),
            ) => waited.map(|result| result.map(|status| (*status).clone())),
        };
        match waited {
            Ok(Ok(ConnectionStatus::Disconnected { reason })) => Err(IrcError::ConnectionClosed(reason)),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(IrcError::NotConnected),
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "Registration timed out");
                self.disconnect("registration timeout").await;
                Err(IrcError::RegistrationTimeout(timeout))
            }
        }
    }

    /// Closes the current connection. Joined channels are remembered for
    /// the next successful connect.
    pub async fn disconnect(&self, reason: &str) {
        let generation = self.live_generation.load(Ordering::SeqCst);
        self.transport.disconnect();
        self.teardown(generation, reason).await;
    }

    /// Sends QUIT, then closes the connection.
    pub async fn quit(&self, message: &str) {
        if self.transport.is_connected() {
            let _ = self.transport.write(&format!("{CMD_QUIT} :{message}")).await;
        }
        self.disconnect("quit").await;
    }

    pub async fn send_raw(&self, line: &str) -> Result<()> {
        self.transport.write(line).await
    }

    pub async fn join(&self, channel: &str) -> Result<()> {
        self.transport.write(&format!("{CMD_JOIN} {channel}")).await
    }

    pub async fn part(&self, channel: &str, reason: Option<&str>) -> Result<()> {
        match reason {
            Some(reason) => self.transport.write(&format!("{CMD_PART} {channel} :{reason}")).await,
            None => self.transport.write(&format!("{CMD_PART} {channel}")).await,
        }
    }

    /// Marks a channel as banned so that kick/ban rejoins skip it.
    pub fn flag_banned(&self, channel: &str, banned: bool) {
        tracing::info!(channel.name = %channel, banned, "Channel ban flag changed");
        self.rejoin.flag_banned(channel, banned);
    }

    pub async fn whois(&self, nick: &str) -> Result<Option<UserInfo>> {
        self.lookup(LookupKind::Whois, nick).await
    }

    pub async fn whowas(&self, nick: &str) -> Result<Option<UserInfo>> {
        self.lookup(LookupKind::Whowas, nick).await
    }

    async fn lookup(&self, kind: LookupKind, nick: &str) -> Result<Option<UserInfo>> {
        let (rx, first) = self.users.begin_lookup(kind, nick);
        if first
            && let Err(e) = self.transport.write(&format!("{} {nick}", kind.command())).await
        {
            self.users.abandon_lookup(kind, nick);
            return Err(e);
        }
        match tokio::time::timeout(self.config.lookup_timeout, rx).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => Err(IrcError::NotConnected),
            Err(_) => {
                self.users.abandon_lookup(kind, nick);
                Err(IrcError::LookupTimeout(nick.to_string()))
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        let reason = loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(TransportEvent::Line(line)) => self.dispatch(generation, &line).await,
                    Some(TransportEvent::Closed(reason)) => break reason,
                    None => break "transport event stream ended".to_string(),
                },
                _ = cancel.cancelled() => break "connection cancelled".to_string(),
            }
        };
        tracing::info!(reason = %reason, "IRC read loop stopped");
        self.teardown(generation, &reason).await;
    }

    /// Runs once per connection: clears per-connection state and records
    /// the joined channels for a later rejoin.
    async fn teardown(&self, generation: u64, reason: &str) {
        if generation == 0
            || self
                .live_generation
                .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return;
        }

        self.session.lock().registered = false;
        if let Some(task) = self.autojoin_task.lock().take() {
            task.abort();
        }
        self.rejoin.cancel_pending();
        self.users.clear_lookups();
        self.netsplit.reset();

        match self.tracker.reset().await {
            Ok(joined) if !joined.is_empty() => {
                let mut previous = self.previous_channels.lock();
                for channel in joined {
                    if !previous.iter().any(|c| c.eq_ignore_ascii_case(&channel)) {
                        previous.push(channel);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to reset channel state"),
        }
        tracing::warn!(reason, "Disconnected from IRC server");
        self.set_status(ConnectionStatus::Disconnected {
            reason: reason.to_string(),
        });
    }

    async fn dispatch(&self, generation: u64, line: &str) {
        let message = match IrcMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed line");
                return;
            }
        };
        let Some(command) = message.command() else {
            return;
        };

        let source = message.nick();
        let known_before = source.is_some_and(|nick| self.users.is_known(nick));
        if let (Some(nick), Some(user), Some(host)) = (source, message.user(), message.host()) {
            self.users.observe(nick, Some(user), Some(host));
        }

        match command {
            CMD_PING => {
                let payload = message.trailing().unwrap_or_default();
                if let Err(e) = self.transport.write(&format!("{CMD_PONG} :{payload}")).await {
                    tracing::warn!(error = %e, "Failed to answer PING");
                }
            }
            CMD_PONG => {
                self.session.lock().last_pong_at = Some(Instant::now());
            }
            RPL_WELCOME => {
                if let Some(nick) = message.param(0) {
                    self.session.lock().current_nick = nick.to_string();
                    self.tracker.set_own_nick(nick);
                }
                self.on_registered().await;
            }
            RPL_ENDOFMOTD | ERR_NOMOTD => self.on_registered().await,
            RPL_ISUPPORT => {
                for token in message.params().iter().skip(1) {
                    self.tracker.apply_isupport(token);
                }
            }
            RPL_YOURHOST | RPL_CREATED | RPL_MYINFO => {
                tracing::debug!(command, "{}", message.params().join(" "));
            }
            ERR_NICKNAMEINUSE | ERR_ERRONEUSNICKNAME => {
                self.on_nick_rejected(message.param(1).unwrap_or_default()).await;
            }
            CMD_NICK => {
                if let (Some(old), Some(new)) = (source, message.trailing()) {
                    self.on_nick(old, new).await;
                }
            }
            CMD_JOIN => {
                if let (Some(nick), Some(channel)) = (source, message.param(0)) {
                    self.on_join(channel, nick, message.user(), message.host(), known_before)
                        .await;
                }
            }
            CMD_PART => {
                if let (Some(nick), Some(channel)) = (source, message.param(0)) {
                    log_store(self.tracker.on_part(channel, nick).await, "PART");
                    self.forget_if_gone(nick).await;
                }
            }
            CMD_KICK => {
                if let (Some(channel), Some(victim)) = (message.param(0), message.param(1)) {
                    self.on_kick(channel, victim, message.param(2)).await;
                }
            }
            CMD_QUIT => {
                if let Some(nick) = source {
                    self.on_quit(nick, known_before).await;
                }
            }
            CMD_MODE => {
                if let (Some(target), Some(modes)) = (message.param(0), message.param(1))
                    && is_channel(target)
                {
                    let args = &message.params()[2..];
                    log_store(self.tracker.on_mode(target, modes, args).await, "MODE");
                }
            }
            CMD_TOPIC => {
                if let Some(channel) = message.param(0) {
                    log_store(self.tracker.on_topic(channel, message.param(1)).await, "TOPIC");
                }
            }
            RPL_TOPIC => {
                if let Some(channel) = message.param(1) {
                    log_store(self.tracker.on_topic(channel, message.param(2)).await, "TOPIC");
                }
            }
            RPL_NOTOPIC => {
                if let Some(channel) = message.param(1) {
                    log_store(self.tracker.on_topic(channel, None).await, "TOPIC");
                }
            }
            RPL_NAMREPLY => {
                if let (Some(channel), Some(names)) = (message.param(2), message.param(3)) {
                    log_store(self.tracker.on_names_reply(channel, names).await, "NAMES");
                }
            }
            RPL_ENDOFNAMES => {
                if let Some(channel) = message.param(1) {
                    self.tracker.on_end_of_names(channel);
                }
            }
            ERR_BANNEDFROMCHAN => {
                if let Some(channel) = message.param(1) {
                    tracing::warn!(channel.name = %channel, "Banned from channel");
                    self.schedule_rejoin(channel);
                }
            }
            CMD_INVITE => {
                if let Some(channel) = message.trailing() {
                    self.on_invite(channel, source.unwrap_or_default()).await;
                }
            }
            CMD_PRIVMSG => {
                if let (Some(nick), Some(target), Some(text)) =
                    (source, message.param(0), message.param(1))
                {
                    self.on_privmsg(&message, nick, target, text).await;
                }
            }
            CMD_NOTICE => {
                tracing::info!(
                    irc.nick = source.unwrap_or_default(),
                    "NOTICE: {}",
                    message.trailing().unwrap_or_default()
                );
            }
            CMD_CAP => match (message.param(1), message.trailing()) {
                (Some(CAP_ACK), Some(caps)) => self.auth.signal(AuthSignal::CapAck(caps.to_string())),
                (Some(CAP_NAK), Some(caps)) => self.auth.signal(AuthSignal::CapNak(caps.to_string())),
                _ => tracing::debug!("CAP: {}", message.params().join(" ")),
            },
            CMD_AUTHENTICATE => {
                if message.param(0) == Some("+") {
                    self.auth.signal(AuthSignal::Continue);
                }
            }
            RPL_SASLSUCCESS => self.auth.signal(AuthSignal::SaslSuccess),
            ERR_SASLFAIL | ERR_SASLTOOLONG | ERR_SASLABORTED | ERR_SASLALREADY => {
                self.auth.signal(AuthSignal::SaslFailure(command.to_string()));
            }
            CMD_ERROR => {
                let reason = message.trailing().unwrap_or("server closed the link");
                tracing::warn!(reason, "Server sent ERROR");
                self.transport.disconnect();
                self.teardown(generation, &format!("ERROR: {reason}")).await;
            }
            _ => {
                if !self.users.on_lookup_reply(&message) {
                    tracing::trace!(command, "Unhandled line");
                }
            }
        }
    }

    async fn on_registered(&self) {
        let nick = {
            let mut session = self.session.lock();
            if session.registered {
                return;
            }
            session.registered = true;
            session.last_pong_at = Some(Instant::now());
            session.current_nick.clone()
        };
        tracing::info!(outcome = "success", irc.nick = %nick, "Registered with IRC server");
        self.set_status(ConnectionStatus::Registered { nick });
        self.identify_if_pending().await;
        self.schedule_autojoin();
    }

    async fn identify_if_pending(&self) {
        let should_identify = {
            let mut session = self.session.lock();
            let pending = session.registered
                && !session.identified
                && session.auth == Some(AuthOutcome::NickServ);
            if pending {
                session.identified = true;
            }
            pending
        };
        if should_identify && let Some(line) = self.auth.identify_line() {
            match self.transport.write(&line).await {
                Ok(()) => tracing::info!("Sent NickServ IDENTIFY"),
                Err(e) => tracing::warn!(error = %e, "Failed to send NickServ IDENTIFY"),
            }
        }
    }

    fn schedule_autojoin(&self) {
        let channels: Vec<String> = self
            .config
            .autojoin
            .iter()
            .filter(|c| !self.is_disabled(c) && !self.rejoin.is_banned(c))
            .cloned()
            .collect();
        if channels.is_empty() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let delay = self.config.autojoin_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for channel in channels {
                if let Err(e) = transport.write(&format!("{CMD_JOIN} {channel}")).await {
                    tracing::warn!(channel.name = %channel, error = %e, "Auto-join failed");
                }
            }
        });
        if let Some(previous) = self.autojoin_task.lock().replace(task) {
            previous.abort();
        }
    }

    async fn on_nick_rejected(&self, rejected: &str) {
        let next = {
            let mut session = self.session.lock();
            if session.registered {
                // A reclaim attempt lost the race.
                None
            } else {
                let next = session.nicks.next_after_collision();
                session.current_nick = next.clone();
                Some(next)
            }
        };
        let Some(next) = next else {
            tracing::debug!(irc.nick = %rejected, "Nickname change rejected");
            return;
        };
        tracing::info!(irc.nick = %rejected, next = %next, "Nickname in use, trying another");
        self.tracker.set_own_nick(&next);
        if let Err(e) = self.transport.write(&format!("{CMD_NICK} {next}")).await {
            tracing::warn!(error = %e, "Failed to send NICK");
        }
    }

    async fn on_nick(&self, old: &str, new: &str) {
        let (is_self, registered) = {
            let mut session = self.session.lock();
            let is_self = session.current_nick.eq_ignore_ascii_case(old);
            if is_self {
                session.current_nick = new.to_string();
                if session.nicks.is_primary(new) {
                    session.nicks.reset();
                    tracing::info!(irc.nick = %new, "Reclaimed primary nickname");
                }
            }
            (is_self, session.registered)
        };

        self.users.rename(old, new);
        log_store(self.tracker.on_nick_change(old, new).await, "NICK");

        if is_self {
            if registered {
                self.set_status(ConnectionStatus::Registered {
                    nick: new.to_string(),
                });
            }
        } else if self.config.nick.eq_ignore_ascii_case(old) {
            self.try_reclaim().await;
        }
    }

    async fn on_join(
        &self,
        channel: &str,
        nick: &str,
        user: Option<&str>,
        host: Option<&str>,
        known: bool,
    ) {
        let is_self = self.current_nick().eq_ignore_ascii_case(nick);
        if is_self {
            self.rejoin.on_joined(channel);
        } else if known || self.netsplit.recently_quit(nick) {
            self.netsplit.on_join(nick);
        }
        log_store(self.tracker.on_join(channel, nick, user, host).await, "JOIN");
    }

    async fn on_kick(&self, channel: &str, victim: &str, reason: Option<&str>) {
        log_store(self.tracker.on_kick(channel, victim).await, "KICK");
        self.forget_if_gone(victim).await;
        if self.current_nick().eq_ignore_ascii_case(victim) {
            tracing::warn!(channel.name = %channel, reason = reason.unwrap_or_default(), "Kicked from channel");
            self.schedule_rejoin(channel);
        }
    }

    fn schedule_rejoin(&self, channel: &str) {
        if self.is_disabled(channel) {
            tracing::info!(channel.name = %channel, "Channel disabled, not rejoining");
            return;
        }
        self.rejoin.schedule(channel, self.transport.clone());
    }

    async fn on_quit(&self, nick: &str, known: bool) {
        if self.current_nick().eq_ignore_ascii_case(nick) {
            return;
        }
        let channels = match self.tracker.on_quit(nick).await {
            Ok(channels) => channels,
            Err(e) => {
                log_store(Err(e), "QUIT");
                Vec::new()
            }
        };
        // Channel members count as known even if they never spoke.
        if known || !channels.is_empty() {
            self.netsplit.on_quit(nick);
        }
        self.users.forget(nick);
        if self.config.nick.eq_ignore_ascii_case(nick) {
            self.try_reclaim().await;
        }
    }

    /// Evicts a departed user's identity once they share no tracked channel.
    async fn forget_if_gone(&self, nick: &str) {
        if self.current_nick().eq_ignore_ascii_case(nick) {
            return;
        }
        match self.tracker.shares_channel(nick).await {
            Ok(false) => {
                self.users.forget(nick);
            }
            Ok(true) => {}
            Err(e) => tracing::warn!(irc.nick = %nick, error = %e, "Failed to check channel membership"),
        }
    }

    /// Asks for the primary nickname once another client released it.
    async fn try_reclaim(&self) {
        let should_try = {
            let session = self.session.lock();
            session.registered && !session.nicks.is_primary(&session.current_nick)
        };
        if !should_try {
            return;
        }
        tracing::info!(irc.nick = %self.config.nick, "Primary nickname freed, reclaiming");
        let _ = self
            .transport
            .write(&format!("{CMD_NICK} {}", self.config.nick))
            .await;
    }

    async fn on_invite(&self, channel: &str, inviter: &str) {
        let configured = self
            .config
            .autojoin
            .iter()
            .any(|c| c.eq_ignore_ascii_case(channel));
        if !configured || self.is_disabled(channel) || self.rejoin.is_banned(channel) {
            tracing::info!(channel.name = %channel, irc.nick = %inviter, "Ignoring invite");
            return;
        }
        tracing::info!(channel.name = %channel, irc.nick = %inviter, "Accepting invite");
        if let Err(e) = self.join(channel).await {
            tracing::warn!(channel.name = %channel, error = %e, "Failed to join after invite");
        }
    }

    async fn on_privmsg(&self, message: &IrcMessage<'_>, nick: &str, target: &str, text: &str) {
        match self.ctcp.handle(nick, text) {
            CtcpOutcome::NotCtcp => {}
            CtcpOutcome::Handled { reply: Some(reply) } => {
                if let Err(e) = self.transport.write(&reply).await {
                    tracing::warn!(error = %e, "Failed to send CTCP reply");
                }
                return;
            }
            CtcpOutcome::Handled { reply: None } => return,
            CtcpOutcome::Action(action) => {
                tracing::info!(irc.target = %target, "{action}");
                return;
            }
        }

        let reply_to = if is_channel(target) { target } else { nick };
        let private = PrivateMessage {
            target: target.to_string(),
            sender_nick: nick.to_string(),
            sender_user: message.user().map(str::to_string),
            sender_host: message.host().map(str::to_string),
            text: text.to_string(),
            reply_to: reply_to.to_string(),
            timestamp: Utc::now(),
        };
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move { handler.handle(private).await });
    }
}

fn log_store(result: std::result::Result<(), StoreError>, event: &'static str) {
    if let Err(e) = result {
        tracing::warn!(event, error = %e, "Failed to update channel state");
    }
}

#[async_trait]
impl ConnectionControl for ConnectionManager {
    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }

    fn is_registered(&self) -> bool {
        ConnectionManager::is_registered(self)
    }

    fn since_last_pong(&self) -> Option<Duration> {
        self.session.lock().last_pong_at.map(|at| at.elapsed())
    }

    async fn connect(&self) -> Result<()> {
        ConnectionManager::connect(self).await
    }

    async fn disconnect(&self, reason: &str) {
        ConnectionManager::disconnect(self, reason).await
    }

    async fn send_ping(&self) -> Result<()> {
        self.session.lock().last_ping_at = Some(Instant::now());
        self.transport
            .write(&format!("{CMD_PING} :kestrel-{}", Utc::now().timestamp()))
            .await
    }

    async fn rejoin_previous(&self) {
        let channels = std::mem::take(&mut *self.previous_channels.lock());
        for channel in channels {
            let autojoined = self
                .config
                .autojoin
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&channel));
            if autojoined || self.is_disabled(&channel) || self.rejoin.is_banned(&channel) {
                continue;
            }
            tracing::info!(channel.name = %channel, "Rejoining after reconnect");
            if let Err(e) = self.join(&channel).await {
                tracing::warn!(channel.name = %channel, error = %e, "Rejoin failed");
            }
        }
    }

    fn on_reconnect_failed(&self, reason: &str, attempt: u32, retry_in: Duration) {
        self.set_status(ConnectionStatus::Reconnecting {
            reason: reason.to_string(),
            failed_attempt: attempt,
            retry_in,
        });
    }
}
