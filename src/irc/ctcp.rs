//! CTCP requests carried inside PRIVMSG payloads.

use chrono::Utc;

pub const CTCP_DELIM: char = '\x01';

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CtcpKind {
    Action,
    Version,
    Ping,
    Time,
    Unknown(String),
}

impl CtcpKind {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "ACTION" => Self::Action,
            "VERSION" => Self::Version,
            "PING" => Self::Ping,
            "TIME" => Self::Time,
            _ => Self::Unknown(name.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Action => "ACTION",
            Self::Version => "VERSION",
            Self::Ping => "PING",
            Self::Time => "TIME",
            Self::Unknown(s) => s,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ctcp<'a> {
    pub kind: CtcpKind,
    pub params: Option<&'a str>,
}

impl<'a> Ctcp<'a> {
    /// Parses a payload delimited by the CTCP marker on both ends.
    pub fn parse(text: &'a str) -> Option<Self> {
        let inner = text.strip_prefix(CTCP_DELIM)?.strip_suffix(CTCP_DELIM)?;
        if inner.is_empty() {
            return None;
        }
        let (command, params) = match inner.split_once(' ') {
            Some((command, params)) => (command, Some(params).filter(|p| !p.is_empty())),
            None => (inner, None),
        };
        Some(Self {
            kind: CtcpKind::parse(command),
            params,
        })
    }
}

/// Wraps a CTCP command and optional argument in delimiters.
pub fn encode(command: &str, params: Option<&str>) -> String {
    match params {
        Some(params) => format!("{CTCP_DELIM}{command} {params}{CTCP_DELIM}"),
        None => format!("{CTCP_DELIM}{command}{CTCP_DELIM}"),
    }
}

/// Result of offering a PRIVMSG payload to the CTCP handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtcpOutcome {
    /// Ordinary chat text; the caller processes it normally.
    NotCtcp,
    /// Consumed. `reply` holds a NOTICE line to send, if any.
    Handled { reply: Option<String> },
    /// An ACTION, rendered as `* nick text` for logging.
    Action(String),
}

#[derive(Debug, Clone)]
pub struct CtcpHandler {
    version: String,
}

impl CtcpHandler {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    pub fn handle(&self, sender_nick: &str, payload: &str) -> CtcpOutcome {
        let Some(ctcp) = Ctcp::parse(payload) else {
            return CtcpOutcome::NotCtcp;
        };

        let reply_body = match &ctcp.kind {
            CtcpKind::Action => {
                let text = ctcp.params.unwrap_or_default();
                return CtcpOutcome::Action(format!("* {sender_nick} {text}"));
            }
            CtcpKind::Version => encode("VERSION", Some(&self.version)),
            CtcpKind::Ping => encode("PING", ctcp.params),
            CtcpKind::Time => {
                let now = Utc::now().format("%a %b %d %H:%M:%S %Y UTC").to_string();
                encode("TIME", Some(&now))
            }
            CtcpKind::Unknown(command) => {
                tracing::debug!(
                    irc.nick = %sender_nick,
                    ctcp.command = %command,
                    "Ignoring unsupported CTCP request"
                );
                return CtcpOutcome::Handled { reply: None };
            }
        };

        tracing::debug!(
            irc.nick = %sender_nick,
            ctcp.command = %ctcp.kind.as_str(),
            "Answering CTCP request"
        );
        CtcpOutcome::Handled {
            reply: Some(format!("NOTICE {sender_nick} :{reply_body}")),
        }
    }
}
