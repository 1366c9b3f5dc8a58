pub const CMD_CAP: &str = "CAP";
pub const CMD_AUTHENTICATE: &str = "AUTHENTICATE";
pub const CMD_NICK: &str = "NICK";
pub const CMD_USER: &str = "USER";
pub const CMD_JOIN: &str = "JOIN";
pub const CMD_PART: &str = "PART";
pub const CMD_KICK: &str = "KICK";
pub const CMD_MODE: &str = "MODE";
pub const CMD_TOPIC: &str = "TOPIC";
pub const CMD_INVITE: &str = "INVITE";
pub const CMD_PRIVMSG: &str = "PRIVMSG";
pub const CMD_NOTICE: &str = "NOTICE";
pub const CMD_PING: &str = "PING";
pub const CMD_PONG: &str = "PONG";
pub const CMD_QUIT: &str = "QUIT";
pub const CMD_ERROR: &str = "ERROR";
pub const CMD_WHOIS: &str = "WHOIS";
pub const CMD_WHOWAS: &str = "WHOWAS";

pub const CAP_ACK: &str = "ACK";
pub const CAP_NAK: &str = "NAK";
pub const CAP_SASL: &str = "sasl";

pub const RPL_WELCOME: &str = "001";
pub const RPL_YOURHOST: &str = "002";
pub const RPL_CREATED: &str = "003";
pub const RPL_MYINFO: &str = "004";
pub const RPL_ISUPPORT: &str = "005";
pub const RPL_WHOISUSER: &str = "311";
pub const RPL_WHOISSERVER: &str = "312";
pub const RPL_WHOISOPERATOR: &str = "313";
pub const RPL_WHOWASUSER: &str = "314";
pub const RPL_WHOISIDLE: &str = "317";
pub const RPL_ENDOFWHOIS: &str = "318";
pub const RPL_WHOISCHANNELS: &str = "319";
pub const RPL_WHOISACCOUNT: &str = "330";
pub const RPL_NOTOPIC: &str = "331";
pub const RPL_TOPIC: &str = "332";
pub const RPL_WHOISACTUALLY: &str = "338";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";
pub const RPL_ENDOFWHOWAS: &str = "369";
pub const RPL_ENDOFMOTD: &str = "376";
pub const RPL_WHOISHOST: &str = "378";
pub const RPL_WHOISMODES: &str = "379";
pub const ERR_NOSUCHNICK: &str = "401";
pub const ERR_WASNOSUCHNICK: &str = "406";
pub const ERR_NOMOTD: &str = "422";
pub const ERR_ERRONEUSNICKNAME: &str = "432";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const ERR_BANNEDFROMCHAN: &str = "474";
pub const RPL_SASLSUCCESS: &str = "903";
pub const ERR_SASLFAIL: &str = "904";
pub const ERR_SASLTOOLONG: &str = "905";
pub const ERR_SASLABORTED: &str = "906";
pub const ERR_SASLALREADY: &str = "907";

/// Maximum length of one protocol line, CRLF included.
pub const MAX_LINE_LEN: usize = 512;

#[derive(Debug, Default)]
pub struct IrcMessage<'a> {
    raw: &'a str,
    prefix: Option<&'a str>,
    command: Option<&'a str>,
    params: Vec<&'a str>,
}

impl<'a> IrcMessage<'a> {
    pub fn raw(&self) -> &'a str {
        self.raw
    }

    pub fn command(&self) -> Option<&'a str> {
        self.command
    }

    pub fn prefix(&self) -> Option<&'a str> {
        self.prefix
    }

    pub fn params(&self) -> &[&'a str] {
        &self.params
    }

    pub fn param(&self, index: usize) -> Option<&'a str> {
        self.params.get(index).copied()
    }

    /// The trailing (last) parameter, which carries free text.
    pub fn trailing(&self) -> Option<&'a str> {
        self.params.last().copied()
    }

    /// Nickname part of a `nick!user@host` prefix.
    pub fn nick(&self) -> Option<&'a str> {
        self.prefix
            .map(|p| p.split(['!', '@']).next().unwrap_or(p))
            .filter(|n| !n.is_empty())
    }

    pub fn user(&self) -> Option<&'a str> {
        let prefix = self.prefix?;
        let after_bang = &prefix[prefix.find('!')? + 1..];
        Some(after_bang.split('@').next().unwrap_or(after_bang))
    }

    pub fn host(&self) -> Option<&'a str> {
        let prefix = self.prefix?;
        Some(&prefix[prefix.find('@')? + 1..])
    }

    /// Parses one line. Message tags are accepted and skipped.
    pub fn parse(line: &'a str) -> Result<Self, String> {
        let mut message = IrcMessage {
            raw: line,
            ..Default::default()
        };
        let mut remainder = line.trim_end_matches(['\r', '\n']);

        if remainder.starts_with('@') {
            match remainder.find(' ') {
                Some(space_idx) => remainder = remainder[space_idx + 1..].trim_start(),
                None => return Err(format!("line has tags but no command: {line:?}")),
            }
        }
        if let Some(rest) = remainder.strip_prefix(':') {
            match rest.find(' ') {
                Some(space_idx) => {
                    message.prefix = Some(&rest[..space_idx]);
                    remainder = rest[space_idx + 1..].trim_start();
                }
                None => return Err(format!("line has a prefix but no command: {line:?}")),
            }
        }

        let (middle, trailing) = match remainder.find(" :") {
            Some(idx) => (&remainder[..idx], Some(&remainder[idx + 2..])),
            None => match remainder.strip_prefix(':') {
                Some(rest) => ("", Some(rest)),
                None => (remainder, None),
            },
        };
        let mut parts = middle.split(' ').filter(|s| !s.is_empty());
        message.command = parts.next();
        message.params.extend(parts);
        if let Some(trailing) = trailing {
            message.params.push(trailing);
        }

        if message.command.is_none() {
            return Err(format!("line has no command: {line:?}"));
        }
        Ok(message)
    }
}

/// Splits a `nick!user@host` mask into its nickname.
pub fn nick_of(mask: &str) -> &str {
    mask.split(['!', '@']).next().unwrap_or(mask)
}

pub fn is_channel(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}
