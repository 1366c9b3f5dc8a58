use crate::error::{ConfigError, Result as AppResult};
use crate::irc::auth::Credentials;
use crate::irc::connection::ConnectionConfig;
use crate::irc::reconnect::ReconnectConfig;
use crate::irc::transport::TransportConfig;
use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub tls_insecure: bool,
}

#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    pub nick: String,
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub alt_nicks: Vec<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct AuthConfig {
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub nickserv_password: Option<String>,
}

// Passwords stay out of the startup log.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("sasl_username", &self.sasl_username)
            .field("sasl_password", &self.sasl_password.as_ref().map(|_| "***"))
            .field("nickserv_password", &self.nickserv_password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub autojoin: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub disabled: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReconnectSettings {
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct CommandServiceConfig {
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub breaker_threshold: u32,
    pub breaker_timeout_secs: u64,
    pub command_prefix: String,
}

#[derive(Debug, Deserialize)]
pub struct CtcpConfig {
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct AppSettings {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    pub reconnect: ReconnectSettings,
    pub command_service: CommandServiceConfig,
    pub ctcp: CtcpConfig,
}

impl AppSettings {
    pub fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::plain(self.server.host.clone(), self.server.port);
        config.tls = self.server.tls;
        config.tls_insecure = self.server.tls_insecure;
        config
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(self.identity.nick.clone());
        config.alt_nicks = self.identity.alt_nicks.clone();
        if let Some(username) = &self.identity.username {
            config.username = username.clone();
        }
        if let Some(realname) = &self.identity.realname {
            config.realname = realname.clone();
        }
        config.autojoin = self.channels.autojoin.clone();
        config.disabled = self.channels.disabled.clone();
        config.ctcp_version = self.ctcp.version.clone();
        config
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            sasl_username: self.auth.sasl_username.clone(),
            sasl_password: self.auth.sasl_password.clone(),
            nickserv_password: self.auth.nickserv_password.clone(),
        }
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            min_backoff: Duration::from_secs(self.reconnect.min_backoff_secs),
            max_backoff: Duration::from_secs(self.reconnect.max_backoff_secs),
            ..ReconnectConfig::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let nick = self.identity.nick.trim();
        if nick.is_empty() {
            return Err(ConfigError::Missing("identity.nick".to_string()));
        }
        if nick.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue(format!(
                "identity.nick must not contain spaces: {nick:?}"
            )));
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Missing("server.host".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue("server.port must be non-zero".to_string()));
        }
        if self.reconnect.min_backoff_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "reconnect.min_backoff_secs must be non-zero".to_string(),
            ));
        }
        if self.reconnect.max_backoff_secs < self.reconnect.min_backoff_secs {
            return Err(ConfigError::InvalidValue(
                "reconnect.max_backoff_secs must be >= reconnect.min_backoff_secs".to_string(),
            ));
        }
        if self.command_service.breaker_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "command_service.breaker_threshold must be at least 1".to_string(),
            ));
        }
        if self.auth.sasl_username.is_some() != self.auth.sasl_password.is_some() {
            return Err(ConfigError::InvalidValue(
                "auth.sasl_username and auth.sasl_password must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load_settings() -> AppResult<AppSettings> {
    let builder = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("KESTREL")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("identity.alt_nicks")
                .with_list_parse_key("channels.autojoin")
                .with_list_parse_key("channels.disabled")
                .try_parsing(true),
        );
    build_settings(builder)
}

fn build_settings(builder: ConfigBuilder<DefaultState>) -> AppResult<AppSettings> {
    let settings = with_defaults(builder)
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: AppSettings = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
    builder
        .set_default("server.port", 6697)?
        .set_default("server.tls", true)?
        .set_default("server.tls_insecure", false)?
        .set_default("reconnect.min_backoff_secs", 5)?
        .set_default("reconnect.max_backoff_secs", 300)?
        .set_default("command_service.timeout_secs", 10)?
        .set_default("command_service.breaker_threshold", 5)?
        .set_default("command_service.breaker_timeout_secs", 60)?
        .set_default("command_service.command_prefix", "!")?
        .set_default(
            "ctcp.version",
            format!("kestrel {}", env!("CARGO_PKG_VERSION")),
        )
}

fn deserialize_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    let value = Value::deserialize(deserializer)?;
    let items = match value {
        Value::String(s) => s.split(',').map(|item| item.trim().to_string()).collect(),
        Value::Array(arr) => arr
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.trim().to_string()),
                _ => Err(D::Error::custom("Array must contain only strings")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Value::Null => Vec::new(),
        _ => return Err(D::Error::custom("Expected string or array of strings")),
    };
    Ok(items.into_iter().filter(|item| !item.is_empty()).collect())
}
