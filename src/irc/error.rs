use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IrcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),
    #[error("TCP connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("Not connected to an IRC server")]
    NotConnected,
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Registration did not complete within {0:?}")]
    RegistrationTimeout(Duration),
    #[error("No PONG received for {0:?}")]
    PingTimeout(Duration),
    #[error("Capability negotiation failed: NAK received for {0}")]
    CapabilityNak(String),
    #[error("SASL authentication failed: {0}")]
    SaslFailed(String),
    #[error("Timed out waiting for {0}")]
    AuthStepTimeout(&'static str),
    #[error("Failed to queue outbound line: {0}")]
    SendFailed(String),
    #[error("No WHOIS/WHOWAS reply for {0}")]
    LookupTimeout(String),
}

pub type Result<T, E = IrcError> = std::result::Result<T, E>;
