use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::error::{IrcError, Result};
use super::irc_parser::{CAP_SASL, CMD_AUTHENTICATE, CMD_CAP, CMD_PRIVMSG};
use super::transport::Transport;

pub const AUTH_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const SASL_CHUNK_SIZE: usize = 400;
const NICKSERV: &str = "NickServ";

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub nickserv_password: Option<String>,
}

impl Credentials {
    fn sasl(&self) -> Option<(&str, &str)> {
        match (&self.sasl_username, &self.sasl_password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user.as_str(), pass.as_str()))
            }
            _ => None,
        }
    }

    fn nickserv(&self) -> Option<&str> {
        self.nickserv_password.as_deref().filter(|p| !p.is_empty())
    }
}

/// Events from the dispatch path that the SASL exchange waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSignal {
    CapAck(String),
    CapNak(String),
    /// `AUTHENTICATE +`
    Continue,
    SaslSuccess,
    SaslFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Sasl,
    /// IDENTIFY is to be sent to NickServ once registration completes.
    NickServ,
    /// SASL failed and nothing else is configured.
    Failed,
    None,
}

pub fn encode_plain(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{username}\0{password}").as_bytes())
}

/// `AUTHENTICATE` lines carrying `payload`, in 400-byte chunks.
fn authenticate_lines(payload: &str) -> Vec<String> {
    let mut lines: Vec<String> = payload
        .as_bytes()
        .chunks(SASL_CHUNK_SIZE)
        .map(|chunk| format!("{CMD_AUTHENTICATE} {}", String::from_utf8_lossy(chunk)))
        .collect();
    if payload.is_empty() || payload.len() % SASL_CHUNK_SIZE == 0 {
        lines.push(format!("{CMD_AUTHENTICATE} +"));
    }
    lines
}

pub struct Authenticator {
    credentials: Credentials,
    step_timeout: Duration,
    signal_tx: mpsc::Sender<AuthSignal>,
    signal_rx: Mutex<mpsc::Receiver<AuthSignal>>,
}

impl Authenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_step_timeout(credentials, AUTH_STEP_TIMEOUT)
    }

    pub fn with_step_timeout(credentials: Credentials, step_timeout: Duration) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        Self {
            credentials,
            step_timeout,
            signal_tx,
            signal_rx: Mutex::new(signal_rx),
        }
    }

    pub fn sasl_configured(&self) -> bool {
        self.credentials.sasl().is_some()
    }

    /// Hands a signal to the waiting exchange. Never blocks the caller; a
    /// signal nobody is waiting for is dropped.
    pub fn signal(&self, signal: AuthSignal) {
        if let Err(e) = self.signal_tx.try_send(signal) {
            tracing::debug!(error = %e, "Dropping unexpected authentication signal");
        }
    }

    /// The NickServ IDENTIFY line, if a NickServ password is configured.
    pub fn identify_line(&self) -> Option<String> {
        self.credentials
            .nickserv()
            .map(|password| format!("{CMD_PRIVMSG} {NICKSERV} :IDENTIFY {password}"))
    }

    /// Runs the handshake preamble: requests SASL when configured, sends the
    /// `registration` lines, then completes the SASL exchange.
    ///
    /// Authentication failures never fail the connection; only transport
    /// errors are returned.
    pub async fn authenticate(
        &self,
        transport: &Transport,
        registration: &[String],
        cancel: &CancellationToken,
    ) -> Result<AuthOutcome> {
        let Some((username, password)) = self.credentials.sasl() else {
            for line in registration {
                transport.write(line).await?;
            }
            return Ok(self.fallback("no SASL credentials"));
        };

        self.drain().await;
        transport.write(&format!("{CMD_CAP} REQ :{CAP_SASL}")).await?;
        for line in registration {
            transport.write(line).await?;
        }

        let result = self.sasl_exchange(transport, username, password, cancel).await;
        // Registration is held until CAP END whatever the result.
        transport.write(&format!("{CMD_CAP} END")).await?;

        match result {
            Ok(()) => {
                tracing::info!(outcome = "success", sasl.user = %username, "SASL authentication succeeded");
                Ok(AuthOutcome::Sasl)
            }
            Err(e @ (IrcError::Io(_) | IrcError::NotConnected | IrcError::SendFailed(_))) => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "SASL authentication failed");
                Ok(self.fallback("SASL failed"))
            }
        }
    }

    fn fallback(&self, reason: &str) -> AuthOutcome {
        match (self.credentials.nickserv(), self.sasl_configured()) {
            (Some(_), _) => {
                tracing::info!(reason, "Falling back to NickServ IDENTIFY after registration");
                AuthOutcome::NickServ
            }
            (None, true) => {
                tracing::warn!("Continuing unauthenticated");
                AuthOutcome::Failed
            }
            (None, false) => AuthOutcome::None,
        }
    }

    async fn sasl_exchange(
        &self,
        transport: &Transport,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.next_signal("CAP ACK", cancel).await? {
            AuthSignal::CapAck(caps) if caps.split_whitespace().any(|c| c == CAP_SASL) => {}
            AuthSignal::CapNak(caps) => return Err(IrcError::CapabilityNak(caps)),
            other => {
                return Err(IrcError::SaslFailed(format!(
                    "unexpected reply to CAP REQ: {other:?}"
                )));
            }
        }

        self.drain().await;
        transport
            .write(&format!("{CMD_AUTHENTICATE} PLAIN"))
            .await?;
        match self.next_signal("AUTHENTICATE +", cancel).await? {
            AuthSignal::Continue => {}
            AuthSignal::SaslFailure(code) => return Err(IrcError::SaslFailed(code)),
            other => {
                return Err(IrcError::SaslFailed(format!(
                    "unexpected reply to AUTHENTICATE PLAIN: {other:?}"
                )));
            }
        }

        self.drain().await;
        for line in authenticate_lines(&encode_plain(username, password)) {
            transport.write(&line).await?;
        }
        match self.next_signal("SASL result", cancel).await? {
            AuthSignal::SaslSuccess => Ok(()),
            AuthSignal::SaslFailure(code) => Err(IrcError::SaslFailed(code)),
            other => Err(IrcError::SaslFailed(format!(
                "unexpected reply to credentials: {other:?}"
            ))),
        }
    }

    async fn drain(&self) {
        let mut rx = self.signal_rx.lock().await;
        while rx.try_recv().is_ok() {}
    }

    async fn next_signal(&self, step: &'static str, cancel: &CancellationToken) -> Result<AuthSignal> {
        let mut rx = self.signal_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(IrcError::NotConnected),
            received = tokio::time::timeout(self.step_timeout, rx.recv()) => match received {
                Ok(Some(signal)) => Ok(signal),
                Ok(None) => Err(IrcError::NotConnected),
                Err(_) => Err(IrcError::AuthStepTimeout(step)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::transport::TransportConfig;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn sasl_credentials(nickserv: Option<&str>) -> Credentials {
        Credentials {
            sasl_username: Some("kestrel".to_string()),
            sasl_password: Some("hunter2".to_string()),
            nickserv_password: nickserv.map(str::to_string),
        }
    }

    /// Connects a transport to a listener and returns the server side line reader.
    async fn connected() -> (
        Transport,
        tokio::io::Lines<BufReader<tokio::net::TcpStream>>,
        mpsc::Receiver<crate::irc::transport::TransportEvent>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = Transport::new(TransportConfig::plain("127.0.0.1", port));
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let (events, _cancel) = transport.connect(&CancellationToken::new()).await.unwrap();
        let socket = accept.await.unwrap();
        (transport, BufReader::new(socket).lines(), events)
    }

    #[test]
    fn test_plain_encoding() {
        let decoded = BASE64.decode(encode_plain("user", "pass")).unwrap();
        assert_eq!(decoded, b"\0user\0pass");
    }

    #[test]
    fn test_long_payload_is_chunked() {
        let payload = "A".repeat(800);
        let lines = authenticate_lines(&payload);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "AUTHENTICATE +");
        assert_eq!(authenticate_lines("abc"), vec!["AUTHENTICATE abc"]);
    }

    #[tokio::test]
    async fn test_no_credentials_sends_registration_only() {
        let (transport, mut server, _events) = connected().await;
        let auth = Authenticator::new(Credentials::default());
        let registration = vec!["NICK kestrel".to_string(), "USER k 0 * :k".to_string()];
        let outcome = auth
            .authenticate(&transport, &registration, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, AuthOutcome::None);
        assert_eq!(server.next_line().await.unwrap().unwrap(), "NICK kestrel");
    }

    #[tokio::test]
    async fn test_successful_sasl_exchange() {
        let (transport, mut server, _events) = connected().await;
        let auth = Arc::new(Authenticator::new(sasl_credentials(None)));

        let script = {
            let auth = auth.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(Some(line)) = server.next_line().await {
                    match line.as_str() {
                        "CAP REQ :sasl" => auth.signal(AuthSignal::CapAck("sasl".to_string())),
                        "AUTHENTICATE PLAIN" => auth.signal(AuthSignal::Continue),
                        l if l.starts_with("AUTHENTICATE ") => auth.signal(AuthSignal::SaslSuccess),
                        _ => {}
                    }
                    let done = line == "CAP END";
                    seen.push(line);
                    if done {
                        break;
                    }
                }
                seen
            })
        };

        let outcome = auth
            .authenticate(&transport, &["NICK kestrel".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, AuthOutcome::Sasl);
        let seen = script.await.unwrap();
        assert_eq!(seen[0], "CAP REQ :sasl");
        assert_eq!(seen[1], "NICK kestrel");
        assert_eq!(seen[2], "AUTHENTICATE PLAIN");
        assert_eq!(seen[3], format!("AUTHENTICATE {}", encode_plain("kestrel", "hunter2")));
        assert_eq!(seen[4], "CAP END");
    }

    #[tokio::test]
    async fn test_nak_falls_back_to_nickserv() {
        let (transport, mut server, _events) = connected().await;
        let auth = Arc::new(Authenticator::new(sasl_credentials(Some("secret"))));
        {
            let auth = auth.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = server.next_line().await {
                    if line == "CAP REQ :sasl" {
                        auth.signal(AuthSignal::CapNak("sasl".to_string()));
                    }
                }
            });
        }
        let outcome = auth
            .authenticate(&transport, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, AuthOutcome::NickServ);
        assert_eq!(
            auth.identify_line().as_deref(),
            Some("PRIVMSG NickServ :IDENTIFY secret")
        );
    }

    #[tokio::test]
    async fn test_step_timeout_is_a_failure_not_an_error() {
        let (transport, _server, _events) = connected().await;
        let auth = Authenticator::with_step_timeout(sasl_credentials(None), Duration::from_millis(50));
        let outcome = auth
            .authenticate(&transport, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, AuthOutcome::Failed);
    }

    #[tokio::test]
    async fn test_sasl_failure_numeric() {
        let (transport, mut server, _events) = connected().await;
        let auth = Arc::new(Authenticator::new(sasl_credentials(None)));
        {
            let auth = auth.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = server.next_line().await {
                    match line.as_str() {
                        "CAP REQ :sasl" => auth.signal(AuthSignal::CapAck("sasl".to_string())),
                        "AUTHENTICATE PLAIN" => auth.signal(AuthSignal::Continue),
                        l if l.starts_with("AUTHENTICATE ") => {
                            auth.signal(AuthSignal::SaslFailure("904".to_string()))
                        }
                        _ => {}
                    }
                }
            });
        }
        let outcome = auth
            .authenticate(&transport, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, AuthOutcome::Failed);
    }
}
