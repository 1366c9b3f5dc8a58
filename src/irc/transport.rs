use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

use super::error::{IrcError, Result};
use super::irc_parser::MAX_LINE_LEN;

const WRITE_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Line(String),
    Closed(String),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub tls_insecure: bool,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            tls_insecure: false,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

trait IrcStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IrcStream for T {}

struct Link {
    write_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// Owns the socket of one connection at a time and its line framing.
///
/// Each `connect` replaces the previous link; lines read from the socket are
/// delivered on the receiver returned by `connect` in arrival order.
pub struct Transport {
    config: TransportConfig,
    link: Mutex<Option<Link>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Opens a fresh socket. The returned token is cancelled when the link
    /// closes for any reason, and cancelling it closes the link.
    pub async fn connect(
        &self,
        parent: &CancellationToken,
    ) -> Result<(mpsc::Receiver<TransportEvent>, CancellationToken)> {
        self.disconnect();

        let addr = self.config.addr();
        let tcp = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| IrcError::ConnectTimeout {
                addr: addr.clone(),
                timeout: self.config.connect_timeout,
            })??;
        tcp.set_nodelay(true)?;
        tracing::debug!(irc.server = %addr, tls = self.config.tls, "TCP connected");

        let stream: Box<dyn IrcStream> = if self.config.tls {
            let tls_config = if self.config.tls_insecure {
                tracing::warn!(irc.server = %addr, "TLS certificate verification disabled");
                insecure_tls_config()
            } else {
                default_tls_config()
            };
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(self.config.host.clone())
                .map_err(|_| IrcError::InvalidServerName(self.config.host.clone()))?;
            let tls = connector.connect(server_name, tcp).await?;
            tracing::debug!(irc.server = %addr, "TLS handshake complete");
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let cancel = parent.child_token();
        let (reader, writer) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::channel::<String>(WRITE_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(EVENT_BUFFER);

        tokio::spawn(write_loop(writer, write_rx, event_tx.clone(), cancel.clone()));
        tokio::spawn(read_loop(reader, event_tx, cancel.clone()));

        *self.link.lock() = Some(Link {
            write_tx,
            cancel: cancel.clone(),
        });
        Ok((event_rx, cancel))
    }

    /// Queues one protocol line; CRLF is appended here.
    pub async fn write(&self, line: &str) -> Result<()> {
        if line.contains(['\r', '\n']) {
            return Err(IrcError::SendFailed("line contains CR or LF".to_string()));
        }
        if line.len() + 2 > MAX_LINE_LEN {
            tracing::warn!(len = line.len(), "Outbound line exceeds the protocol limit");
        }
        let write_tx = {
            let guard = self.link.lock();
            match guard.as_ref() {
                Some(link) if !link.cancel.is_cancelled() => link.write_tx.clone(),
                _ => return Err(IrcError::NotConnected),
            }
        };
        write_tx
            .send(format!("{line}\r\n"))
            .await
            .map_err(|e| IrcError::SendFailed(e.to_string()))
    }

    /// Closes the current link, if any. Lines already queued are flushed first.
    pub fn disconnect(&self) {
        if let Some(link) = self.link.lock().take() {
            link.cancel.cancel();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.cancel.is_cancelled())
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut write_rx: mpsc::Receiver<String>,
    event_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = write_rx.recv() => message,
            _ = cancel.cancelled() => None,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(e) = writer.write_all(message.as_bytes()).await {
            let _ = event_tx.try_send(TransportEvent::Closed(format!("Write error: {e}")));
            cancel.cancel();
            break;
        }
        if let Err(e) = writer.flush().await {
            let _ = event_tx.try_send(TransportEvent::Closed(format!("Flush error: {e}")));
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: R,
    event_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(MAX_LINE_LEN);
    let reason = loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break "Disconnected locally".to_string(),
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break "Connection closed by server".to_string(),
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                if event_tx
                    .send(TransportEvent::Line(line.to_string()))
                    .await
                    .is_err()
                {
                    break "Event receiver dropped".to_string();
                }
            }
            Err(e) => break format!("Read error: {e}"),
        }
    };
    cancel.cancel();
    let _ = event_tx.send(TransportEvent::Closed(reason)).await;
}

fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn default_tls_config() -> rustls::ClientConfig {
    install_crypto_provider();
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn insecure_tls_config() -> rustls::ClientConfig {
    install_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|provider| provider.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, TransportConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, TransportConfig::plain("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_lines_flow_both_ways() {
        let (listener, config) = listener().await;
        let transport = Transport::new(config);
        let root = CancellationToken::new();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"PING :abc\r\n").await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let (mut events, _cancel) = transport.connect(&root).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Line("PING :abc".to_string()))
        );
        transport.write("PONG :abc").await.unwrap();
        assert_eq!(server.await.unwrap(), "PONG :abc\r\n");
    }

    #[tokio::test]
    async fn test_server_close_is_reported() {
        let (listener, config) = listener().await;
        let transport = Transport::new(config);
        let root = CancellationToken::new();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let (mut events, cancel) = transport.connect(&root).await.unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Closed(_))));
        assert!(cancel.is_cancelled());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_write_without_link_fails() {
        let transport = Transport::new(TransportConfig::plain("127.0.0.1", 1));
        assert!(matches!(
            transport.write("NICK x").await,
            Err(IrcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_embedded_newline_is_rejected() {
        let (listener, config) = listener().await;
        let transport = Transport::new(config);
        tokio::spawn(async move {
            let _keep = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let _link = transport.connect(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            transport.write("PRIVMSG #a :x\r\nQUIT").await,
            Err(IrcError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_link() {
        let (listener, config) = listener().await;
        let transport = Transport::new(config);
        tokio::spawn(async move {
            let _keep = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let (_events, cancel) = transport.connect(&CancellationToken::new()).await.unwrap();
        transport.disconnect();
        assert!(cancel.is_cancelled());
        assert!(!transport.is_connected());
    }
}
