use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerError, BreakerState, CircuitBreaker};

pub const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CommandServiceError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Command service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("JSON deserialization failed: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    pub args: Vec<String>,
    pub nick: String,
    pub hostmask: Option<String>,
    /// `None` for private queries.
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(default)]
    pub reply: Option<String>,
    /// Send the reply as a NOTICE instead of a PRIVMSG.
    #[serde(default)]
    pub notice: bool,
}

#[async_trait]
pub trait CommandService: Send + Sync {
    async fn execute(&self, request: &CommandRequest) -> Result<CommandReply, CommandServiceError>;
    async fn health_check(&self) -> Result<(), CommandServiceError>;
}

pub struct HttpCommandService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCommandService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CommandServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, CommandServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error body".to_string());
    Err(CommandServiceError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CommandService for HttpCommandService {
    async fn execute(&self, request: &CommandRequest) -> Result<CommandReply, CommandServiceError> {
        let response = self
            .client
            .post(format!("{}/command", self.base_url))
            .json(request)
            .send()
            .await?;
        let body = error_for_status(response).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn health_check(&self) -> Result<(), CommandServiceError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        error_for_status(response).await.map(|_| ())
    }
}

/// A `CommandService` behind a circuit breaker.
pub struct GuardedCommandService {
    inner: Arc<dyn CommandService>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedCommandService {
    pub fn new(inner: Arc<dyn CommandService>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn execute(
        &self,
        request: &CommandRequest,
    ) -> Result<CommandReply, BreakerError<CommandServiceError>> {
        self.breaker.call(|| self.inner.execute(request)).await
    }

    /// Probes the service while the circuit is open so it can close again
    /// without waiting for user traffic.
    pub async fn run_health_probe(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.breaker.state() != BreakerState::Open {
                        continue;
                    }
                    match self.breaker.call(|| self.inner.health_check()).await {
                        Ok(()) => tracing::info!(outcome = "success", "Command service healthy again"),
                        Err(BreakerError::Open) => tracing::debug!("Health probe skipped, circuit still open"),
                        Err(BreakerError::Inner(e)) => tracing::warn!(error = %e, "Command service health probe failed"),
                    }
                }
            }
        }
        tracing::debug!("Command service health probe stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct FakeService {
        healthy: AtomicBool,
        executed: AtomicUsize,
        health_checks: AtomicUsize,
    }

    #[async_trait]
    impl CommandService for FakeService {
        async fn execute(&self, request: &CommandRequest) -> Result<CommandReply, CommandServiceError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(CommandReply {
                    reply: Some(format!("ran {}", request.command)),
                    notice: false,
                })
            } else {
                Err(CommandServiceError::Status {
                    status: 503,
                    body: "down".to_string(),
                })
            }
        }

        async fn health_check(&self) -> Result<(), CommandServiceError> {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CommandServiceError::Status {
                    status: 503,
                    body: "down".to_string(),
                })
            }
        }
    }

    fn request() -> CommandRequest {
        CommandRequest {
            command: "uptime".to_string(),
            args: vec![],
            nick: "alice".to_string(),
            hostmask: None,
            channel: Some("#rust".to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_reported_separately() {
        let fake = Arc::new(FakeService::default());
        let guarded = GuardedCommandService::new(
            fake.clone(),
            Arc::new(CircuitBreaker::new("command-service", 2, Duration::from_secs(60))),
        );
        for _ in 0..2 {
            assert!(matches!(
                guarded.execute(&request()).await,
                Err(BreakerError::Inner(CommandServiceError::Status { status: 503, .. }))
            ));
        }
        assert!(guarded.execute(&request()).await.unwrap_err().is_open());
        assert_eq!(fake.executed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_probe_closes_circuit() {
        let fake = Arc::new(FakeService::default());
        let guarded = Arc::new(GuardedCommandService::new(
            fake.clone(),
            Arc::new(CircuitBreaker::new("command-service", 1, Duration::from_secs(10))),
        ));
        let _ = guarded.execute(&request()).await;
        assert_eq!(guarded.breaker().state(), BreakerState::Open);

        let cancel = CancellationToken::new();
        let probe = tokio::spawn(guarded.clone().run_health_probe(HEALTH_PROBE_INTERVAL, cancel.clone()));
        fake.healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(guarded.breaker().state(), BreakerState::Closed);
        assert_eq!(fake.health_checks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fake.health_checks.load(Ordering::SeqCst), 1, "no probes while closed");
        cancel.cancel();
        probe.await.unwrap();
    }

    /// Serves one canned HTTP response and returns the raw request.
    async fn one_shot_http(status_line: &'static str, body: &'static str) -> (String, Arc<Mutex<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(String::new()));
        let record = seen.clone();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            *record.lock() = String::from_utf8_lossy(&raw).to_string();
            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        (url, seen)
    }

    #[tokio::test]
    async fn test_http_execute_posts_json() {
        let (url, seen) = one_shot_http("HTTP/1.1 200 OK", r#"{"reply":"pong","notice":true}"#).await;
        let service = HttpCommandService::new(&url, Duration::from_secs(5)).unwrap();
        let reply = service.execute(&request()).await.unwrap();
        assert_eq!(
            reply,
            CommandReply {
                reply: Some("pong".to_string()),
                notice: true
            }
        );
        let raw = seen.lock().clone();
        assert!(raw.starts_with("POST /command"));
        assert!(raw.contains(r#""command":"uptime""#));
    }

    #[tokio::test]
    async fn test_http_error_status_is_surfaced() {
        let (url, _) = one_shot_http("HTTP/1.1 500 Internal Server Error", "broken").await;
        let service = HttpCommandService::new(&url, Duration::from_secs(5)).unwrap();
        match service.health_check().await {
            Err(CommandServiceError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "broken");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
