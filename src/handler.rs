//! Per-connection request/response loop.
//!
//! A handler owns one connection and drives it through
//!
//! ```text
//! AwaitFrame -> ProcessFrame -> WriteResponse -> AwaitFrame ...
//! ```
//!
//! until the peer closes the stream or an error ends the session. The read
//! deadline is re-armed every time the loop comes back to `AwaitFrame`, so a
//! session may stay open indefinitely as long as each request arrives within
//! the read timeout.

use crate::codec::Frame;
use crate::connection::Connection;
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

/// The business logic behind a request.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Produce the response for one request line.
    async fn call(&self, request: &str) -> String;
}

/// Reference service: answers with a line embedding the request.
#[derive(Debug, Clone, Default)]
pub struct EchoService {
    host_cid: Option<u32>,
}

impl EchoService {
    /// `host_cid` is appended to every response when known.
    pub fn new(host_cid: Option<u32>) -> Self {
        Self { host_cid }
    }
}

#[async_trait]
impl Service for EchoService {
    async fn call(&self, request: &str) -> String {
        match self.host_cid {
            Some(cid) => format!("host processed request: {request} | host cid={cid}"),
            None => format!("host processed request: {request}"),
        }
    }
}

/// Deadlines applied to every exchange.
#[derive(Debug, Clone, Copy)]
pub struct HandlerConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// How a session ended.
#[derive(Debug)]
pub enum Outcome {
    /// The peer closed the stream between requests.
    ClosedOk { exchanges: u64 },
    /// A read, write, deadline or protocol failure ended the session.
    ClosedError { exchanges: u64, error: RelayError },
}

impl Outcome {
    pub fn exchanges(&self) -> u64 {
        match self {
            Outcome::ClosedOk { exchanges } | Outcome::ClosedError { exchanges, .. } => *exchanges,
        }
    }

    /// The failure that ended the session, if any.
    pub fn error(&self) -> Option<&RelayError> {
        match self {
            Outcome::ClosedOk { .. } => None,
            Outcome::ClosedError { error, .. } => Some(error),
        }
    }
}

#[derive(Debug)]
enum SessionState {
    AwaitFrame,
    ProcessFrame(Frame),
    WriteResponse(Frame),
}

/// Drives connections for one service.
pub struct ConnectionHandler<T> {
    service: Arc<T>,
    config: HandlerConfig,
}

impl<T> Clone for ConnectionHandler<T> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            config: self.config,
        }
    }
}

impl<T: Service> ConnectionHandler<T> {
    pub fn new(service: Arc<T>, config: HandlerConfig) -> Self {
        Self { service, config }
    }

    /// Run the session to completion and close the connection.
    ///
    /// The connection is closed exactly once on every exit path.
    pub async fn handle<S>(&self, mut conn: Connection<S>) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut exchanges = 0;
        let result = self.run(&mut conn, &mut exchanges).await;
        let peer = conn.peer().to_string();
        conn.close().await;

        match result {
            Ok(()) => {
                debug!(peer = %peer, exchanges, "Session ended by peer");
                Outcome::ClosedOk { exchanges }
            }
            Err(RelayError::Closed) => {
                debug!(peer = %peer, exchanges, "Session closed during shutdown");
                Outcome::ClosedError {
                    exchanges,
                    error: RelayError::Closed,
                }
            }
            Err(error) if error.is_timeout() => {
                debug!(peer = %peer, exchanges, error = %error, "Session timed out");
                Outcome::ClosedError { exchanges, error }
            }
            Err(error) => {
                warn!(peer = %peer, exchanges, error = %error, "Session failed");
                Outcome::ClosedError { exchanges, error }
            }
        }
    }

    async fn run<S>(&self, conn: &mut Connection<S>, exchanges: &mut u64) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut state = SessionState::AwaitFrame;

        loop {
            state = match state {
                SessionState::AwaitFrame => {
                    conn.set_read_deadline(self.config.read_timeout);
                    match conn.read_frame().await? {
                        Some(request) => SessionState::ProcessFrame(request),
                        None => return Ok(()),
                    }
                }
                SessionState::ProcessFrame(request) => {
                    let text = request.to_text()?;
                    trace!(peer = %conn.peer(), request = %text, "Processing request");
                    let response = self.service.call(text).await;
                    SessionState::WriteResponse(Frame::from(response))
                }
                SessionState::WriteResponse(response) => {
                    conn.set_write_deadline(self.config.write_timeout);
                    conn.write_frame(response).await?;
                    *exchanges += 1;
                    SessionState::AwaitFrame
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoDirection;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio_test::io::Builder;

    fn handler(read_timeout: Duration) -> ConnectionHandler<EchoService> {
        ConnectionHandler::new(
            Arc::new(EchoService::default()),
            HandlerConfig {
                read_timeout,
                write_timeout: Duration::from_secs(30),
            },
        )
    }

    struct MultiLine;

    #[async_trait]
    impl Service for MultiLine {
        async fn call(&self, request: &str) -> String {
            format!("{request}\n{request}")
        }
    }

    #[tokio::test]
    async fn test_echo_service_response() {
        assert_eq!(
            EchoService::default().call("hello").await,
            "host processed request: hello"
        );
        assert_eq!(
            EchoService::new(Some(3)).call("hello").await,
            "host processed request: hello | host cid=3"
        );
    }

    #[tokio::test]
    async fn test_requests_answered_in_order() {
        // The mock enforces that each response is written before the next
        // request is read.
        let stream = Builder::new()
            .read(b"hello\n")
            .write(b"host processed request: hello\n")
            .read(b"world\n")
            .write(b"host processed request: world\n")
            .build();

        let outcome = handler(Duration::from_secs(30))
            .handle(Connection::new(stream, "mock", 1024))
            .await;

        assert!(matches!(outcome, Outcome::ClosedOk { exchanges: 2 }));
        assert!(outcome.error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_slides_between_requests() {
        let gap = Duration::from_millis(600);
        let stream = Builder::new()
            .read(b"a\n")
            .write(b"host processed request: a\n")
            .wait(gap)
            .read(b"b\n")
            .write(b"host processed request: b\n")
            .wait(gap)
            .read(b"c\n")
            .write(b"host processed request: c\n")
            .build();

        let outcome = handler(Duration::from_secs(1))
            .handle(Connection::new(stream, "mock", 1024))
            .await;

        assert!(matches!(outcome, Outcome::ClosedOk { exchanges: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_closed_without_response() {
        let (mut client, server) = duplex(1024);

        let outcome = handler(Duration::from_secs(30))
            .handle(Connection::new(server, "silent", 1024))
            .await;

        assert!(matches!(
            outcome,
            Outcome::ClosedError {
                exchanges: 0,
                error: RelayError::DeadlineExceeded {
                    op: IoDirection::Read,
                    ..
                }
            }
        ));

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_silent_after_last_frame() {
        let (client, server) = duplex(1024);
        let task = tokio::spawn(async move {
            handler(Duration::from_secs(30))
                .handle(Connection::new(server, "idle", 1024))
                .await
        });

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);
        write_half.write_all(b"once\n").await.unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "host processed request: once\n");

        line.clear();
        assert_eq!(reader.read_line(&mut line).await.unwrap(), 0);

        let outcome = task.await.unwrap();
        assert_eq!(outcome.exchanges(), 1);
        assert!(matches!(
            outcome,
            Outcome::ClosedError {
                error: RelayError::DeadlineExceeded { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_protocol_violation() {
        let stream = Builder::new().read(&[0xff, 0xfe, b'\n']).build();

        let outcome = handler(Duration::from_secs(30))
            .handle(Connection::new(stream, "mock", 1024))
            .await;

        assert!(matches!(
            outcome,
            Outcome::ClosedError {
                error: RelayError::ProtocolViolation(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_violation() {
        let stream = Builder::new().read(b"far too long\n").build();

        let outcome = handler(Duration::from_secs(30))
            .handle(Connection::new(stream, "mock", 4))
            .await;

        assert!(matches!(
            outcome.error(),
            Some(RelayError::ProtocolViolation(_))
        ));
        assert!(matches!(
            outcome,
            Outcome::ClosedError {
                exchanges: 0,
                error: RelayError::ProtocolViolation(_),
            }
        ));
    }

    #[tokio::test]
    async fn test_response_with_delimiter_rejected() {
        let stream = Builder::new().read(b"x\n").build();
        let handler = ConnectionHandler::new(
            Arc::new(MultiLine),
            HandlerConfig {
                read_timeout: Duration::from_secs(30),
                write_timeout: Duration::from_secs(30),
            },
        );

        let outcome = handler.handle(Connection::new(stream, "mock", 1024)).await;

        assert!(matches!(
            outcome,
            Outcome::ClosedError {
                error: RelayError::ProtocolViolation(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_external_close_ends_session() {
        let (_client, server) = duplex(1024);
        let conn = Connection::new(server, "idle", 1024);
        let closer = conn.closer();
        closer.cancel();

        let outcome = handler(Duration::from_secs(30)).handle(conn).await;

        assert!(matches!(
            outcome,
            Outcome::ClosedError {
                error: RelayError::Closed,
                ..
            }
        ));
    }
}
