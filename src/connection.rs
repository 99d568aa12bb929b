//! Deadline-bounded framed connection.
//!
//! Wraps any bidirectional byte stream with the line codec and optional
//! read/write deadlines. Every accepted or dialed stream is wrapped in a
//! `Connection`, so deadline support is a property of the type rather than
//! something discovered at runtime.
//!
//! A connection can also be closed from outside its owner through the
//! cancellation token returned by [`Connection::closer`]; the owner's next
//! read or write then fails with [`RelayError::Closed`].

use crate::codec::{Frame, LineCodec};
use crate::error::{IoDirection, RelayError, Result};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// An armed deadline and the timeout it was derived from.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    fn exceeded(&self, op: IoDirection) -> RelayError {
        RelayError::DeadlineExceeded {
            op,
            timeout: self.timeout,
        }
    }
}

/// A framed byte stream bound to one peer.
pub struct Connection<S> {
    framed: Framed<S, LineCodec>,
    peer: String,
    read_deadline: Option<Deadline>,
    write_deadline: Option<Deadline>,
    closer: CancellationToken,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("closed", &self.closer.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>, max_frame_length: usize) -> Self {
        Connection {
            framed: Framed::new(stream, LineCodec::with_max_length(max_frame_length)),
            peer: peer.into(),
            read_deadline: None,
            write_deadline: None,
            closer: CancellationToken::new(),
        }
    }

    /// Tie this connection to an external close signal, typically a child of
    /// the server's shutdown token.
    pub fn with_closer(mut self, closer: CancellationToken) -> Self {
        self.closer = closer;
        self
    }

    /// Token that closes this connection from outside when cancelled.
    #[cfg(test)]
    pub fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Arm the read deadline at now + `timeout`.
    pub fn set_read_deadline(&mut self, timeout: Duration) {
        self.read_deadline = Some(Deadline::after(timeout));
    }

    /// Arm the write deadline at now + `timeout`.
    pub fn set_write_deadline(&mut self, timeout: Duration) {
        self.write_deadline = Some(Deadline::after(timeout));
    }

    /// Read one frame. `Ok(None)` means the peer closed the stream cleanly.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Connection {
            framed,
            read_deadline,
            closer,
            ..
        } = self;

        if closer.is_cancelled() {
            return Err(RelayError::Closed);
        }

        let read = async {
            match read_deadline {
                Some(deadline) => timeout_at(deadline.at, framed.next())
                    .await
                    .map_err(|_| deadline.exceeded(IoDirection::Read)),
                None => Ok(framed.next().await),
            }
        };

        tokio::select! {
            biased;
            _ = closer.cancelled() => Err(RelayError::Closed),
            next = read => next?.transpose(),
        }
    }

    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let Connection {
            framed,
            write_deadline,
            closer,
            ..
        } = self;

        if closer.is_cancelled() {
            return Err(RelayError::Closed);
        }

        let write = async {
            match write_deadline {
                Some(deadline) => timeout_at(deadline.at, framed.send(frame))
                    .await
                    .unwrap_or_else(|_| Err(deadline.exceeded(IoDirection::Write))),
                None => framed.send(frame).await,
            }
        };

        tokio::select! {
            biased;
            _ = closer.cancelled() => Err(RelayError::Closed),
            result = write => result,
        }
    }

    /// Close the connection. Consuming `self` makes this happen once.
    ///
    /// Attempts an orderly shutdown of the write half, bounded by the write
    /// deadline, unless the connection was already closed from outside.
    pub async fn close(self) {
        let closed_externally = self.closer.is_cancelled();
        let write_deadline = self.write_deadline;
        let peer = self.peer;
        let mut stream = self.framed.into_inner();

        if !closed_externally {
            let result = match write_deadline {
                Some(deadline) => timeout_at(deadline.at, stream.shutdown())
                    .await
                    .unwrap_or(Ok(())),
                None => stream.shutdown().await,
            };
            if let Err(e) = result {
                trace!(peer = %peer, error = %e, "Shutdown on close failed");
            }
        }
        trace!(peer = %peer, "Connection closed");
    }
}
