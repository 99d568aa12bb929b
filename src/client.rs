//! Initiating side: one session of strictly alternating request/response.

use crate::codec::Frame;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::dialer::dial;
use crate::error::{RelayError, Result};
use crate::transport::Connector;
use futures::stream::{self, Stream, StreamExt};
use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A connected client session.
pub struct Client<S> {
    conn: Connection<S>,
    read_timeout: Duration,
    write_timeout: Duration,
}

/// Dial the configured target within the connect timeout.
pub async fn connect<C: Connector>(
    connector: &C,
    config: &ClientConfig,
) -> Result<Client<C::Stream>> {
    let stream = dial(connector, config.target, config.connect_timeout).await?;
    let conn = Connection::new(stream, config.target.to_string(), config.max_frame_length);
    info!(target_addr = %config.target, "Connected to host");
    Ok(Client::new(conn, config.read_timeout, config.write_timeout))
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(conn: Connection<S>, read_timeout: Duration, write_timeout: Duration) -> Self {
        Client {
            conn,
            read_timeout,
            write_timeout,
        }
    }

    /// Send one request line and wait for its response line.
    pub async fn request(&mut self, message: &str) -> Result<Frame> {
        self.conn.set_write_deadline(self.write_timeout);
        self.conn.write_frame(Frame::from(message.to_string())).await?;

        self.conn.set_read_deadline(self.read_timeout);
        self.conn.read_frame().await?.ok_or(RelayError::Closed)
    }

    pub async fn close(self) {
        self.conn.close().await;
        info!("Client connection closed");
    }
}

/// Read lines from a blocking reader on a dedicated thread.
///
/// A read parked on the thread never holds up runtime shutdown, unlike
/// `tokio::io::stdin`, whose reads occupy a blocking-pool thread that the
/// runtime waits for. The thread exits once the reader ends or the stream is
/// dropped and another line arrives.
pub fn spawn_line_reader<R>(
    reader: R,
) -> io::Result<impl Stream<Item = io::Result<String>> + Unpin>
where
    R: BufRead + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(1);
    thread::Builder::new()
        .name("line-reader".to_string())
        .spawn(move || {
            for line in reader.lines() {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)))
}

/// Send each line of `input` as a request and print responses to `output`
/// until `exit`, end of input, or the session breaks. Returns the number of
/// completed exchanges.
///
/// A response that is not UTF-8 is reported and the loop goes on; the frame
/// was consumed whole, so the stream stays aligned. Any other failure ends
/// the session, since leftover bytes or a late response would otherwise be
/// taken as the answer to the next request.
pub async fn run_interactive<S, I, W>(
    client: &mut Client<S>,
    mut input: I,
    mut output: W,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    I: Stream<Item = io::Result<String>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut exchanges = 0;

    output
        .write_all(b"===== type a message for the host (exit to quit) =====\n")
        .await?;

    loop {
        output.write_all(b"> ").await?;
        output.flush().await?;

        let Some(line) = input.next().await else {
            break;
        };
        let line = line?;
        if line == "exit" {
            info!("Exit requested");
            break;
        }

        let response = match client.request(&line).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Request failed, ending session");
                return Err(e);
            }
        };
        match response.to_text() {
            Ok(text) => {
                output.write_all(format!("< {text}\n").as_bytes()).await?;
                exchanges += 1;
            }
            Err(e) => warn!(error = %e, "Skipping response"),
        }
    }

    output.flush().await?;
    Ok(exchanges)
}
