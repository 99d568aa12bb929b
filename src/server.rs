//! Acceptor and server composition.
//!
//! Accepts connections from a listener and hands each one to the worker
//! pool. Submission waits while the admission queue is full; while it waits
//! the acceptor stops draining the transport backlog, so excess load backs
//! up at the listener instead of inside the process.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::handler::{ConnectionHandler, HandlerConfig, Service};
use crate::pool::{PoolClosed, WorkerPool};
use crate::transport::Listener;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Server instance
pub struct Server<T> {
    config: ServerConfig,
    service: Arc<T>,
}

impl<T: Service> Server<T> {
    /// Create a new server instance
    pub fn new(config: ServerConfig, service: Arc<T>) -> Self {
        Server { config, service }
    }

    /// Accept connections until `shutdown` is cancelled, then stop the pool.
    ///
    /// On shutdown, queued connections are closed and running sessions are
    /// closed under their owners; this returns once every worker is done.
    pub async fn run<L: Listener>(&self, mut listener: L, shutdown: CancellationToken) {
        let handler = ConnectionHandler::new(
            Arc::clone(&self.service),
            HandlerConfig {
                read_timeout: self.config.read_timeout,
                write_timeout: self.config.write_timeout,
            },
        );
        let pool = WorkerPool::start(self.config.workers, handler, shutdown.clone());

        match listener.local_addr() {
            Ok(address) => info!(address = %address, workers = pool.size(), "Server listening"),
            Err(e) => info!(error = %e, workers = pool.size(), "Server listening"),
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            info!(peer = %peer, "Accepted connection");
            let conn = Connection::new(stream, peer.to_string(), self.config.max_frame_length)
                .with_closer(shutdown.child_token());

            let submitted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                submitted = pool.submit(conn) => submitted,
            };
            if let Err(PoolClosed(conn)) = submitted {
                debug!(peer = %conn.peer(), "Pool closed, dropping connection");
                conn.close().await;
                break;
            }
        }

        info!("Acceptor stopped");
        pool.shutdown().await;
    }
}
