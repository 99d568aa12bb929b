//! Fixed-size worker pool behind a bounded admission queue.
//!
//! The queue holds at most `workers` pending connections. Submitting to a
//! full queue waits, which is what pushes back on the acceptor. Each worker
//! takes one connection at a time and runs its whole session, so the number
//! of sessions in flight can never exceed the number of workers.

use crate::connection::Connection;
use crate::handler::{ConnectionHandler, Service};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

type Queue<S> = Arc<Mutex<mpsc::Receiver<Connection<S>>>>;

/// Returned when the pool no longer accepts work. Carries the rejected
/// connection back to the caller.
#[derive(Debug)]
pub struct PoolClosed<S>(pub Connection<S>);

/// A running pool of workers.
pub struct WorkerPool<S> {
    sender: mpsc::Sender<Connection<S>>,
    queue: Queue<S>,
    workers: TaskTracker,
    shutdown: CancellationToken,
    size: usize,
}

impl<S> WorkerPool<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Launch exactly `size` workers, each draining the admission queue.
    ///
    /// Workers stop taking new work once `shutdown` is cancelled.
    pub fn start<T: Service>(
        size: usize,
        handler: ConnectionHandler<T>,
        shutdown: CancellationToken,
    ) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel(size);
        let queue = Arc::new(Mutex::new(receiver));
        let workers = TaskTracker::new();

        for worker_id in 0..size {
            let queue = Arc::clone(&queue);
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                worker_loop(worker_id, queue, handler, shutdown).await;
            });
        }
        workers.close();

        info!(workers = size, "Worker pool started");

        WorkerPool {
            sender,
            queue,
            workers,
            shutdown,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a connection for the next free worker, waiting while the
    /// queue is full.
    pub async fn submit(&self, conn: Connection<S>) -> Result<(), PoolClosed<S>> {
        if self.shutdown.is_cancelled() {
            return Err(PoolClosed(conn));
        }
        self.sender.send(conn).await.map_err(|e| PoolClosed(e.0))
    }

    /// Stop the workers and close whatever is still queued.
    ///
    /// Sessions already running observe the cancellation on their next read
    /// or write and return; this waits for all of them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        drop(self.sender);
        self.workers.wait().await;

        let mut receiver = self.queue.lock().await;
        receiver.close();
        let mut dropped = 0usize;
        while let Ok(conn) = receiver.try_recv() {
            trace!(peer = %conn.peer(), "Closing queued connection");
            conn.close().await;
            dropped += 1;
        }

        info!(queued_closed = dropped, "Worker pool stopped");
    }
}

async fn worker_loop<S, T>(
    worker_id: usize,
    queue: Queue<S>,
    handler: ConnectionHandler<T>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: Service,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            conn = async { queue.lock().await.recv().await } => conn,
        };

        let Some(conn) = next else {
            break;
        };

        trace!(worker = worker_id, peer = %conn.peer(), "Worker took connection");
        let outcome = handler.handle(conn).await;
        trace!(
            worker = worker_id,
            exchanges = outcome.exchanges(),
            error = ?outcome.error(),
            "Worker free"
        );
    }

    debug!(worker = worker_id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Tracks how many calls run at once.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Service for Gauge {
        async fn call(&self, request: &str) -> String {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            request.to_uppercase()
        }
    }

    fn config() -> HandlerConfig {
        HandlerConfig {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_never_exceeds_pool_size() {
        let gauge = Arc::new(Gauge::default());
        let pool = WorkerPool::start(
            3,
            ConnectionHandler::new(Arc::clone(&gauge), config()),
            CancellationToken::new(),
        );
        let pool = Arc::new(pool);

        let mut clients = Vec::new();
        for i in 0..12 {
            let (client, server) = duplex(1024);
            let pool = Arc::clone(&pool);
            clients.push(tokio::spawn(async move {
                let submit = pool.submit(Connection::new(server, format!("c{i}"), 1024));
                let talk = async move {
                    let mut client = client;
                    client.write_all(b"ping\n").await.unwrap();
                    client.shutdown().await.unwrap();
                    let mut response = String::new();
                    client.read_to_string(&mut response).await.unwrap();
                    response
                };
                let (submitted, response) = tokio::join!(submit, talk);
                assert!(submitted.is_ok());
                response
            }));
        }

        for client in clients {
            assert_eq!(client.await.unwrap(), "PING\n");
        }
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
        assert!(gauge.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_queued_connection_waits_for_free_worker() {
        let pool = WorkerPool::start(
            1,
            ConnectionHandler::new(Arc::new(crate::handler::EchoService::default()), config()),
            CancellationToken::new(),
        );

        let (first, first_server) = duplex(1024);
        let (second, second_server) = duplex(1024);
        pool.submit(Connection::new(first_server, "first", 1024)).await.unwrap();
        pool.submit(Connection::new(second_server, "second", 1024)).await.unwrap();

        let mut first = BufReader::new(first);
        let mut second = BufReader::new(second);
        first.get_mut().write_all(b"hello\n").await.unwrap();
        second.get_mut().write_all(b"world\n").await.unwrap();

        let mut line = String::new();
        first.read_line(&mut line).await.unwrap();
        assert_eq!(line, "host processed request: hello\n");

        // The only worker is still inside the first session.
        line.clear();
        let waited =
            tokio::time::timeout(Duration::from_millis(100), second.read_line(&mut line)).await;
        assert!(waited.is_err());

        drop(first);
        line.clear();
        second.read_line(&mut line).await.unwrap();
        assert_eq!(line, "host processed request: world\n");
    }

    #[tokio::test]
    async fn test_shutdown_closes_running_and_queued() {
        let shutdown = CancellationToken::new();
        let pool: WorkerPool<DuplexStream> = WorkerPool::start(
            1,
            ConnectionHandler::new(Arc::new(crate::handler::EchoService::default()), config()),
            shutdown.clone(),
        );

        let (mut running, running_server) = duplex(1024);
        let (mut queued, queued_server) = duplex(1024);
        pool.submit(
            Connection::new(running_server, "running", 1024).with_closer(shutdown.child_token()),
        )
        .await
        .unwrap();
        pool.submit(
            Connection::new(queued_server, "queued", 1024).with_closer(shutdown.child_token()),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .expect("shutdown should not hang");

        let mut buf = Vec::new();
        assert_eq!(running.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(queued.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(
            2,
            ConnectionHandler::new(Arc::new(crate::handler::EchoService::default()), config()),
            shutdown.clone(),
        );
        shutdown.cancel();

        let (_client, server) = duplex(64);
        let rejected = pool.submit(Connection::new(server, "late", 1024)).await;
        assert!(matches!(rejected, Err(PoolClosed(_))));
    }
}
