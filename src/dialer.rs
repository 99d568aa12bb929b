//! Connection establishment bounded by a timeout.
//!
//! The connect attempt runs as its own task and reports into a one-shot
//! result slot, which the caller awaits against a timer. If the timer wins,
//! the caller gets [`RelayError::ConnectTimeout`] right away and the attempt
//! is left to finish on its own. A stream that arrives after the slot has
//! been abandoned is shut down by the attempt task instead of leaking.

use crate::address::EndpointAddress;
use crate::error::{RelayError, Result};
use crate::transport::Connector;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Connect to `addr`, giving up after `timeout`.
pub async fn dial<C: Connector>(
    connector: &C,
    addr: EndpointAddress,
    timeout: Duration,
) -> Result<C::Stream> {
    let (slot, result) = oneshot::channel();
    let connector = connector.clone();

    tokio::spawn(async move {
        match slot.send(connector.connect(addr).await) {
            Ok(()) => {}
            Err(Ok(mut stream)) => {
                debug!(target_addr = %addr, "Closing connection established after timeout");
                let _ = stream.shutdown().await;
            }
            Err(Err(e)) => trace!(target_addr = %addr, error = %e, "Abandoned connect failed"),
        }
    });

    match tokio::time::timeout(timeout, result).await {
        Ok(Ok(Ok(stream))) => {
            debug!(target_addr = %addr, "Connected");
            Ok(stream)
        }
        Ok(Ok(Err(e))) => Err(RelayError::Transport(e)),
        Ok(Err(_)) => Err(RelayError::Transport(io::Error::other(
            "connect task ended without a result",
        ))),
        Err(_) => Err(RelayError::ConnectTimeout(timeout)),
    }
}
