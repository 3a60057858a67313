//! Per-connection state machines: the upstream source, downstream relay and
//! player outputs, and the firewall ping/pong exchange.

pub mod direct;
pub mod errors;
pub mod handshake;
pub mod http;
pub mod output;
pub mod ping;
pub mod pong;
pub mod source;
pub mod transport;

use {
    std::future::Future,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
};

pub use errors::{SessionError, SessionErrorValue, SessionResult, StopReason};
pub use transport::{AtomStream, BoxedReader, BoxedWriter};

/// Owner's grip on a spawned connection task.
///
/// Stopping is idempotent: the task sees the token, finishes its current step
/// and closes its socket.
#[derive(Debug)]
pub struct ConnectionHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn spawn<F>(cancel: CancellationToken, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            cancel,
            task: tokio::spawn(future),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the task to end.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            if err.is_panic() {
                tracing::error!("connection task panicked: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_stop_is_idempotent() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = ConnectionHandle::spawn(cancel, async move {
            token.cancelled().await;
        });
        assert!(!handle.is_finished());
        handle.stop();
        handle.stop();
        assert!(handle.cancel_token().is_cancelled());
        handle.join().await;
    }
}
