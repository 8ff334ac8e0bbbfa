//! Graceful shutdown coordination.
//!
//! Teardown fans a shutdown event out to every subscriber of
//! [`SHUTDOWN_EVENT`], waits until each one has acknowledged, closes the
//! server and only then reports completion:
//!
//! ```text
//! Idle -> AwaitingAcks -> Closing -> Done
//! Idle -------------------> Closing -> Done   (no subscribers)
//!                           Closing -> Failed (server close failed)
//! ```
//!
//! There is no timeout unless [`crate::Settings::shutdown_timeout`] is set:
//! a subscriber that never acknowledges stalls shutdown. `Done` and `Failed`
//! are terminal; shutdown is never retried.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::events::{EventBus, EventPayload};
use crate::server::Server;

/// Event emitted to shutdown subscribers.
pub const SHUTDOWN_EVENT: &str = "application:shutdown";

/// Phase of the shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    /// Shutdown has not been triggered.
    Idle,
    /// Waiting for subscribers to acknowledge.
    AwaitingAcks,
    /// Closing the server.
    Closing,
    /// Teardown complete; the process may exit.
    Done,
    /// Closing the server failed. Terminal.
    Failed,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AwaitingAcks => write!(f, "awaiting_acks"),
            Self::Closing => write!(f, "closing"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a completed shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Subscribers present when teardown began.
    pub expected_acks: usize,
    /// Acknowledgments received before completion.
    pub received_acks: usize,
    /// Whether a listening server was closed.
    pub server_closed: bool,
    /// Whether the acknowledgment wait gave up on the configured timeout.
    pub timed_out: bool,
    /// Phases entered after `Idle`, in order.
    pub phases: Vec<ShutdownPhase>,
}

#[derive(Debug)]
struct BarrierInner {
    expected: usize,
    issued: AtomicUsize,
    received: AtomicUsize,
    notify: Notify,
}

/// N-of-N acknowledgment barrier.
///
/// Exactly `expected` [`ShutdownAck`] tokens can be issued, and each token is
/// consumed by acknowledging, so the counter can never pass `expected`.
#[derive(Debug, Clone)]
pub struct AckBarrier {
    inner: Arc<BarrierInner>,
}

impl AckBarrier {
    /// Create a barrier expecting `expected` acknowledgments.
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(BarrierInner {
                expected,
                issued: AtomicUsize::new(0),
                received: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Issue the next acknowledgment token, or `None` once all are issued.
    pub fn token(&self) -> Option<ShutdownAck> {
        self.inner
            .issued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |issued| {
                (issued < self.inner.expected).then_some(issued + 1)
            })
            .ok()
            .map(|_| ShutdownAck {
                barrier: Arc::clone(&self.inner),
            })
    }

    /// Number of acknowledgments expected.
    pub fn expected(&self) -> usize {
        self.inner.expected
    }

    /// Number of acknowledgments received so far.
    pub fn received(&self) -> usize {
        self.inner.received.load(Ordering::Acquire)
    }

    /// Whether every expected acknowledgment has arrived.
    pub fn is_complete(&self) -> bool {
        self.received() == self.inner.expected
    }

    /// Wait until every expected acknowledgment has arrived.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

/// A subscriber's private acknowledgment. Consumed by [`ShutdownAck::ack`].
#[derive(Debug)]
#[must_use = "shutdown stalls until every ShutdownAck is acknowledged"]
pub struct ShutdownAck {
    barrier: Arc<BarrierInner>,
}

impl ShutdownAck {
    /// Acknowledge shutdown.
    pub fn ack(self) {
        let received = self.barrier.received.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            received,
            expected = self.barrier.expected,
            "Shutdown acknowledged"
        );
        if received == self.barrier.expected {
            self.barrier.notify.notify_waiters();
        }
    }
}

/// Drive one teardown: notify subscribers, wait for their acknowledgments,
/// then run `close`, which reports whether a listening server was closed.
///
/// Every phase change goes through `set_phase`, starting from `Idle`.
pub(crate) async fn run<C>(
    events: &EventBus,
    timeout: Option<Duration>,
    close: C,
    set_phase: impl Fn(ShutdownPhase),
) -> AppResult<ShutdownReport>
where
    C: Future<Output = AppResult<bool>>,
{
    let mut phases = Vec::with_capacity(3);
    let mut enter = |phase: ShutdownPhase| {
        phases.push(phase);
        set_phase(phase);
    };

    let listeners = events.listeners(SHUTDOWN_EVENT);
    let barrier = AckBarrier::new(listeners.len());
    let mut timed_out = false;

    if barrier.expected() == 0 {
        info!("No shutdown listeners registered");
    } else {
        enter(ShutdownPhase::AwaitingAcks);
        info!(
            listeners = barrier.expected(),
            "Notifying shutdown listeners"
        );
        for listener in &listeners {
            if let Some(ack) = barrier.token() {
                listener(EventPayload::Shutdown(ack));
            }
        }

        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, barrier.wait()).await.is_err() {
                    warn!(
                        received = barrier.received(),
                        expected = barrier.expected(),
                        "Timed out waiting for shutdown acknowledgments after {:?}",
                        limit
                    );
                    timed_out = true;
                }
            }
            None => barrier.wait().await,
        }
    }

    enter(ShutdownPhase::Closing);
    let server_closed = match close.await {
        Ok(closed) => closed,
        Err(e) => {
            enter(ShutdownPhase::Failed);
            error!(error = %e, "Shutdown failed while closing the server");
            return Err(e);
        }
    };

    enter(ShutdownPhase::Done);
    let report = ShutdownReport {
        expected_acks: barrier.expected(),
        received_acks: barrier.received(),
        server_closed,
        timed_out,
        phases,
    };
    info!(?report, "Shutdown complete");
    Ok(report)
}

/// Close `server` if it is listening. Returns whether it was.
pub(crate) async fn close_if_listening(server: &Server) -> AppResult<bool> {
    if !server.is_listening() {
        return Ok(false);
    }
    match server.close().await {
        Ok(()) => Ok(true),
        // Closed concurrently between the check and the close.
        Err(AppError::NotListening) => Ok(false),
        Err(e) => Err(e),
    }
}
