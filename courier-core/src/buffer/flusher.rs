//! Periodic resend of buffered envelopes.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::transport::{Connectivity, Hint, SendOutcome, Transport};
use crate::types::DiscardReason;

use super::EnvelopeBuffer;

/// Result of one flush cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Delivered and removed from the buffer
    pub sent: usize,
    /// Removed without delivery (rate limited or rejected)
    pub dropped: usize,
    /// Attempted but left for a later cycle
    pub kept: usize,
}

/// Resends buffered envelopes through the transport.
///
/// Runs every `interval` and whenever [`BufferFlusher::signal`] is called.
/// When the transport is disconnected only one envelope is probed per
/// cycle; when connected the buffer is drained; when the state is unknown
/// the cycle stops at the first failure. A queue overflow or a 429 always
/// ends the cycle.
#[derive(Debug)]
pub struct BufferFlusher {
    transport: Arc<Transport>,
    buffer: Arc<dyn EnvelopeBuffer>,
    interval: Duration,
    send_timeout: Duration,
    wake: Notify,
    cancel: CancellationToken,
    cycle: AsyncMutex<()>,
}

impl BufferFlusher {
    pub fn new(
        transport: Arc<Transport>,
        buffer: Arc<dyn EnvelopeBuffer>,
        interval: Duration,
        send_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            buffer,
            interval,
            send_timeout,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            cycle: AsyncMutex::new(()),
        }
    }

    /// Run a cycle now (reconnect)
    pub fn signal(&self) {
        self.wake.notify_one();
    }

    /// Stop the periodic task; a running cycle ends after its current send
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn the periodic task on `handle`
    pub fn spawn(self: &Arc<Self>, handle: &Handle) -> JoinHandle<()> {
        let flusher = Arc::clone(self);
        handle.spawn(async move { flusher.run().await })
    }

    /// Run until cancelled
    pub async fn run(&self) {
        if !self.buffer.is_durable() {
            tracing::debug!("Offline buffer is not durable, flusher not started");
            return;
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Buffer flusher started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Buffer flusher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                _ = self.wake.notified() => {
                    self.flush_once().await;
                }
            }
        }
    }

    /// Run a single cycle over the current buffer contents
    pub async fn flush_once(&self) -> FlushSummary {
        let _cycle = self.cycle.lock().await;
        let mut summary = FlushSummary::default();

        for envelope in self.buffer.iter() {
            if self.cancel.is_cancelled() {
                break;
            }

            let event_id = envelope.event_id();
            let outcome = self.resend(&envelope).await;
            let failed = match outcome {
                SendOutcome::Success => {
                    self.buffer.discard(&envelope);
                    summary.sent += 1;
                    false
                }
                SendOutcome::Filtered | SendOutcome::Invalid => {
                    self.buffer.discard(&envelope);
                    summary.dropped += 1;
                    false
                }
                SendOutcome::HttpError(status) => {
                    tracing::warn!(event_id = %event_id, status, "Buffered envelope rejected, discarding");
                    self.transport
                        .recorder()
                        .record_lost_envelope(DiscardReason::NetworkError, &envelope);
                    self.buffer.discard(&envelope);
                    summary.dropped += 1;
                    false
                }
                SendOutcome::QueueOverflow => {
                    summary.kept += 1;
                    tracing::debug!("Send queue full, postponing buffer flush");
                    break;
                }
                SendOutcome::Throttled => {
                    summary.kept += 1;
                    tracing::debug!(event_id = %event_id, "Endpoint throttling, postponing buffer flush");
                    break;
                }
                SendOutcome::Unaccepted(status) => {
                    summary.kept += 1;
                    tracing::debug!(event_id = %event_id, status, "Buffered envelope not accepted, postponing buffer flush");
                    break;
                }
                SendOutcome::NetworkError | SendOutcome::Cancelled => {
                    summary.kept += 1;
                    true
                }
            };

            let stop = match self.transport.connectivity() {
                Connectivity::Disconnected => true,
                Connectivity::Connected => false,
                Connectivity::Unknown => failed,
            };
            if stop {
                break;
            }
        }

        if summary != FlushSummary::default() {
            tracing::info!(
                sent = summary.sent,
                dropped = summary.dropped,
                kept = summary.kept,
                "Buffer flush cycle finished"
            );
        }
        summary
    }

    async fn resend(&self, envelope: &Envelope) -> SendOutcome {
        let (hint, outcome) = Hint::from_buffer().with_notifier();
        if self.transport.enqueue(envelope.clone(), hint).is_err() {
            return SendOutcome::QueueOverflow;
        }

        match tokio::time::timeout(self.send_timeout, outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => SendOutcome::Cancelled,
            Err(_) => {
                tracing::debug!(event_id = %envelope.event_id(), "Timed out waiting for buffered send");
                SendOutcome::Cancelled
            }
        }
    }
}
