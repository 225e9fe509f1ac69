//! Bounded asynchronous envelope sender.
//!
//! [`Transport::enqueue`] never blocks: it either accepts the envelope and
//! spawns a send task on the runtime, or rejects it with
//! [`Error::QueueOverflow`] when `max_queue_size` requests are already
//! outstanding. Each task runs:
//!
//! 1. rate limit filtering (fully limited envelopes stop here)
//! 2. client report attachment
//! 3. `sent_at` stamping and gzip encoding
//! 4. one POST through the [`Connection`]
//!
//! The throttle headers of every response are fed to the [`RateLimiter`].
//! Failed sends are either recorded as lost or, for retryable hints, handed
//! to the [`RetrySink`] (the offline buffer).

mod connection;
mod in_flight;

pub use connection::{
    Connection, ConnectionFactory, ConnectionRegistry, ConnectionResponse, EnvelopeRequest,
    HttpConnection, NoOpConnection, ENVELOPE_CONTENT_TYPE, RATE_LIMITS_HEADER,
};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::client_report::ClientReportRecorder;
use crate::config::TransportConfig;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::types::DiscardReason;

use in_flight::{InFlight, Outstanding};

/// A queue overflow younger than this marks the transport unhealthy
const RECENT_OVERFLOW: Duration = Duration::from_secs(2);

/// Terminal state of one enqueued envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The endpoint answered 200
    Success,
    /// The endpoint answered with a non-429 status of 400 or above
    HttpError(u16),
    /// The endpoint answered below 400 but not 200; nothing was lost
    Unaccepted(u16),
    /// The endpoint answered 429
    Throttled,
    /// No response: refused connection, timeout, DNS failure
    NetworkError,
    /// The send task was aborted before it completed
    Cancelled,
    /// Every item was rate limited, nothing was sent
    Filtered,
    /// Rejected on enqueue
    QueueOverflow,
    /// The envelope could not be encoded and was dropped
    Invalid,
}

impl SendOutcome {
    /// True for outcomes where the envelope may still be delivered later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendOutcome::NetworkError
                | SendOutcome::Cancelled
                | SendOutcome::Throttled
                | SendOutcome::Unaccepted(_)
                | SendOutcome::QueueOverflow
        )
    }
}

/// Where an envelope entered the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    /// Freshly captured by the host application
    #[default]
    Capture,
    /// Resent from the offline buffer
    Buffer,
}

/// Per-envelope side channel.
#[derive(Debug, Default)]
pub struct Hint {
    retryable: bool,
    origin: Origin,
    notifier: Option<oneshot::Sender<SendOutcome>>,
}

impl Hint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hint for an envelope read back from the offline buffer
    pub fn from_buffer() -> Self {
        Self {
            retryable: true,
            origin: Origin::Buffer,
            notifier: None,
        }
    }

    /// Failures are retried through the offline buffer instead of being
    /// recorded as lost
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Receive the outcome once the envelope reached a terminal state
    pub fn with_notifier(mut self) -> (Self, oneshot::Receiver<SendOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.notifier = Some(tx);
        (self, rx)
    }

    pub fn set_retryable(&mut self, retryable: bool) {
        self.retryable = retryable;
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    fn complete(self, outcome: SendOutcome) {
        if let Some(notifier) = self.notifier {
            let _ = notifier.send(outcome);
        }
    }
}

/// Network reachability as last observed or reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

impl Connectivity {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Connectivity::Connected,
            2 => Connectivity::Disconnected,
            _ => Connectivity::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Connectivity::Unknown => 0,
            Connectivity::Connected => 1,
            Connectivity::Disconnected => 2,
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Connectivity::Unknown => "unknown",
            Connectivity::Connected => "connected",
            Connectivity::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Receives captured envelopes whose retryable send failed.
///
/// Called from the send task, with the envelope exactly as it was sent.
pub trait RetrySink: Send + Sync {
    fn store(&self, envelope: Envelope, outcome: SendOutcome);
}

/// Bounded asynchronous sender. Shared as `Arc<Transport>`.
pub struct Transport {
    config: TransportConfig,
    connection: Arc<dyn Connection>,
    rate_limiter: Arc<RateLimiter>,
    recorder: Arc<ClientReportRecorder>,
    retry_sink: Option<Arc<dyn RetrySink>>,
    handle: Handle,
    outstanding: Outstanding,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    connectivity: AtomicU8,
    last_overflow: Mutex<Option<Instant>>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("connection", &self.connection)
            .field("max_queue_size", &self.config.max_queue_size)
            .field("outstanding", &self.outstanding.current())
            .field("connectivity", &self.connectivity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Create a transport spawning its send tasks on `handle`
    pub fn new(
        config: TransportConfig,
        connection: Arc<dyn Connection>,
        rate_limiter: Arc<RateLimiter>,
        recorder: Arc<ClientReportRecorder>,
        handle: Handle,
    ) -> Self {
        Self {
            config,
            connection,
            rate_limiter,
            recorder,
            retry_sink: None,
            handle,
            outstanding: Outstanding::default(),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            connectivity: AtomicU8::new(Connectivity::Unknown.as_u8()),
            last_overflow: Mutex::new(None),
        }
    }

    /// Hand failed retryable envelopes to `sink`
    pub fn with_retry_sink(mut self, sink: Arc<dyn RetrySink>) -> Self {
        self.retry_sink = Some(sink);
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn recorder(&self) -> &Arc<ClientReportRecorder> {
        &self.recorder
    }

    /// Number of accepted envelopes whose send has not completed
    pub fn outstanding(&self) -> usize {
        self.outstanding.current()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connectivity(&self) -> Connectivity {
        Connectivity::from_u8(self.connectivity.load(Ordering::Acquire))
    }

    /// Record a connectivity change, returning the previous state
    pub fn set_connectivity(&self, connectivity: Connectivity) -> Connectivity {
        let previous =
            Connectivity::from_u8(self.connectivity.swap(connectivity.as_u8(), Ordering::AcqRel));
        if previous != connectivity {
            tracing::debug!(from = %previous, to = %connectivity, "Connectivity changed");
        }
        previous
    }

    /// False while any rate limit is active or the queue overflowed recently
    pub fn is_healthy(&self) -> bool {
        let overflowed_recently = self
            .last_overflow
            .lock()
            .is_some_and(|at| at.elapsed() < RECENT_OVERFLOW);
        !overflowed_recently && !self.rate_limiter.is_any_rate_limit_active()
    }

    /// Accept an envelope for sending without blocking.
    ///
    /// Returns [`Error::QueueOverflow`] when `max_queue_size` requests are
    /// outstanding and [`Error::Closed`] after [`Transport::close`]. In both
    /// cases the hint is notified with `QueueOverflow` and, unless the
    /// envelope came from the offline buffer, its items are recorded as
    /// `queue_overflow`.
    pub fn enqueue(self: &Arc<Self>, envelope: Envelope, hint: Hint) -> Result<()> {
        if self.is_closed() {
            tracing::debug!(event_id = %envelope.event_id(), "Transport closed, rejecting envelope");
            self.reject(&envelope, hint);
            return Err(Error::Closed);
        }

        if !self.outstanding.try_acquire(self.config.max_queue_size) {
            tracing::warn!(
                event_id = %envelope.event_id(),
                max_queue_size = self.config.max_queue_size,
                "Send queue full, dropping envelope"
            );
            *self.last_overflow.lock() = Some(Instant::now());
            self.reject(&envelope, hint);
            return Err(Error::QueueOverflow);
        }

        tracing::trace!(event_id = %envelope.event_id(), "Envelope enqueued");
        let in_flight = InFlight::new(Arc::clone(self), envelope, hint);
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(send_envelope(Arc::clone(self), in_flight), &self.handle);
        Ok(())
    }

    fn reject(&self, envelope: &Envelope, hint: Hint) {
        if hint.origin() == Origin::Capture {
            self.recorder
                .record_lost_envelope(DiscardReason::QueueOverflow, envelope);
        }
        hint.complete(SendOutcome::QueueOverflow);
    }

    /// Block until every outstanding request completed or `timeout` elapsed.
    ///
    /// Returns true if the queue drained. New work is still accepted while
    /// waiting. Must not be called from a runtime worker thread; use
    /// [`Transport::flush_async`] there.
    pub fn flush(&self, timeout: Duration) -> bool {
        let drained = self.outstanding.wait_idle(timeout);
        if !drained {
            tracing::debug!(
                outstanding = self.outstanding.current(),
                "Flush timed out"
            );
        }
        drained
    }

    pub async fn flush_async(&self, timeout: Duration) -> bool {
        self.outstanding.wait_idle_async(timeout).await
    }

    /// Stop accepting work and tear down.
    ///
    /// Waits up to `shutdown_timeout` for in-flight sends (no wait when
    /// restarting), then aborts the rest. Aborted sends settle as
    /// `Cancelled`. Blocking; see [`Transport::close_async`] for callers on
    /// the runtime.
    pub fn close(&self, is_restarting: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = self.outstanding.wait_idle(self.grace_period(is_restarting));
        self.teardown(drained);

        let connection = Arc::clone(&self.connection);
        if Handle::try_current().is_ok() {
            self.handle.spawn(async move { connection.close().await });
        } else {
            self.handle.block_on(connection.close());
        }
    }

    pub async fn close_async(&self, is_restarting: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = self
            .outstanding
            .wait_idle_async(self.grace_period(is_restarting))
            .await;
        self.teardown(drained);
        self.connection.close().await;
    }

    fn grace_period(&self, is_restarting: bool) -> Duration {
        if is_restarting {
            Duration::ZERO
        } else {
            self.config.shutdown_timeout()
        }
    }

    fn teardown(&self, drained: bool) {
        if !drained {
            tracing::warn!(
                outstanding = self.outstanding.current(),
                "Shutdown grace period elapsed, aborting in-flight sends"
            );
        }
        self.tasks.lock().abort_all();
        tracing::info!("Transport closed");
    }

    /// Account for a terminal outcome and notify the hint.
    fn settle(&self, envelope: Option<Envelope>, hint: Hint, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Success
            | SendOutcome::Filtered
            | SendOutcome::Invalid
            | SendOutcome::QueueOverflow => {}
            SendOutcome::Throttled | SendOutcome::Unaccepted(_) => {
                if let Some(envelope) = envelope {
                    if let Some(sink) = self.deferred_to_sink(&hint) {
                        sink.store(envelope, outcome);
                    }
                }
            }
            SendOutcome::HttpError(_) | SendOutcome::NetworkError | SendOutcome::Cancelled => {
                match (envelope, self.deferred_to_sink(&hint)) {
                    (Some(envelope), Some(sink)) => sink.store(envelope, outcome),
                    (Some(envelope), None) if !hint.is_retryable() => self
                        .recorder
                        .record_lost_envelope(DiscardReason::NetworkError, &envelope),
                    _ => {}
                }
            }
        }
        hint.complete(outcome);
    }

    /// Sink for a retryable captured envelope. Buffer resends are accounted
    /// by the flusher that owns the stored file.
    fn deferred_to_sink(&self, hint: &Hint) -> Option<&Arc<dyn RetrySink>> {
        if hint.is_retryable() && hint.origin() == Origin::Capture {
            self.retry_sink.as_ref()
        } else {
            None
        }
    }
}

async fn send_envelope(transport: Arc<Transport>, mut in_flight: InFlight) {
    let Some(envelope) = in_flight.envelope.take() else {
        return;
    };
    let event_id = envelope.event_id();
    let origin = in_flight.hint().map(Hint::origin).unwrap_or_default();

    let Some(envelope) = transport.rate_limiter.filter(envelope) else {
        in_flight.settle(SendOutcome::Filtered);
        return;
    };

    // Buffered resends keep their stored form so a failure loses no counts.
    let mut envelope = match origin {
        Origin::Capture => transport.recorder.attach_report_to_envelope(envelope),
        Origin::Buffer => envelope,
    };
    envelope.set_sent_at(Utc::now());

    let body = match envelope.to_gzip() {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(event_id = %event_id, error = %e, "Failed to encode envelope");
            transport
                .recorder
                .record_lost_envelope(DiscardReason::InternalSdkError, &envelope);
            in_flight.settle(SendOutcome::Invalid);
            return;
        }
    };
    in_flight.envelope = Some(envelope);

    let result = transport
        .connection
        .send(EnvelopeRequest { event_id, body })
        .await;

    let outcome = match result {
        Ok(response) => {
            transport.set_connectivity(Connectivity::Connected);
            transport.rate_limiter.update_retry_after_limits(
                response.rate_limits.as_deref(),
                response.retry_after.as_deref(),
                response.status,
            );
            if response.is_success() {
                tracing::debug!(event_id = %event_id, "Envelope sent");
                SendOutcome::Success
            } else if response.status == 429 {
                tracing::warn!(event_id = %event_id, "Envelope rejected, rate limited");
                SendOutcome::Throttled
            } else if response.status < 400 {
                tracing::warn!(
                    event_id = %event_id,
                    status = response.status,
                    "Envelope not accepted by endpoint"
                );
                SendOutcome::Unaccepted(response.status)
            } else {
                tracing::warn!(
                    event_id = %event_id,
                    status = response.status,
                    "Envelope rejected by endpoint"
                );
                SendOutcome::HttpError(response.status)
            }
        }
        Err(e) => {
            transport.set_connectivity(Connectivity::Disconnected);
            tracing::warn!(event_id = %event_id, error = %e, "Envelope send failed");
            SendOutcome::NetworkError
        }
    };

    in_flight.settle(outcome);
}
