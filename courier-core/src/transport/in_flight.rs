//! Outstanding request accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::envelope::Envelope;

use super::{Hint, SendOutcome, Transport};

/// Counter of requests that were accepted but have not completed.
///
/// Waiters are woken only on the transition to zero.
#[derive(Debug, Default)]
pub(crate) struct Outstanding {
    count: AtomicUsize,
    lock: Mutex<()>,
    idle: Condvar,
    idle_async: Notify,
}

impl Outstanding {
    pub(crate) fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Increment unless `max` is already reached
    pub(crate) fn try_acquire(&self, max: usize) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.lock.lock();
            self.idle.notify_all();
            self.idle_async.notify_waiters();
        }
    }

    /// Block until the count is zero or `timeout` elapses
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        if self.current() == 0 {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while self.current() > 0 {
            if self.idle.wait_until(&mut guard, deadline).timed_out() {
                return self.current() == 0;
            }
        }
        true
    }

    pub(crate) async fn wait_idle_async(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.idle_async.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.current() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }
}

/// Owns one accepted envelope for the lifetime of its send task.
///
/// Dropping it releases the outstanding slot. If it is dropped before an
/// outcome was settled the task was aborted, which counts as `Cancelled`.
pub(crate) struct InFlight {
    transport: Arc<Transport>,
    pub(crate) envelope: Option<Envelope>,
    hint: Option<Hint>,
}

impl InFlight {
    /// Caller has already acquired a slot
    pub(crate) fn new(transport: Arc<Transport>, envelope: Envelope, hint: Hint) -> Self {
        Self {
            transport,
            envelope: Some(envelope),
            hint: Some(hint),
        }
    }

    pub(crate) fn hint(&self) -> Option<&Hint> {
        self.hint.as_ref()
    }

    pub(crate) fn settle(&mut self, outcome: SendOutcome) {
        if let Some(hint) = self.hint.take() {
            self.transport.settle(self.envelope.take(), hint, outcome);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.hint.is_some() {
            tracing::debug!(
                event_id = ?self.envelope.as_ref().map(Envelope::event_id),
                "Send task cancelled"
            );
            self.settle(SendOutcome::Cancelled);
        }
        self.transport.outstanding.release();
    }
}
