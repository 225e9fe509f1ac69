//! Discard accounting.
//!
//! Every item that never reaches the endpoint is counted per
//! (reason, category). The counts ride along on a later request as a
//! `client_report` item and are reset in the same step, so nothing is
//! reported twice.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, Item};
use crate::types::{DataCategory, DiscardReason, ItemType};

/// Payload of a `client_report` item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientReport {
    pub timestamp: DateTime<Utc>,
    pub discarded_events: Vec<DiscardedEvent>,
}

/// One (reason, category) counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardedEvent {
    pub reason: DiscardReason,
    pub category: DataCategory,
    pub quantity: u64,
}

/// Accumulates discard counts since the last report was attached.
#[derive(Debug, Default)]
pub struct ClientReportRecorder {
    counts: Mutex<HashMap<(DiscardReason, DataCategory), u64>>,
}

impl ClientReportRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `quantity` lost items of one category
    pub fn record_lost_event(&self, reason: DiscardReason, category: DataCategory, quantity: u64) {
        if quantity == 0 {
            return;
        }
        *self.counts.lock().entry((reason, category)).or_insert(0) += quantity;
        tracing::trace!(
            reason = %reason,
            category = %category,
            quantity,
            "Recorded lost items"
        );
    }

    /// Count a lost item.
    ///
    /// A lost client report is not a loss of its own: its counts go back
    /// into the recorder so they are reported with the next request.
    pub fn record_lost_item(&self, reason: DiscardReason, item: &Item) {
        match item.item_type() {
            ItemType::ClientReport => match serde_json::from_slice::<ClientReport>(item.payload())
            {
                Ok(report) => self.restore(report),
                Err(e) => {
                    tracing::debug!(error = %e, "Unable to restore counts from client report")
                }
            },
            ItemType::Transaction => {
                self.record_lost_event(reason, DataCategory::Transaction, 1);
                self.record_lost_event(reason, DataCategory::Span, 1 + count_spans(item));
            }
            _ => self.record_lost_event(reason, item.data_category(), 1),
        }
    }

    /// Count every item of a lost envelope
    pub fn record_lost_envelope(&self, reason: DiscardReason, envelope: &Envelope) {
        for item in envelope.items() {
            self.record_lost_item(reason, item);
        }
    }

    /// True if any count is pending
    pub fn has_pending(&self) -> bool {
        !self.counts.lock().is_empty()
    }

    /// Pending counts, sorted by reason then category
    pub fn snapshot(&self) -> Vec<DiscardedEvent> {
        let counts = self.counts.lock();
        to_discarded_events(counts.iter().map(|(k, v)| (*k, *v)))
    }

    /// Drain all pending counts into a report
    pub fn take_report(&self) -> Option<ClientReport> {
        let counts = std::mem::take(&mut *self.counts.lock());
        if counts.is_empty() {
            return None;
        }
        Some(ClientReport {
            timestamp: Utc::now(),
            discarded_events: to_discarded_events(counts.into_iter()),
        })
    }

    /// Append a `client_report` item summarising the pending counts and
    /// reset them. Returns the envelope unchanged when nothing is pending.
    pub fn attach_report_to_envelope(&self, mut envelope: Envelope) -> Envelope {
        if let Some(report) = self.take_report() {
            match Item::json(ItemType::ClientReport, &report) {
                Ok(item) => envelope.push_item(item),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode client report");
                    self.restore(report);
                }
            }
        }
        envelope
    }

    /// Build an envelope carrying only the pending report
    pub fn take_report_envelope(&self) -> Option<Envelope> {
        let report = self.take_report()?;
        match Item::json(ItemType::ClientReport, &report) {
            Ok(item) => Some(Envelope::from_item(item)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode client report");
                self.restore(report);
                None
            }
        }
    }

    fn restore(&self, report: ClientReport) {
        let mut counts = self.counts.lock();
        for event in report.discarded_events {
            *counts.entry((event.reason, event.category)).or_insert(0) += event.quantity;
        }
    }
}

fn to_discarded_events(
    counts: impl Iterator<Item = ((DiscardReason, DataCategory), u64)>,
) -> Vec<DiscardedEvent> {
    let mut events: Vec<DiscardedEvent> = counts
        .filter(|(_, quantity)| *quantity > 0)
        .map(|((reason, category), quantity)| DiscardedEvent {
            reason,
            category,
            quantity,
        })
        .collect();
    events.sort_by_key(|e| (e.reason, e.category));
    events
}

/// Number of child spans in a transaction payload, 0 if it cannot be read
fn count_spans(item: &Item) -> u64 {
    serde_json::from_slice::<serde_json::Value>(item.payload())
        .ok()
        .and_then(|v| v.get("spans").and_then(|s| s.as_array()).map(Vec::len))
        .unwrap_or(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn event_envelope() -> Envelope {
        Envelope::from_item(
            Item::json(ItemType::Event, &serde_json::json!({"message": "boom"})).unwrap(),
        )
    }

    fn report_of(envelope: &Envelope) -> Option<ClientReport> {
        envelope
            .items()
            .iter()
            .find(|i| *i.item_type() == ItemType::ClientReport)
            .map(|i| serde_json::from_slice(i.payload()).unwrap())
    }

    #[test]
    fn test_attach_without_counts_is_identity() {
        let recorder = ClientReportRecorder::new();
        let envelope = event_envelope();
        let attached = recorder.attach_report_to_envelope(envelope.clone());
        assert_eq!(attached, envelope);
    }

    #[test]
    fn test_attach_appends_report_and_resets() {
        let recorder = ClientReportRecorder::new();
        recorder.record_lost_event(DiscardReason::QueueOverflow, DataCategory::Error, 1);
        recorder.record_lost_event(DiscardReason::QueueOverflow, DataCategory::Error, 2);
        recorder.record_lost_event(DiscardReason::RatelimitBackoff, DataCategory::Attachment, 1);

        let attached = recorder.attach_report_to_envelope(event_envelope());
        assert_eq!(attached.items().len(), 2);
        assert_eq!(
            *attached.items().last().unwrap().item_type(),
            ItemType::ClientReport
        );

        let report = report_of(&attached).unwrap();
        assert_eq!(
            report.discarded_events,
            vec![
                DiscardedEvent {
                    reason: DiscardReason::QueueOverflow,
                    category: DataCategory::Error,
                    quantity: 3,
                },
                DiscardedEvent {
                    reason: DiscardReason::RatelimitBackoff,
                    category: DataCategory::Attachment,
                    quantity: 1,
                },
            ]
        );

        assert!(!recorder.has_pending());
        let again = recorder.attach_report_to_envelope(event_envelope());
        assert!(report_of(&again).is_none());
    }

    #[test]
    fn test_lost_transaction_counts_spans() {
        let recorder = ClientReportRecorder::new();
        let item = Item::json(
            ItemType::Transaction,
            &serde_json::json!({"spans": [{"op": "db"}, {"op": "http"}]}),
        )
        .unwrap();

        recorder.record_lost_item(DiscardReason::NetworkError, &item);

        let snapshot = recorder.snapshot();
        assert!(snapshot.contains(&DiscardedEvent {
            reason: DiscardReason::NetworkError,
            category: DataCategory::Transaction,
            quantity: 1,
        }));
        assert!(snapshot.contains(&DiscardedEvent {
            reason: DiscardReason::NetworkError,
            category: DataCategory::Span,
            quantity: 3,
        }));
    }

    #[test]
    fn test_lost_report_restores_counts_instead_of_counting_itself() {
        let recorder = ClientReportRecorder::new();
        recorder.record_lost_event(DiscardReason::QueueOverflow, DataCategory::Error, 1);

        let attached = recorder.attach_report_to_envelope(event_envelope());
        assert!(!recorder.has_pending());

        recorder.record_lost_envelope(DiscardReason::NetworkError, &attached);

        let snapshot = recorder.snapshot();
        assert_eq!(
            snapshot,
            vec![
                DiscardedEvent {
                    reason: DiscardReason::NetworkError,
                    category: DataCategory::Error,
                    quantity: 1,
                },
                DiscardedEvent {
                    reason: DiscardReason::QueueOverflow,
                    category: DataCategory::Error,
                    quantity: 1,
                },
            ]
        );
        assert!(snapshot
            .iter()
            .all(|e| e.category != DataCategory::Internal));
    }

    #[test]
    fn test_take_report_envelope() {
        let recorder = ClientReportRecorder::new();
        assert!(recorder.take_report_envelope().is_none());

        recorder.record_lost_event(DiscardReason::BeforeSend, DataCategory::Error, 4);
        let envelope = recorder.take_report_envelope().unwrap();
        assert_eq!(envelope.items().len(), 1);
        assert_eq!(report_of(&envelope).unwrap().discarded_events[0].quantity, 4);
        assert!(!recorder.has_pending());
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let recorder = Arc::new(ClientReportRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let recorder = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        recorder.record_lost_event(
                            DiscardReason::NetworkError,
                            DataCategory::Error,
                            1,
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let report = recorder.take_report().unwrap();
        assert_eq!(report.discarded_events[0].quantity, 8000);
    }
}
