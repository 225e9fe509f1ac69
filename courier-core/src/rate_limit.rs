//! Server-driven rate limiting.
//!
//! The endpoint throttles clients through two response headers:
//!
//! - `X-Sentry-Rate-Limits`: comma-separated groups of
//!   `retrySeconds:categories:scope[:reason]`, categories separated by `;`.
//!   An empty category list suspends everything.
//!   Example: `60:transaction:key, 2700:default;error;security:organization`
//! - `Retry-After`: seconds (or an HTTP date), used only when the first
//!   header is absent.
//!
//! Each response overwrites the expiry of every category it names.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::client_report::ClientReportRecorder;
use crate::envelope::Envelope;
use crate::types::{DataCategory, DiscardReason};

/// Backoff applied to a bare 429 without usable headers
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Source of wall-clock time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = advance(*now, by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Tracks, per data category, the instant until which sending is suspended.
#[derive(Debug)]
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    recorder: Arc<ClientReportRecorder>,
    default_retry_after: Duration,
    limits: RwLock<HashMap<DataCategory, DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(recorder: Arc<ClientReportRecorder>) -> Self {
        Self::with_clock(recorder, Arc::new(SystemClock))
    }

    pub fn with_clock(recorder: Arc<ClientReportRecorder>, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            recorder,
            default_retry_after: DEFAULT_RETRY_AFTER,
            limits: RwLock::new(HashMap::new()),
        }
    }

    /// Override the backoff used for a bare 429
    pub fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.default_retry_after = retry_after;
        self
    }

    /// True while the category, or `All`, is suspended.
    ///
    /// `Unknown` items only honour `All`.
    pub fn is_active_for_category(&self, category: DataCategory) -> bool {
        let now = self.clock.now();
        let limits = self.limits.read();
        let active = |c: DataCategory| limits.get(&c).is_some_and(|until| now < *until);

        if active(DataCategory::All) {
            return true;
        }
        if category == DataCategory::Unknown {
            return false;
        }
        active(category)
    }

    /// True if any category is currently suspended
    pub fn is_any_rate_limit_active(&self) -> bool {
        let now = self.clock.now();
        self.limits.read().values().any(|until| now < *until)
    }

    /// Expiry currently recorded for a category, if any
    pub fn limited_until(&self, category: DataCategory) -> Option<DateTime<Utc>> {
        self.limits.read().get(&category).copied()
    }

    /// Drop every item whose category is suspended.
    ///
    /// Each dropped item is recorded as `ratelimit_backoff`. Returns `None`
    /// when nothing survives; otherwise the surviving items keep their order
    /// and the envelope keeps its header.
    pub fn filter(&self, envelope: Envelope) -> Option<Envelope> {
        let limited: Vec<bool> = envelope
            .items()
            .iter()
            .map(|item| self.is_active_for_category(item.data_category()))
            .collect();

        if !limited.iter().any(|l| *l) {
            return Some(envelope);
        }

        let dropped = limited.iter().filter(|l| **l).count();
        let (header, items) = envelope.into_parts();
        let mut kept = Vec::with_capacity(items.len());
        for (item, is_limited) in items.into_iter().zip(limited) {
            if is_limited {
                self.recorder
                    .record_lost_item(DiscardReason::RatelimitBackoff, &item);
            } else {
                kept.push(item);
            }
        }

        if kept.is_empty() {
            tracing::warn!(
                event_id = %header.event_id,
                dropped,
                "Envelope discarded, all items are rate limited"
            );
            return None;
        }

        tracing::warn!(
            event_id = %header.event_id,
            dropped,
            "Envelope items dropped due to rate limiting"
        );
        Some(Envelope::from_parts(header, kept))
    }

    /// Apply the throttle headers of a response.
    ///
    /// Called for every response regardless of status.
    pub fn update_retry_after_limits(
        &self,
        rate_limits_header: Option<&str>,
        retry_after_header: Option<&str>,
        http_status: u16,
    ) {
        let now = self.clock.now();
        let mut updates: HashMap<DataCategory, DateTime<Utc>> = HashMap::new();
        let mut merge = |category: DataCategory, until: DateTime<Utc>| {
            let entry = updates.entry(category).or_insert(until);
            if until > *entry {
                *entry = until;
            }
        };

        if let Some(header) = rate_limits_header {
            for group in header.split(',') {
                let group: String = group.chars().filter(|c| !c.is_whitespace()).collect();
                if group.is_empty() {
                    continue;
                }

                let mut fields = group.split(':');
                let seconds = fields.next().and_then(parse_seconds);
                let categories = fields.next();
                let (Some(seconds), Some(categories)) = (seconds, categories) else {
                    tracing::debug!(group = %group, "Skipping malformed rate limit group");
                    continue;
                };

                let until = advance(now, seconds);
                if categories.is_empty() {
                    merge(DataCategory::All, until);
                    continue;
                }

                for name in categories.split(';').filter(|n| !n.is_empty()) {
                    match DataCategory::from_rate_limit_name(name) {
                        Some(category) => merge(category, until),
                        None => tracing::debug!(category = %name, "Ignoring unknown rate limit category"),
                    }
                }
            }
        } else if http_status == 429 || retry_after_header.is_some() {
            let retry_after = retry_after_header
                .and_then(|value| parse_retry_after(value, now))
                .unwrap_or(self.default_retry_after);
            merge(DataCategory::All, advance(now, retry_after));
        }

        if updates.is_empty() {
            return;
        }

        let mut limits = self.limits.write();
        for (category, until) in updates {
            tracing::info!(category = %category, until = %until, "Rate limit applied");
            limits.insert(category, until);
        }
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// `Retry-After` is either delta-seconds or an HTTP date
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(seconds) = parse_seconds(value) {
        return Some(seconds);
    }
    let date = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    (date.with_timezone(&Utc) - now).to_std().ok()
}

/// `from + by`, saturating at the largest representable instant
fn advance(from: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Item;
    use crate::types::ItemType;

    fn limiter() -> (RateLimiter, Arc<ManualClock>, Arc<ClientReportRecorder>) {
        let clock = Arc::new(ManualClock::default());
        let recorder = Arc::new(ClientReportRecorder::new());
        let limiter = RateLimiter::with_clock(Arc::clone(&recorder), clock.clone());
        (limiter, clock, recorder)
    }

    fn item(ty: ItemType) -> Item {
        Item::new(ty, b"{}".to_vec())
    }

    fn count(recorder: &ClientReportRecorder, category: DataCategory) -> u64 {
        recorder
            .snapshot()
            .iter()
            .filter(|e| e.reason == DiscardReason::RatelimitBackoff && e.category == category)
            .map(|e| e.quantity)
            .sum()
    }

    #[test]
    fn test_limit_expires_after_parsed_duration() {
        let (limiter, clock, _) = limiter();
        limiter.update_retry_after_limits(Some("60:error:key"), None, 200);

        assert!(limiter.is_active_for_category(DataCategory::Error));
        assert!(!limiter.is_active_for_category(DataCategory::Transaction));

        clock.advance(Duration::from_secs(59));
        assert!(limiter.is_active_for_category(DataCategory::Error));

        clock.advance(Duration::from_secs(1));
        assert!(!limiter.is_active_for_category(DataCategory::Error));
        assert!(!limiter.is_any_rate_limit_active());
    }

    #[test]
    fn test_multiple_categories_share_one_duration() {
        let (limiter, _, _) = limiter();
        limiter.update_retry_after_limits(Some("50:transaction;attachment:key"), None, 429);

        assert!(limiter.is_active_for_category(DataCategory::Transaction));
        assert!(limiter.is_active_for_category(DataCategory::Attachment));
        assert!(!limiter.is_active_for_category(DataCategory::Error));
        assert_eq!(
            limiter.limited_until(DataCategory::Transaction),
            limiter.limited_until(DataCategory::Attachment)
        );
    }

    #[test]
    fn test_empty_category_list_limits_everything() {
        let (limiter, _, _) = limiter();
        limiter.update_retry_after_limits(Some("50::key"), None, 429);

        assert!(limiter.is_active_for_category(DataCategory::Error));
        assert!(limiter.is_active_for_category(DataCategory::Unknown));
        assert!(limiter.is_active_for_category(DataCategory::Profile));
    }

    #[test]
    fn test_all_or_specific_category_either_limits() {
        let (limiter, clock, _) = limiter();
        limiter.update_retry_after_limits(Some("10::key, 100:error:key"), None, 429);

        clock.advance(Duration::from_secs(20));
        assert!(!limiter.is_active_for_category(DataCategory::Transaction));
        assert!(limiter.is_active_for_category(DataCategory::Error));
    }

    #[test]
    fn test_malformed_groups_are_skipped_individually() {
        let (limiter, _, _) = limiter();
        limiter.update_retry_after_limits(
            Some("abc:error:key, 30, 30:transaction:key, 10:metric_bucket;span:org"),
            None,
            429,
        );

        assert!(!limiter.is_active_for_category(DataCategory::Error));
        assert!(limiter.is_active_for_category(DataCategory::Transaction));
        assert!(limiter.is_active_for_category(DataCategory::Span));
        assert!(limiter.limited_until(DataCategory::All).is_none());
    }

    #[test]
    fn test_bare_429_uses_default_backoff() {
        let (limiter, clock, _) = limiter();
        limiter.update_retry_after_limits(None, None, 429);
        assert!(limiter.is_active_for_category(DataCategory::Error));

        clock.advance(Duration::from_secs(59));
        assert!(limiter.is_active_for_category(DataCategory::Error));
        clock.advance(Duration::from_secs(1));
        assert!(!limiter.is_active_for_category(DataCategory::Error));
    }

    #[test]
    fn test_retry_after_header_applies_without_429() {
        let (limiter, clock, _) = limiter();
        limiter.update_retry_after_limits(None, Some("5"), 503);
        assert!(limiter.is_active_for_category(DataCategory::Transaction));

        clock.advance(Duration::from_secs(5));
        assert!(!limiter.is_active_for_category(DataCategory::Transaction));
    }

    #[test]
    fn test_unparseable_retry_after_falls_back_to_default() {
        let (limiter, clock, _) = limiter();
        limiter.update_retry_after_limits(None, Some("soon"), 429);

        clock.advance(Duration::from_secs(30));
        assert!(limiter.is_active_for_category(DataCategory::Error));
    }

    #[test]
    fn test_success_without_headers_changes_nothing() {
        let (limiter, _, _) = limiter();
        limiter.update_retry_after_limits(None, None, 200);
        assert!(!limiter.is_any_rate_limit_active());
    }

    #[test]
    fn test_newer_response_overwrites_expiry() {
        let (limiter, clock, _) = limiter();
        limiter.update_retry_after_limits(Some("600:error:key"), None, 429);
        limiter.update_retry_after_limits(Some("5:error:key"), None, 200);

        clock.advance(Duration::from_secs(6));
        assert!(!limiter.is_active_for_category(DataCategory::Error));
    }

    #[test]
    fn test_filter_drops_limited_items_and_records_them() {
        let (limiter, _, recorder) = limiter();
        limiter.update_retry_after_limits(Some("60:error;attachment:key"), None, 429);

        let envelope = Envelope::from_items(vec![
            item(ItemType::Event),
            item(ItemType::Transaction),
            item(ItemType::Attachment),
            item(ItemType::Attachment),
            item(ItemType::Profile),
        ])
        .unwrap();
        let event_id = envelope.event_id();

        let filtered = limiter.filter(envelope).unwrap();
        let kept: Vec<_> = filtered.items().iter().map(|i| i.item_type().clone()).collect();

        assert_eq!(kept, vec![ItemType::Transaction, ItemType::Profile]);
        assert_eq!(filtered.event_id(), event_id);
        assert_eq!(count(&recorder, DataCategory::Error), 1);
        assert_eq!(count(&recorder, DataCategory::Attachment), 2);
    }

    #[test]
    fn test_filter_returns_none_when_everything_is_limited() {
        let (limiter, _, recorder) = limiter();
        limiter.update_retry_after_limits(Some("60:error:key"), None, 429);

        let envelope =
            Envelope::from_items(vec![item(ItemType::Event), item(ItemType::Event)]).unwrap();
        assert!(limiter.filter(envelope).is_none());
        assert_eq!(count(&recorder, DataCategory::Error), 2);
    }

    #[test]
    fn test_filter_without_limits_is_identity() {
        let (limiter, _, recorder) = limiter();
        let envelope = Envelope::from_item(item(ItemType::Event));
        assert_eq!(limiter.filter(envelope.clone()), Some(envelope));
        assert!(!recorder.has_pending());
    }
}
