//! Core domain types shared by the rate limiter, the client report recorder
//! and the transport.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Classification of an item, used for rate limiting and discard accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// Wildcard: a limit on `All` suspends every category
    All,
    Error,
    Transaction,
    Attachment,
    Profile,
    Span,
    /// SDK-internal payloads such as client reports
    Internal,
    /// Item tags this crate does not recognise
    Unknown,
}

impl DataCategory {
    /// Wire name of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::All => "all",
            DataCategory::Error => "error",
            DataCategory::Transaction => "transaction",
            DataCategory::Attachment => "attachment",
            DataCategory::Profile => "profile",
            DataCategory::Span => "span",
            DataCategory::Internal => "internal",
            DataCategory::Unknown => "unknown",
        }
    }

    /// Parse a category name as found in the `X-Sentry-Rate-Limits` header.
    ///
    /// Returns `None` for names that should not be rate limited locally.
    pub fn from_rate_limit_name(name: &str) -> Option<Self> {
        match name {
            "error" | "default" => Some(DataCategory::Error),
            "transaction" => Some(DataCategory::Transaction),
            "attachment" => Some(DataCategory::Attachment),
            "profile" | "profile_chunk" => Some(DataCategory::Profile),
            "span" => Some(DataCategory::Span),
            "internal" => Some(DataCategory::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an item never reached the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    NetworkError,
    QueueOverflow,
    CacheOverflow,
    RatelimitBackoff,
    BeforeSend,
    InternalSdkError,
}

impl DiscardReason {
    /// Wire name of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::NetworkError => "network_error",
            DiscardReason::QueueOverflow => "queue_overflow",
            DiscardReason::CacheOverflow => "cache_overflow",
            DiscardReason::RatelimitBackoff => "ratelimit_backoff",
            DiscardReason::BeforeSend => "before_send",
            DiscardReason::InternalSdkError => "internal_sdk_error",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item tag carried in each item header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemType {
    Event,
    Transaction,
    Attachment,
    Profile,
    ProfileChunk,
    ClientReport,
    /// Unrecognised tag, kept verbatim so the envelope round-trips
    Other(String),
}

impl ItemType {
    /// Wire name of the item type
    pub fn as_str(&self) -> &str {
        match self {
            ItemType::Event => "event",
            ItemType::Transaction => "transaction",
            ItemType::Attachment => "attachment",
            ItemType::Profile => "profile",
            ItemType::ProfileChunk => "profile_chunk",
            ItemType::ClientReport => "client_report",
            ItemType::Other(name) => name,
        }
    }

    /// Parse an item type from its wire name
    pub fn parse(s: &str) -> Self {
        match s {
            "event" => ItemType::Event,
            "transaction" => ItemType::Transaction,
            "attachment" => ItemType::Attachment,
            "profile" => ItemType::Profile,
            "profile_chunk" => ItemType::ProfileChunk,
            "client_report" => ItemType::ClientReport,
            other => ItemType::Other(other.to_string()),
        }
    }

    /// Category used for rate limiting and discard accounting
    pub fn data_category(&self) -> DataCategory {
        match self {
            ItemType::Event => DataCategory::Error,
            ItemType::Transaction => DataCategory::Transaction,
            ItemType::Attachment => DataCategory::Attachment,
            ItemType::Profile | ItemType::ProfileChunk => DataCategory::Profile,
            ItemType::ClientReport => DataCategory::Internal,
            ItemType::Other(_) => DataCategory::Unknown,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ItemType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ItemType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ItemType::parse(&s))
    }
}
