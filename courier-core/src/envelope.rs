//! Envelope and item model plus the newline-delimited wire codec.
//!
//! ```text
//! {"event_id":"9ec79c33ec9942ab8353589fcb2e04dc","sent_at":"2024-01-01T00:00:00Z"}
//! {"type":"event","length":41,"content_type":"application/json"}
//! {"message":"hello","level":"error"}
//! ```
//!
//! The same framing is used for the HTTP body (gzip-compressed) and for
//! offline buffer files.

use std::collections::BTreeMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{DataCategory, ItemType};

/// Envelope header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Identifier of the envelope, also the offline buffer file name
    #[serde(with = "uuid::serde::simple")]
    pub event_id: Uuid,

    /// Stamped by the transport right before the request goes out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// A typed payload unit within an envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    item_type: ItemType,
    content_type: Option<String>,
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ItemHeader {
    #[serde(rename = "type")]
    item_type: ItemType,
    #[serde(default)]
    length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
}

impl Item {
    /// Create an item from raw bytes
    pub fn new(item_type: ItemType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            item_type,
            content_type: None,
            payload: payload.into(),
        }
    }

    /// Create a JSON item of the given type
    pub fn json<T: Serialize>(item_type: ItemType, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(item_type, payload).with_content_type("application/json"))
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Category used for rate limiting and discard accounting
    pub fn data_category(&self) -> DataCategory {
        self.item_type.data_category()
    }
}

/// Container for one or more items delivered in a single request.
///
/// Always holds at least one item; item order is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    header: EnvelopeHeader,
    items: Vec<Item>,
}

impl Envelope {
    /// Create an envelope with a fresh event id
    pub fn from_items(items: Vec<Item>) -> Result<Self> {
        Self::with_event_id(Uuid::new_v4(), items)
    }

    /// Create an envelope with a caller-supplied event id
    pub fn with_event_id(event_id: Uuid, items: Vec<Item>) -> Result<Self> {
        if items.is_empty() {
            return Err(Error::Serialization(
                "envelope must contain at least one item".to_string(),
            ));
        }
        Ok(Self {
            header: EnvelopeHeader {
                event_id,
                sent_at: None,
            },
            items,
        })
    }

    /// Create a single-item envelope
    pub fn from_item(item: Item) -> Self {
        Self {
            header: EnvelopeHeader {
                event_id: Uuid::new_v4(),
                sent_at: None,
            },
            items: vec![item],
        }
    }

    /// Callers guarantee `items` is non-empty.
    pub(crate) fn from_parts(header: EnvelopeHeader, items: Vec<Item>) -> Self {
        debug_assert!(!items.is_empty());
        Self { header, items }
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    pub fn event_id(&self) -> Uuid {
        self.header.event_id
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub(crate) fn into_parts(self) -> (EnvelopeHeader, Vec<Item>) {
        (self.header, self.items)
    }

    pub(crate) fn push_item(&mut self, item: Item) {
        self.items.push(item);
    }

    pub(crate) fn set_sent_at(&mut self, sent_at: DateTime<Utc>) {
        self.header.sent_at = Some(sent_at);
    }

    /// Number of items per data category
    pub fn category_counts(&self) -> BTreeMap<DataCategory, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.data_category()).or_insert(0) += 1;
        }
        counts
    }

    /// Write the envelope in wire format
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        serde_json::to_writer(&mut *writer, &self.header)?;
        writer.write_all(b"\n")?;
        for item in &self.items {
            let header = ItemHeader {
                item_type: item.item_type.clone(),
                length: Some(item.payload.len()),
                content_type: item.content_type.clone(),
            };
            serde_json::to_writer(&mut *writer, &header)?;
            writer.write_all(b"\n")?;
            writer.write_all(&item.payload)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Serialize to wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Serialize to gzip-compressed wire format (HTTP request body)
    pub fn to_gzip(&self) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        self.write_to(&mut encoder)?;
        Ok(encoder.finish()?)
    }

    /// Parse an envelope from wire format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (header_line, mut rest) = split_line(bytes);
        let header: EnvelopeHeader = serde_json::from_slice(header_line)
            .map_err(|e| Error::Serialization(format!("invalid envelope header: {}", e)))?;

        let mut items = Vec::new();
        while !rest.is_empty() {
            let (line, after) = split_line(rest);
            if line.iter().all(u8::is_ascii_whitespace) {
                rest = after;
                continue;
            }

            let item_header: ItemHeader = serde_json::from_slice(line)
                .map_err(|e| Error::Serialization(format!("invalid item header: {}", e)))?;
            let length = item_header.length.ok_or_else(|| {
                Error::Serialization(format!(
                    "item '{}' has no length",
                    item_header.item_type
                ))
            })?;
            if after.len() < length {
                return Err(Error::Serialization(format!(
                    "item '{}' truncated: expected {} bytes, found {}",
                    item_header.item_type,
                    length,
                    after.len()
                )));
            }

            items.push(Item {
                item_type: item_header.item_type,
                content_type: item_header.content_type,
                payload: after[..length].to_vec(),
            });

            rest = &after[length..];
            if rest.first() == Some(&b'\n') {
                rest = &rest[1..];
            }
        }

        if items.is_empty() {
            return Err(Error::Serialization("envelope has no items".to_string()));
        }

        Ok(Self { header, items })
    }
}

fn split_line(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().position(|&b| b == b'\n') {
        Some(pos) => (&bytes[..pos], &bytes[pos + 1..]),
        None => (bytes, &[]),
    }
}
