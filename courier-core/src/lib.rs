//! # courier-core
//!
//! Core library for courier - the delivery pipeline of an error and
//! telemetry reporting SDK.
//!
//! This library provides:
//! - Envelope and item model with the newline-delimited wire codec
//! - Server-driven rate limiting and discard accounting (client reports)
//! - A bounded asynchronous HTTP transport
//! - A durable offline buffer with a periodic flusher
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Captured envelopes flow through:
//! - **Pipeline:** owned by the host, entry point for `capture`/`flush`/`close`
//! - **Transport:** filters rate limited items, attaches client reports and
//!   POSTs the gzip-compressed envelope
//! - **Offline buffer:** keeps envelopes whose send failed until the
//!   flusher delivers them
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_core::{Config, Envelope, Hint, Item, ItemType, Pipeline};
//! use std::time::Duration;
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Start the pipeline and send one event
//! let pipeline = Pipeline::new(config);
//! let item = Item::json(ItemType::Event, &serde_json::json!({"message": "boom"}))
//!     .expect("failed to encode event");
//! pipeline.capture(Envelope::from_item(item), Hint::new());
//! pipeline.flush(Duration::from_secs(2));
//! pipeline.close();
//! ```

// Re-export commonly used items at the crate root
pub use buffer::{open_buffer, BufferFlusher, DiskBuffer, EnvelopeBuffer, FlushSummary, NoOpBuffer};
pub use client_report::{ClientReport, ClientReportRecorder, DiscardedEvent};
pub use config::Config;
pub use dsn::Dsn;
pub use envelope::{Envelope, EnvelopeHeader, Item};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use rate_limit::{Clock, ManualClock, RateLimiter, SystemClock};
pub use transport::{Connection, ConnectionRegistry, Connectivity, Hint, SendOutcome, Transport};
pub use types::*;

// Public modules
pub mod buffer;
pub mod client_report;
pub mod config;
pub mod dsn;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod rate_limit;
pub mod transport;
pub mod types;
