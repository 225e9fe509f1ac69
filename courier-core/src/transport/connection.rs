//! Connection strategies.
//!
//! A [`Connection`] performs exactly one request per envelope and reports
//! the status and throttle headers back. Which implementation is used is
//! decided once, from the DSN scheme, through a [`ConnectionRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_ENCODING, CONTENT_TYPE};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::dsn::{Dsn, RequestDetails};
use crate::error::{Error, Result};

/// Content type of the request body
pub const ENVELOPE_CONTENT_TYPE: &str = "application/x-sentry-envelope";

/// Header carrying per-category throttle instructions
pub const RATE_LIMITS_HEADER: &str = "X-Sentry-Rate-Limits";

/// One outgoing request
#[derive(Debug, Clone)]
pub struct EnvelopeRequest {
    pub event_id: Uuid,
    /// Gzip-compressed envelope
    pub body: Vec<u8>,
}

/// What came back from the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub rate_limits: Option<String>,
}

impl ConnectionResponse {
    /// A plain 200 without throttle headers
    pub fn ok() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            rate_limits: None,
        }
    }

    /// Only 200 counts as delivered
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Sends one envelope request.
///
/// `Err` means the request never produced a response (refused connection,
/// timeout, DNS failure); any HTTP status is `Ok`.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    async fn send(&self, request: EnvelopeRequest) -> Result<ConnectionResponse>;

    /// Release resources. Requests still running are abandoned by the caller.
    async fn close(&self) {}
}

/// reqwest-backed connection to the envelope endpoint
#[derive(Debug)]
pub struct HttpConnection {
    http_client: reqwest::Client,
    url: String,
}

impl HttpConnection {
    pub fn new(details: RequestDetails, config: &TransportConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ENVELOPE_CONTENT_TYPE));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        for (name, value) in &details.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid value for header {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout() + config.read_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: details.url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn send(&self, request: EnvelopeRequest) -> Result<ConnectionResponse> {
        let response = self
            .http_client
            .post(&self.url)
            .body(request.body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("HTTP request failed: {}", e)))?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let result = ConnectionResponse {
            status: response.status().as_u16(),
            retry_after: header(reqwest::header::RETRY_AFTER.as_str()),
            rate_limits: header(RATE_LIMITS_HEADER),
        };

        if !result.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            tracing::debug!(
                event_id = %request.event_id,
                status = result.status,
                body = %error_text,
                "Endpoint rejected envelope"
            );
        }

        Ok(result)
    }
}

/// Accepts every envelope and sends nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpConnection;

#[async_trait]
impl Connection for NoOpConnection {
    async fn send(&self, request: EnvelopeRequest) -> Result<ConnectionResponse> {
        tracing::trace!(event_id = %request.event_id, "Dropping envelope on noop connection");
        Ok(ConnectionResponse::ok())
    }
}

/// Builds a connection for a DSN
pub type ConnectionFactory = fn(&Dsn, &TransportConfig) -> Result<Arc<dyn Connection>>;

/// Scheme to connection factory mapping, consulted once at construction.
#[derive(Clone)]
pub struct ConnectionRegistry {
    factories: HashMap<String, ConnectionFactory>,
}

impl ConnectionRegistry {
    /// Registry without any scheme
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the factory for a scheme
    pub fn register(&mut self, scheme: &str, factory: ConnectionFactory) -> &mut Self {
        self.factories.insert(scheme.to_ascii_lowercase(), factory);
        self
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Create the connection for the DSN's scheme
    pub fn create(&self, dsn: &Dsn, config: &TransportConfig) -> Result<Arc<dyn Connection>> {
        let factory = self
            .factories
            .get(&dsn.scheme().to_ascii_lowercase())
            .ok_or_else(|| Error::Dsn(format!("unsupported scheme '{}'", dsn.scheme())))?;
        factory(dsn, config)
    }
}

/// `http`, `https` and `noop`
impl Default for ConnectionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register("http", http_connection)
            .register("https", http_connection)
            .register("noop", noop_connection);
        registry
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.factories.keys().collect();
        schemes.sort();
        f.debug_struct("ConnectionRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

fn http_connection(dsn: &Dsn, config: &TransportConfig) -> Result<Arc<dyn Connection>> {
    let details = RequestDetails::new(dsn, &config.client_id(), &config.headers);
    Ok(Arc::new(HttpConnection::new(details, config)?))
}

fn noop_connection(_dsn: &Dsn, _config: &TransportConfig) -> Result<Arc<dyn Connection>> {
    Ok(Arc::new(NoOpConnection))
}
