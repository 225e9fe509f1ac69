//! DSN descriptor and the request details derived from it.
//!
//! `{protocol}://{public_key}[:{secret_key}]@{host}[:{port}]{path}{project_id}[?option=value&...]`

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use reqwest::Url;

use crate::error::{Error, Result};

/// Version of the auth protocol sent in `X-Sentry-Auth`
pub const PROTOCOL_VERSION: u32 = 7;

/// Parsed DSN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    public_key: String,
    secret_key: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
    project_id: String,
    options: BTreeMap<String, String>,
}

impl Dsn {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn secret_key(&self) -> Option<&str> {
        self.secret_key.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Query option carried by the DSN
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Envelope endpoint, `{base}/api/{project_id}/envelope/`
    pub fn envelope_url(&self) -> String {
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();
        format!(
            "{}://{}{}{}api/{}/envelope/",
            self.scheme, self.host, port, self.path, self.project_id
        )
    }

    /// Value of the `X-Sentry-Auth` header
    pub fn auth_header(&self, client: &str) -> String {
        let mut header = format!(
            "Sentry sentry_version={},sentry_client={},sentry_key={}",
            PROTOCOL_VERSION, client, self.public_key
        );
        if let Some(secret) = &self.secret_key {
            header.push_str(",sentry_secret=");
            header.push_str(secret);
        }
        header
    }
}

impl FromStr for Dsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s.trim()).map_err(|e| Error::Dsn(e.to_string()))?;

        let public_key = url.username();
        if public_key.is_empty() {
            return Err(Error::Dsn("missing public key".to_string()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Dsn("missing host".to_string()))?;

        let full_path = url.path().trim_end_matches('/');
        let (prefix, project_id) = full_path.rsplit_once('/').unwrap_or(("", full_path));
        if project_id.is_empty() {
            return Err(Error::Dsn("missing project id".to_string()));
        }

        Ok(Self {
            scheme: url.scheme().to_string(),
            public_key: public_key.to_string(),
            secret_key: url.password().map(str::to_string),
            host: host.to_string(),
            port: url.port(),
            path: format!("{}/", prefix),
            project_id: project_id.to_string(),
            options: url.query_pairs().into_owned().collect(),
        })
    }
}

/// Prints the DSN with the secret key masked
impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.public_key)?;
        if self.secret_key.is_some() {
            f.write_str(":***")?;
        }
        write!(f, "@{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}{}", self.path, self.project_id)
    }
}

/// Everything the connection needs to address a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDetails {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RequestDetails {
    /// Build request details for a DSN.
    ///
    /// `client` is `<name>/<version>`; `extra_headers` are sent verbatim
    /// after the auth header.
    pub fn new(dsn: &Dsn, client: &str, extra_headers: &BTreeMap<String, String>) -> Self {
        let mut headers = vec![("X-Sentry-Auth".to_string(), dsn.auth_header(client))];
        headers.extend(
            extra_headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        Self {
            url: dsn.envelope_url(),
            headers,
        }
    }
}
