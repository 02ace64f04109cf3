//! Client configuration.

use serde::Deserialize;
use std::time::Duration;

/// Connection settings for [`HttpTransport`](crate::client::HttpTransport).
///
/// Deserializable so it can be loaded from a config file; every field has a
/// default.
///
/// # Examples
///
/// ```
/// use couch_feed::client::ClientConfig;
///
/// let config: ClientConfig = serde_json::from_str(
///     r#"{"base_url": "http://db.internal:5984/", "username": "admin", "password": "secret"}"#,
/// ).unwrap();
/// assert_eq!(config.max_retries, 3);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server root, e.g. `http://127.0.0.1:5984/`
    pub base_url: String,
    /// Basic auth user name
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// TCP/TLS connect timeout
    pub connect_timeout_ms: u64,
    /// Deadline for a complete info response, and for the response headers of a feed request
    pub request_timeout_ms: u64,
    /// Retries for the cursor lookup
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries
    pub retry_delay_ms: u64,
    /// Idle connections kept open per host for reuse
    #[serde(alias = "max_total_connections")]
    pub max_idle_connections: u32,
    /// Proxy for all requests, empty for none
    pub proxy_url: String,
    /// Capacity of the chunk channel between the network pump and the session
    pub chunk_buffer: usize,
    /// Log retried requests
    pub enable_logging: bool,
}

impl ClientConfig {
    /// Config pointing at `base_url` with everything else defaulted.
    pub fn new(base_url: impl Into<String>) -> Self {
        ClientConfig {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Set basic auth credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: "http://127.0.0.1:5984/".to_string(),
            username: None,
            password: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_idle_connections: 8,
            proxy_url: String::new(),
            chunk_buffer: 64,
            enable_logging: true,
        }
    }
}
