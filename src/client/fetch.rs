//! HTTP implementation of the streaming transport.
//!
//! [`HttpTransport`] opens the feed with `reqwest`, checks the status, then
//! spawns a pump task that forwards `bytes_stream()` chunks into the
//! [`ByteStream`] channel. The pump stops as soon as the consumer drops its
//! end, even if the server never sends another byte, which releases the
//! connection.
//!
//! # Timeouts
//!
//! - connect: `ClientConfig::connect_timeout_ms`
//! - response headers of the feed request: `ClientConfig::request_timeout_ms`
//! - the streamed body: none (heartbeat timeouts are handled by the session)
//!
//! # Examples
//!
//! ```ignore
//! use couch_feed::client::{ClientConfig, FeedRequest, HttpTransport, Transport};
//!
//! #[tokio::main]
//! async fn main() -> couch_feed::Result<()> {
//!     let transport = HttpTransport::with_config(
//!         ClientConfig::new("http://127.0.0.1:5984/").with_credentials("admin", "secret"),
//!     )?;
//!     let info = transport.database_info("orders").await?;
//!     println!("current seq: {:?}", info.update_seq);
//!     Ok(())
//! }
//! ```

use crate::client::config::ClientConfig;
use crate::client::transport::{ByteStream, ChunkSender, FeedRequest, Transport};
use crate::client::utils::exponential_backoff;
use crate::error::{FeedError, Result};
use crate::protocol::{basic_auth_header, constants::CHANGES_SEGMENT};
use crate::types::DatabaseInfo;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

/// Longest error body kept in [`FeedError::Status`]
const MAX_ERROR_BODY: usize = 1024;

/// `reqwest`-backed [`Transport`].
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    config: Arc<ClientConfig>,
}

impl HttpTransport {
    /// Create a transport for `base_url` with default settings
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_config(ClientConfig::new(base_url))
    }

    /// Create a transport with custom configuration
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(FeedError::Config(format!(
                "base URL cannot carry a path: {}",
                config.base_url
            )));
        }

        let mut headers = HeaderMap::new();
        if let Some(username) = &config.username {
            let password = config.password.as_deref().unwrap_or_default();
            let value = HeaderValue::from_str(&basic_auth_header(username, password))
                .map_err(|e| FeedError::Config(format!("Invalid credentials: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        // No overall timeout: it would also cut off the streamed body.
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(config.max_idle_connections as usize)
            .default_headers(headers);

        if !config.proxy_url.is_empty() {
            let proxy = reqwest::Proxy::all(&config.proxy_url)
                .map_err(|e| FeedError::Config(format!("Invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        Ok(HttpTransport {
            client: builder.build()?,
            base_url,
            config: Arc::new(config),
        })
    }

    /// Get the client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Build `{base}/{database}/{segments...}` with each part percent-encoded.
    fn database_url(&self, database: &str, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FeedError::Config("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(database)
            .extend(segments);
        Ok(url)
    }

    /// Single info request, no retries
    async fn fetch_info(&self, database: &str) -> Result<DatabaseInfo> {
        let url = self.database_url(database, &[""])?;
        let response = self
            .client
            .get(url)
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| classify_send_error(e, self.config.request_timeout()))?;

        let response = check_status(response).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_feed(&self, request: FeedRequest) -> Result<ByteStream> {
        let url = self.database_url(&request.database, &[CHANGES_SEGMENT])?;
        tracing::debug!(method = %request.method, path = %request.path(), "Opening change feed");

        let mut req_builder = self
            .client
            .request(request.method.clone(), url)
            .query(&request.query);
        if let Some(body) = &request.body {
            req_builder = req_builder.json(body);
        }

        let timeout = self.config.request_timeout();
        let response = tokio::time::timeout(timeout, req_builder.send())
            .await
            .map_err(|_| FeedError::Timeout(timeout))?
            .map_err(|e| classify_send_error(e, timeout))?;

        let response = check_status(response).await?;

        let (tx, stream) = ByteStream::channel(self.config.chunk_buffer);
        tokio::spawn(pump_body(response.bytes_stream(), tx));
        Ok(stream)
    }

    async fn database_info(&self, database: &str) -> Result<DatabaseInfo> {
        let mut attempt = 0;
        loop {
            match self.fetch_info(database).await {
                Ok(info) => return Ok(info),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = exponential_backoff(attempt, self.config.retry_delay_ms);
                    if self.config.enable_logging {
                        tracing::warn!(
                            "Info request for {} failed (attempt {}), retrying after {:?}: {}",
                            database,
                            attempt + 1,
                            delay,
                            e
                        );
                    }
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Forward body chunks until the body ends, fails, or the consumer leaves.
async fn pump_body<S>(body: S, tx: ChunkSender)
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    futures::pin_mut!(body);
    loop {
        tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Feed consumer dropped, releasing connection");
                return;
            }
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(FeedError::Disconnected(e.to_string()))).await;
                    return;
                }
                None => return,
            }
        }
    }
}

fn classify_send_error(err: reqwest::Error, timeout: Duration) -> FeedError {
    if err.is_timeout() {
        FeedError::Timeout(timeout)
    } else {
        FeedError::Http(err.to_string())
    }
}

/// Turn a non-success response into [`FeedError::Status`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    Err(FeedError::Status {
        status: status.as_u16(),
        body,
    })
}
