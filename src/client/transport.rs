//! Streaming transport abstraction.
//!
//! A [`Transport`] issues one feed request and hands back the response body as
//! a [`ByteStream`]: a bounded channel of chunks, fed by whoever owns the
//! network side. The session only ever drains that channel, so tests can push
//! arbitrary chunk sequences through [`ChannelTransport`] without a server.
//!
//! # Channel Contract
//!
//! - `Ok(chunk)` - bytes in arrival order
//! - `Err(FeedError::Disconnected)` - the stream failed after it was opened
//! - channel closed - the server ended the body cleanly
//!
//! Dropping the [`ByteStream`] is how a consumer aborts: the producer sees the
//! channel close and releases the connection without waiting for more data.

use crate::error::{FeedError, Result};
use crate::protocol::constants::CHANGES_SEGMENT;
use crate::types::{DatabaseInfo, Sequence};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use http::Method;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Sending half of a [`ByteStream`]
pub type ChunkSender = mpsc::Sender<Result<Bytes>>;

/// A feed request as built by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRequest {
    /// `GET`, or `POST` when a JSON body is attached
    pub method: Method,
    /// Database name, unescaped
    pub database: String,
    /// Query parameters, in order
    pub query: Vec<(String, String)>,
    /// JSON request body
    pub body: Option<Value>,
}

impl FeedRequest {
    /// A `GET /{database}/_changes` request with no parameters.
    pub fn changes(database: impl Into<String>) -> Self {
        FeedRequest {
            method: Method::GET,
            database: database.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Attach a JSON body; the request becomes a `POST`.
    pub fn with_body(mut self, body: Value) -> Self {
        self.method = Method::POST;
        self.body = Some(body);
        self
    }

    /// Path of the request, for diagnostics.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.database, CHANGES_SEGMENT)
    }

    /// Value of a query parameter
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Response body of an open feed, delivered chunk by chunk.
pub struct ByteStream {
    receiver: mpsc::Receiver<Result<Bytes>>,
}

impl ByteStream {
    /// Create a bounded chunk channel.
    pub fn channel(buffer: usize) -> (ChunkSender, ByteStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, ByteStream { receiver: rx })
    }

    /// Receive the next chunk.
    ///
    /// - `Some(Ok(bytes))` - a chunk arrived
    /// - `Some(Err(error))` - the stream failed
    /// - `None` - the body ended
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.receiver.recv().await
    }
}

impl Stream for ByteStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Network side of a change session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the feed request.
    ///
    /// Resolves once the server has answered with a success status; setup
    /// failures (connect, timeout, non-success status) are returned here and
    /// never through the stream.
    async fn open_feed(&self, request: FeedRequest) -> Result<ByteStream>;

    /// Fetch `GET /{database}/`.
    async fn database_info(&self, database: &str) -> Result<DatabaseInfo>;
}

/// In-memory [`Transport`] driven by the caller.
///
/// Each [`push_feed`](Self::push_feed) scripts the response to one future
/// `open_feed` call and returns the sender that feeds its body.
///
/// # Examples
///
/// ```
/// use couch_feed::client::{ChannelTransport, FeedRequest, Transport};
///
/// # tokio_test::block_on(async {
/// let transport = ChannelTransport::new();
/// let sender = transport.push_feed();
/// let mut body = transport.open_feed(FeedRequest::changes("db")).await.unwrap();
///
/// sender.send(Ok("{\"id\":\"a\"}\n".into())).await.unwrap();
/// drop(sender);
///
/// assert!(body.next_chunk().await.unwrap().is_ok());
/// assert!(body.next_chunk().await.is_none());
/// # });
/// ```
pub struct ChannelTransport {
    feeds: Mutex<VecDeque<Result<ByteStream>>>,
    info: Mutex<HashMap<String, DatabaseInfo>>,
    requests: Mutex<Vec<FeedRequest>>,
    buffer: usize,
}

impl ChannelTransport {
    /// Create a transport with no scripted feeds.
    pub fn new() -> Self {
        Self::with_buffer(64)
    }

    /// Create a transport whose chunk channels hold `buffer` chunks.
    pub fn with_buffer(buffer: usize) -> Self {
        ChannelTransport {
            feeds: Mutex::new(VecDeque::new()),
            info: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            buffer,
        }
    }

    /// Script the next `open_feed` to succeed; returns the body sender.
    pub fn push_feed(&self) -> ChunkSender {
        let (tx, stream) = ByteStream::channel(self.buffer);
        self.feeds.lock().push_back(Ok(stream));
        tx
    }

    /// Script the next `open_feed` to fail with `error`.
    pub fn push_error(&self, error: FeedError) {
        self.feeds.lock().push_back(Err(error));
    }

    /// Set the current sequence reported for `database`.
    pub fn set_update_seq(&self, database: &str, seq: impl Into<Sequence>) {
        let info = DatabaseInfo {
            db_name: Some(database.to_string()),
            update_seq: Some(seq.into()),
            ..Default::default()
        };
        self.info.lock().insert(database.to_string(), info);
    }

    /// Every feed request issued so far.
    pub fn requests(&self) -> Vec<FeedRequest> {
        self.requests.lock().clone()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn open_feed(&self, request: FeedRequest) -> Result<ByteStream> {
        self.requests.lock().push(request);
        self.feeds
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(FeedError::Http("connection refused".to_string())))
    }

    async fn database_info(&self, database: &str) -> Result<DatabaseInfo> {
        self.info
            .lock()
            .get(database)
            .cloned()
            .ok_or_else(|| FeedError::Status {
                status: 404,
                body: r#"{"error":"not_found","reason":"Database does not exist."}"#.to_string(),
            })
    }
}
