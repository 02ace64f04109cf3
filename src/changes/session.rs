//! Change session: the long-lived controller of one continuous feed.
//!
//! # State Machine
//!
//! ```text
//!   Idle ──start()──▶ Starting ──stream open──▶ Running ──stop() / peer──▶ Stopped
//!    ▲                   │                                                  │
//!    └── setup error ────┘                    start(since = last cursor) ◀──┘
//! ```
//!
//! While `Running`, a single task drains the [`ByteStream`]: every chunk goes
//! through the [`LineDecoder`], every line through the [`EventParser`], and
//! each resulting record updates the cursor and is dispatched to caches then
//! listeners before the next line is looked at.
//!
//! `stop()` sets `stop_requested` and fires a oneshot the feed task selects
//! on, so termination never waits for the server. Whatever ends the feed,
//! listeners get exactly one `on_disconnect` per successful `start()`.

use crate::changes::event::{EventParser, ParserConfig};
use crate::changes::subscriber::{Cache, DisconnectReason, Listener, Subscribers};
use crate::client::{ByteStream, FeedRequest, LineDecoder, Transport, DEFAULT_MAX_LINE_BYTES};
use crate::error::{FeedError, Result};
use crate::protocol::{changes_query, constants::KEYS_FIELD};
use crate::types::{ChangeRecord, Sequence};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// Lifecycle of a [`ChangeSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never started (or last start failed)
    Idle,
    /// Feed request issued, waiting for the stream to open
    Starting,
    /// Events flowing
    Running,
    /// Feed ended; may be started again
    Stopped,
}

/// Per-session feed settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Interval the server should send blank heartbeat lines at
    pub heartbeat_ms: Option<u64>,
    /// Treat this much silence as a lost connection
    pub heartbeat_timeout_ms: Option<u64>,
    /// Longest line kept; longer ones are dropped
    pub max_line_bytes: usize,
    /// Event parser settings
    pub parser: ParserConfig,
}

impl FeedConfig {
    fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat_ms.map(Duration::from_millis)
    }

    fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            heartbeat_ms: Some(10_000),
            heartbeat_timeout_ms: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            parser: ParserConfig::default(),
        }
    }
}

/// Options for [`ChangeSession::start`].
///
/// # Examples
///
/// ```
/// use couch_feed::changes::StartOptions;
///
/// let options = StartOptions::new()
///     .since(1200)
///     .with_filter("app/by_type")
///     .with_param("type", "invoice")
///     .include_docs();
/// assert_eq!(options.params.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Resume point; `None` means "from the database's current sequence"
    pub since: Option<Sequence>,
    /// Server-side filter function (`ddoc/name`)
    pub filter: Option<String>,
    /// Extra query parameters, forwarded verbatim
    pub params: BTreeMap<String, String>,
    /// Keys sent as a JSON body; switches the request to `POST`
    pub keys: Option<Vec<Value>>,
}

impl StartOptions {
    /// Start from the current sequence, unfiltered
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from `seq`
    pub fn since(mut self, seq: impl Into<Sequence>) -> Self {
        self.since = Some(seq.into());
        self
    }

    /// Use a server-side filter
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Add a pass-through query parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Restrict the feed to `keys`
    pub fn with_keys(mut self, keys: Vec<Value>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Ask the server to embed each document in its change
    pub fn include_docs(self) -> Self {
        self.with_param("include_docs", "true")
    }
}

struct Control {
    state: SessionState,
    /// Set synchronously by `stop()`; read when the feed ends
    stop_requested: bool,
    stop_tx: Option<oneshot::Sender<()>>,
    cursor: Option<Sequence>,
    /// Number of `start()` attempts claimed so far
    runs: u64,
}

struct Shared {
    control: Mutex<Control>,
    /// Last run whose termination has been fully reported
    finished: watch::Sender<u64>,
}

impl Shared {
    fn request_stop(&self, session_id: Uuid) {
        let mut control = self.control.lock();
        if let Some(tx) = control.stop_tx.take() {
            control.stop_requested = true;
            tracing::debug!(session = %session_id, "Stop requested");
            let _ = tx.send(());
        }
    }

    fn stop_requested(&self) -> bool {
        self.control.lock().stop_requested
    }
}

/// Stops a session from anywhere; cheap to clone.
#[derive(Clone)]
pub struct StopHandle {
    session_id: Uuid,
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Same as [`ChangeSession::stop`].
    pub fn stop(&self) {
        self.shared.request_stop(self.session_id);
    }
}

/// Follows the continuous change feed of one database.
///
/// # Examples
///
/// ```ignore
/// use couch_feed::changes::{ChangeSession, StartOptions};
/// use couch_feed::client::HttpTransport;
/// use std::sync::Arc;
///
/// let transport = Arc::new(HttpTransport::new("http://127.0.0.1:5984/")?);
/// let mut session = ChangeSession::new(transport, "orders");
/// session.add_cache(cache.clone())?;
/// session.add_listener(listener.clone())?;
///
/// let since = session.start(StartOptions::new()).await?;
/// println!("following orders from {since}");
/// ```
pub struct ChangeSession {
    id: Uuid,
    database: String,
    transport: Arc<dyn Transport>,
    config: FeedConfig,
    subscribers: Subscribers,
    shared: Arc<Shared>,
}

impl ChangeSession {
    /// Create an idle session with default settings
    pub fn new(transport: Arc<dyn Transport>, database: impl Into<String>) -> Self {
        Self::with_config(transport, database, FeedConfig::default())
    }

    /// Create an idle session with custom settings
    pub fn with_config(
        transport: Arc<dyn Transport>,
        database: impl Into<String>,
        config: FeedConfig,
    ) -> Self {
        let (finished, _) = watch::channel(0);
        ChangeSession {
            id: Uuid::new_v4(),
            database: database.into(),
            transport,
            config,
            subscribers: Subscribers::default(),
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: SessionState::Idle,
                    stop_requested: false,
                    stop_tx: None,
                    cursor: None,
                    runs: 0,
                }),
                finished,
            }),
        }
    }

    /// Register a cache. Only allowed while idle.
    pub fn add_cache(&mut self, cache: Arc<dyn Cache>) -> Result<()> {
        self.ensure_idle()?;
        self.subscribers.caches.push(cache);
        Ok(())
    }

    /// Register a listener. Only allowed while idle.
    pub fn add_listener(&mut self, listener: Arc<dyn Listener>) -> Result<()> {
        self.ensure_idle()?;
        self.subscribers.listeners.push(listener);
        Ok(())
    }

    /// Open the feed and begin dispatching.
    ///
    /// Without `options.since`, the database's current sequence is looked up
    /// first, so only changes made from now on are delivered. Returns the
    /// cursor the feed starts from.
    ///
    /// # Errors
    ///
    /// - [`FeedError::AlreadyRunning`] if the session is starting or running
    /// - any setup failure of the cursor lookup or the feed request; the
    ///   session is back to [`SessionState::Idle`] afterwards
    pub async fn start(&self, options: StartOptions) -> Result<Sequence> {
        let (stop_tx, stop_rx) = oneshot::channel();
        let run = {
            let mut control = self.shared.control.lock();
            match control.state {
                SessionState::Idle | SessionState::Stopped => {}
                SessionState::Starting | SessionState::Running => {
                    return Err(FeedError::AlreadyRunning)
                }
            }
            control.state = SessionState::Starting;
            control.stop_requested = false;
            control.stop_tx = Some(stop_tx);
            control.runs += 1;
            control.runs
        };
        let mut guard = StartGuard {
            shared: &self.shared,
            run,
            armed: true,
        };

        let (since, body) = self.open(options).await?;

        {
            let mut control = self.shared.control.lock();
            control.cursor = Some(since.clone());
            control.state = SessionState::Running;
        }
        guard.armed = false;

        tracing::info!(
            session = %self.id,
            database = %self.database,
            since = %since,
            "Change feed running"
        );

        let worker = FeedWorker {
            session_id: self.id,
            database: self.database.clone(),
            run,
            parser: EventParser::with_config(self.config.parser),
            subscribers: self.subscribers.clone(),
            shared: self.shared.clone(),
            heartbeat_timeout: self.config.heartbeat_timeout(),
            max_line_bytes: self.config.max_line_bytes,
        };
        tokio::spawn(worker.run(body, stop_rx));

        Ok(since)
    }

    /// Ask the feed to end. No-op unless starting or running.
    ///
    /// Returns immediately; the end is observed through
    /// [`Listener::on_disconnect`] or [`stopped`](Self::stopped).
    pub fn stop(&self) {
        self.shared.request_stop(self.id);
    }

    /// Handle that can stop this session from another task
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            session_id: self.id,
            shared: self.shared.clone(),
        }
    }

    /// Wait until the latest run has ended and every listener saw `on_disconnect`.
    ///
    /// Returns immediately if the session was never started.
    pub async fn stopped(&self) {
        let target = self.shared.control.lock().runs;
        let mut finished = self.shared.finished.subscribe();
        let _ = finished.wait_for(|done| *done >= target).await;
    }

    /// Whether a feed request is active (starting or running)
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Starting | SessionState::Running
        )
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.shared.control.lock().state
    }

    /// Sequence of the last processed change, or the starting cursor
    pub fn cursor(&self) -> Option<Sequence> {
        self.shared.control.lock().cursor.clone()
    }

    /// Session identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Database this session follows
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Look up the database's current sequence.
    pub async fn current_sequence(&self) -> Result<Sequence> {
        self.transport
            .database_info(&self.database)
            .await?
            .update_seq
            .ok_or_else(|| FeedError::MissingSequence(self.database.clone()))
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.state() {
            SessionState::Idle => Ok(()),
            _ => Err(FeedError::AlreadyStarted),
        }
    }

    async fn open(&self, options: StartOptions) -> Result<(Sequence, ByteStream)> {
        let since = match options.since {
            Some(since) => since,
            None => self.current_sequence().await?,
        };

        let mut request = FeedRequest::changes(self.database.clone());
        request.query = changes_query(
            &since,
            options.filter.as_deref(),
            self.config.heartbeat(),
            &options.params,
        );
        if let Some(keys) = options.keys {
            request = request.with_body(json!({ KEYS_FIELD: keys }));
        }

        let body = self.transport.open_feed(request).await?;
        Ok((since, body))
    }
}

impl Drop for ChangeSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Puts a session whose `start()` failed or was cancelled back to `Idle`.
struct StartGuard<'a> {
    shared: &'a Shared,
    run: u64,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut control = self.shared.control.lock();
            control.state = SessionState::Idle;
            control.stop_tx = None;
            control.stop_requested = false;
        }
        self.shared.finished.send_replace(self.run);
    }
}

/// State moved into the feed task.
struct FeedWorker {
    session_id: Uuid,
    database: String,
    run: u64,
    parser: EventParser,
    subscribers: Subscribers,
    shared: Arc<Shared>,
    heartbeat_timeout: Option<Duration>,
    max_line_bytes: usize,
}

impl FeedWorker {
    async fn run(self, mut body: ByteStream, mut stop_rx: oneshot::Receiver<()>) {
        let mut decoder = LineDecoder::with_max_line(self.max_line_bytes);
        let mut processed: u64 = 0;

        let reason = 'feed: loop {
            let next = tokio::select! {
                biased;
                _ = &mut stop_rx => break 'feed DisconnectReason::Stopped,
                next = next_chunk(&mut body, self.heartbeat_timeout) => next,
            };

            match next {
                Ok(Some(Ok(chunk))) => {
                    for line in decoder.feed(&chunk) {
                        if self.shared.stop_requested() {
                            break 'feed DisconnectReason::Stopped;
                        }
                        if let Some(change) = self.parser.parse(&line) {
                            self.apply(&change);
                            processed += 1;
                        }
                    }
                }
                Ok(Some(Err(FeedError::Disconnected(msg)))) => {
                    break 'feed DisconnectReason::ConnectionLost(msg)
                }
                Ok(Some(Err(e))) => break 'feed DisconnectReason::ConnectionLost(e.to_string()),
                Ok(None) => break 'feed DisconnectReason::Closed,
                Err(silence) => break 'feed DisconnectReason::HeartbeatTimeout(silence),
            }
        };

        decoder.finish();
        drop(body);
        self.finish(reason, processed);
    }

    fn apply(&self, change: &ChangeRecord) {
        if let Some(seq) = &change.seq {
            self.shared.control.lock().cursor = Some(seq.clone());
        }
        tracing::trace!(
            session = %self.session_id,
            id = %change.id,
            seq = ?change.seq,
            deleted = change.deleted,
            "Dispatching change"
        );
        self.subscribers.dispatch(change);
    }

    /// Report the end of the run.
    ///
    /// Listeners hear `on_disconnect` while the session still counts as
    /// running, so a new `start()` cannot interleave with the notification.
    fn finish(self, reason: DisconnectReason, processed: u64) {
        let reason = {
            let mut control = self.shared.control.lock();
            control.stop_tx = None;
            if control.stop_requested {
                DisconnectReason::Stopped
            } else {
                reason
            }
        };

        if reason.is_requested() {
            tracing::info!(
                session = %self.session_id,
                database = %self.database,
                processed,
                "Change feed stopped"
            );
        } else {
            tracing::warn!(
                session = %self.session_id,
                database = %self.database,
                processed,
                "Change feed ended: {}",
                reason
            );
        }

        self.subscribers.disconnect(&reason);
        self.shared.control.lock().state = SessionState::Stopped;
        self.shared.finished.send_replace(self.run);
    }
}

/// Next chunk, or `Err(limit)` after `limit` of silence.
async fn next_chunk(
    body: &mut ByteStream,
    limit: Option<Duration>,
) -> std::result::Result<Option<Result<Bytes>>, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, body.next_chunk())
            .await
            .map_err(|_| limit),
        None => Ok(body.next_chunk().await),
    }
}
