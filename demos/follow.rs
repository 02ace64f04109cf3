//! Follow a database's change feed and log every change
//!
//! Reconnects with backoff when the connection drops, resuming from the last
//! cursor. Ctrl-C stops the feed.
//!
//! Run with: cargo run --example follow -- <database> [since]
//!
//! Environment: COUCH_URL, COUCH_USER, COUCH_PASSWORD, HEARTBEAT_TIMEOUT (e.g. `60s`), LOG_LEVEL

use couch_feed::client::{exponential_backoff, is_access_denied_status};
use couch_feed::protocol::parse_heartbeat;
use couch_feed::{
    ChangeRecord, ChangeSession, ClientConfig, DisconnectReason, DocumentCache, FeedConfig,
    FeedError, HttpTransport, Listener, StartOptions,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct LogListener {
    last_reason: Mutex<Option<DisconnectReason>>,
}

impl Listener for LogListener {
    fn on_change(&self, change: &ChangeRecord) -> anyhow::Result<()> {
        tracing::info!(
            id = %change.id,
            rev = change.current_rev().unwrap_or("-"),
            deleted = change.deleted,
            "change"
        );
        Ok(())
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        *self.last_reason.lock() = Some(reason.clone());
    }
}

#[tokio::main]
async fn main() -> couch_feed::Result<()> {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut args = std::env::args().skip(1);
    let database = args.next().unwrap_or_else(|| "orders".to_string());
    let since = args.next();

    let mut config = ClientConfig::new(
        std::env::var("COUCH_URL").unwrap_or_else(|_| "http://127.0.0.1:5984/".to_string()),
    );
    if let Ok(user) = std::env::var("COUCH_USER") {
        config = config.with_credentials(user, std::env::var("COUCH_PASSWORD").unwrap_or_default());
    }
    let retry_delay_ms = config.retry_delay_ms;
    let transport = Arc::new(HttpTransport::with_config(config)?);

    let cache = Arc::new(DocumentCache::new(1024));
    let listener = Arc::new(LogListener::default());
    let mut feed_config = FeedConfig::default();
    if let Ok(value) = std::env::var("HEARTBEAT_TIMEOUT") {
        feed_config.heartbeat_timeout_ms = Some(parse_heartbeat(&value)?.as_millis() as u64);
    }
    let mut session = ChangeSession::with_config(transport, database, feed_config);
    session.add_cache(cache)?;
    session.add_listener(listener.clone())?;

    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = quit.clone();
        let stop = session.stop_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                quit.store(true, Ordering::SeqCst);
                stop.stop();
            }
        });
    }

    let mut options = match since {
        Some(since) => StartOptions::new().since(since),
        None => StartOptions::new(),
    };
    let mut attempt = 0;

    while !quit.load(Ordering::SeqCst) {
        match session.start(options.clone()).await {
            Ok(since) => {
                attempt = 0;
                tracing::info!("Following {} from {}", session.database(), since);
                session.stopped().await;
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("Could not open feed: {}", e);
            }
            Err(FeedError::Status { status, body }) if is_access_denied_status(status) => {
                tracing::error!("Access denied ({}), check COUCH_USER/COUCH_PASSWORD: {}", status, body);
                return Err(FeedError::Status { status, body });
            }
            Err(e) => return Err(e),
        }

        if matches!(*listener.last_reason.lock(), Some(DisconnectReason::Stopped)) {
            break;
        }
        if let Some(cursor) = session.cursor() {
            options = options.since(cursor);
        }

        let delay = exponential_backoff(attempt, retry_delay_ms);
        attempt += 1;
        tracing::info!("Reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;
    }

    Ok(())
}
