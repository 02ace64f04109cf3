#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # Continuous change feeds for document databases
//!
//! This crate implements the streaming core of a document-database client: it
//! keeps a `GET /{db}/_changes?feed=continuous` request open, splits the
//! never-ending body into lines as bytes arrive, parses each line into a
//! change, advances a resumable cursor and fans every change out to caches
//! and listeners.
//!
//! ## Data Flow
//!
//! ```text
//! Transport ──chunks──▶ LineDecoder ──lines──▶ EventParser ──records──▶ ChangeSession
//!                                                                        ├─▶ Cache::invalidate(id)
//!                                                                        └─▶ Listener::on_change(record)
//! ```
//!
//! ## Guarantees
//!
//! - Changes reach subscribers in server order, one line fully processed before the next
//! - Caches are invalidated before listeners see the same change
//! - Blank heartbeats, garbage lines and metadata objects are dropped silently
//! - A failing subscriber never affects the others or the feed
//! - `Listener::on_disconnect` fires exactly once per run, whether the owner
//!   stopped the feed or the connection died
//!
//! ## Usage
//!
//! ```ignore
//! use couch_feed::{ChangeSession, DocumentCache, HttpTransport, StartOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> couch_feed::Result<()> {
//!     let transport = Arc::new(HttpTransport::new("http://127.0.0.1:5984/")?);
//!     let cache = Arc::new(DocumentCache::new(10_000));
//!
//!     let mut session = ChangeSession::new(transport, "orders");
//!     session.add_cache(cache.clone())?;
//!
//!     let since = session.start(StartOptions::new()).await?;
//!     println!("following orders from {since}");
//!
//!     session.stopped().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - **[types]** - Sequence, ChangeRecord, DatabaseInfo
//! - **[error]** - Error types and result handling
//! - **[client]** - Transport seam, HTTP transport, line decoder
//! - **[changes]** - Event parser, subscribers, change session
//! - **[cache]** - LRU document cache driven by the feed
//! - **[protocol]** - Query construction and header formatting

pub mod cache;
pub mod changes;
pub mod client;
pub mod error;
pub mod protocol;
pub mod types;

pub use cache::DocumentCache;
pub use changes::{
    Cache, ChangeSession, ChangeStream, DisconnectReason, EventParser, FeedConfig, FeedEvent,
    Listener, SessionState, StartOptions,
};
pub use client::{ChannelTransport, ClientConfig, HttpTransport, LineDecoder, Transport};
pub use error::{FeedError, Result};
pub use types::{ChangeRecord, DatabaseInfo, Sequence};

#[cfg(test)]
mod tests;
