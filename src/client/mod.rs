//! Network side of the change feed.
//!
//! This module provides everything between the socket and the parsed line:
//!
//! - **Issue the feed request** and keep it open as a chunk stream
//! - **Look up the current sequence** of a database, with retries
//! - **Split chunks into lines** regardless of chunk boundaries
//!
//! # Module Organization
//!
//! ```text
//! client/
//! ├── config    - Client configuration
//! ├── transport - Transport trait, FeedRequest, ByteStream, ChannelTransport
//! ├── fetch     - HttpTransport (reqwest)
//! ├── parser    - Line decoder
//! └── utils     - Retry helpers
//! ```
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Transport`] | Seam between the session and the network |
//! | [`HttpTransport`] | HTTP implementation of [`Transport`] |
//! | [`ChannelTransport`] | In-memory implementation fed by the caller |
//! | [`LineDecoder`] | Incremental newline splitter |
//! | [`ClientConfig`] | Client configuration options |
//!
//! # Examples
//!
//! ## Creating a Transport
//!
//! ```
//! use couch_feed::client::{ClientConfig, HttpTransport};
//!
//! let transport = HttpTransport::new("http://127.0.0.1:5984/").unwrap();
//!
//! let config = ClientConfig {
//!     max_retries: 5,
//!     retry_delay_ms: 2000,
//!     ..ClientConfig::new("http://127.0.0.1:5984/")
//! };
//! let transport = HttpTransport::with_config(config).unwrap();
//! ```
//!
//! ## Decoding Lines
//!
//! ```
//! use couch_feed::client::LineDecoder;
//!
//! let mut decoder = LineDecoder::new();
//! assert!(decoder.feed(b"{\"seq\":1,").is_empty());
//! assert_eq!(decoder.feed(b"\"id\":\"a\"}\n").len(), 1);
//! ```
//!
//! ## Utility Functions
//!
//! ```
//! use couch_feed::client::{exponential_backoff, is_retryable_status};
//! use std::time::Duration;
//!
//! assert!(is_retryable_status(503));
//! assert!(!is_retryable_status(404));
//! assert_eq!(exponential_backoff(2, 100), Duration::from_millis(400));
//! ```

mod config;
mod fetch;
mod parser;
mod transport;
mod utils;

pub use config::ClientConfig;
pub use fetch::HttpTransport;
pub use parser::{LineDecoder, DEFAULT_MAX_LINE_BYTES};
pub use transport::{ByteStream, ChannelTransport, ChunkSender, FeedRequest, Transport};
pub use utils::*;
