//! Wire-level constants and request construction for the changes protocol.
//!
//! # Feed request
//!
//! ```text
//! GET /{db}/_changes?feed=continuous&since={cursor}[&heartbeat=ms][&filter=name][&k=v...]
//! ```
//!
//! When `keys` are supplied the same query is sent as `POST` with a JSON body
//! `{"keys": [...]}`.
//!
//! # Examples
//!
//! ```
//! use couch_feed::protocol::changes_query;
//! use couch_feed::Sequence;
//! use std::collections::BTreeMap;
//!
//! let query = changes_query(&Sequence::from(7), Some("app/by_type"), None, &BTreeMap::new());
//! assert_eq!(query[0], ("feed".to_string(), "continuous".to_string()));
//! assert_eq!(query[1], ("since".to_string(), "7".to_string()));
//! assert_eq!(query[2], ("filter".to_string(), "app/by_type".to_string()));
//! ```

mod headers;

pub use headers::*;

use crate::types::Sequence;
use std::collections::BTreeMap;
use std::time::Duration;

/// Protocol constants
pub mod constants {
    /// Path segment of the changes endpoint
    pub const CHANGES_SEGMENT: &str = "_changes";

    /// Query parameter names
    pub mod params {
        /// Feed mode
        pub const FEED: &str = "feed";
        /// Resumption cursor
        pub const SINCE: &str = "since";
        /// Server-side filter function
        pub const FILTER: &str = "filter";
        /// Heartbeat interval in milliseconds
        pub const HEARTBEAT: &str = "heartbeat";
    }

    /// Continuous feed mode value
    pub const FEED_CONTINUOUS: &str = "continuous";

    /// JSON body field used for key-restricted feeds
    pub const KEYS_FIELD: &str = "keys";
}

/// Build the query string pairs for a continuous changes request.
///
/// `feed` and `since` are always first. Pass-through parameters are appended
/// in key order; entries named `feed` or `since` are ignored so they cannot
/// override the session's own values.
pub fn changes_query(
    since: &Sequence,
    filter: Option<&str>,
    heartbeat: Option<Duration>,
    params: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    use constants::params::*;

    let mut query = vec![
        (FEED.to_string(), constants::FEED_CONTINUOUS.to_string()),
        (SINCE.to_string(), since.to_query_value()),
    ];

    if let Some(interval) = heartbeat {
        query.push((HEARTBEAT.to_string(), format_heartbeat(interval)));
    }
    if let Some(filter) = filter {
        query.push((FILTER.to_string(), filter.to_string()));
    }
    for (key, value) in params {
        if key == FEED || key == SINCE {
            tracing::debug!("Ignoring reserved pass-through parameter {}", key);
            continue;
        }
        query.push((key.clone(), value.clone()));
    }

    query
}
