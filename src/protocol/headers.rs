//! Header and parameter formatting for feed requests.
//!
//! # Formats
//!
//! | Value | Format | Example |
//! |-------|--------|---------|
//! | Authorization | `Basic base64(user:password)` | `Basic YWRtaW46c2VjcmV0` |
//! | Heartbeat | Milliseconds, integer | `10000` |
//!
//! # Examples
//!
//! ```
//! use couch_feed::protocol::{basic_auth_header, format_heartbeat, parse_heartbeat};
//! use std::time::Duration;
//!
//! assert_eq!(basic_auth_header("admin", "secret"), "Basic YWRtaW46c2VjcmV0");
//! assert_eq!(format_heartbeat(Duration::from_secs(5)), "5000");
//! assert_eq!(parse_heartbeat("5s").unwrap(), Duration::from_secs(5));
//! ```

use crate::error::{FeedError, Result};
use base64::Engine;
use std::time::Duration;

/// Format an HTTP Basic `Authorization` header value.
///
/// # Examples
///
/// ```
/// use couch_feed::protocol::basic_auth_header;
///
/// assert_eq!(basic_auth_header("admin", ""), "Basic YWRtaW46");
/// ```
pub fn basic_auth_header(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(credentials)
    )
}

/// Format a heartbeat interval as the millisecond value the server expects.
#[inline]
pub fn format_heartbeat(interval: Duration) -> String {
    interval.as_millis().to_string()
}

/// Parse a human-written heartbeat interval.
///
/// # Supported Formats
///
/// | Format | Example | Result |
/// |--------|---------|--------|
/// | Milliseconds | `"500ms"` | 500 ms |
/// | Seconds with suffix | `"5s"` | 5 s |
/// | Plain number | `"30000"` | 30 000 ms |
///
/// A plain number is read as milliseconds, matching the `heartbeat` query
/// parameter.
///
/// # Errors
///
/// Returns [`FeedError::Config`] if the value cannot be parsed as a number.
pub fn parse_heartbeat(value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    let invalid = || FeedError::Config(format!("Invalid heartbeat: {}", value));

    if let Some(ms_str) = trimmed.strip_suffix("ms") {
        return ms_str.parse().map(Duration::from_millis).map_err(|_| invalid());
    }

    if let Some(s_str) = trimmed.strip_suffix('s') {
        return s_str.parse().map(Duration::from_secs).map_err(|_| invalid());
    }

    trimmed.parse().map(Duration::from_millis).map_err(|_| invalid())
}
