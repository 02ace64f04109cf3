//! Change-feed session and its subscribers.
//!
//! # Module Organization
//!
//! ```text
//! changes/
//! ├── event      - Line → ChangeRecord parser
//! ├── subscriber - Cache / Listener contracts and fan-out
//! ├── session    - ChangeSession state machine
//! └── stream     - Stream adapter over a Listener
//! ```
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ChangeSession`] | Owns the cursor and the running feed |
//! | [`EventParser`] | Lenient change-line parser |
//! | [`Cache`] | Invalidated by document id on every change |
//! | [`Listener`] | Sees every change and the final disconnect |
//! | [`ChangeStream`] | `Stream` of [`FeedEvent`]s |

mod event;
mod session;
mod stream;
mod subscriber;

pub use event::{EventParser, ParserConfig};
pub use session::{ChangeSession, FeedConfig, SessionState, StartOptions, StopHandle};
pub use stream::{ChangeStream, ChannelListener, FeedEvent};
pub use subscriber::{Cache, DisconnectReason, Listener};
