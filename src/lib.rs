#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

//! castview library — the session-streaming core behind the `castview` CLI.
//!
//! Building blocks:
//! - `codec` — base64 / gzip payload decoding, file content-type table
//! - `snapshot` — full-repaint rewriting so snapshots draw in place
//! - `protocol` — wire envelope and the typed inbound/outbound frames
//! - `panes` — pane layout tracking and view-mode recommendation
//! - `registry` — authoritative remote session list
//! - `sink` — terminal sink trait and the `(session, pane)` sink map
//! - `connection` — connection manager, backoff, WebSocket transport
//! - `client` — async driver task and the command handle used by frontends
//! - `term` — local terminal helpers (raw mode, stdout sink, window size)
//! - `auth` — bearer token inspection
//! - `config` — configuration loading

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod panes;
pub mod protocol;
pub mod registry;
pub mod sink;
pub mod snapshot;
pub mod term;
pub mod util;

// Re-export key types at crate root for convenience.
pub use client::{ClientEvent, ClientHandle};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState};
pub use panes::{PaneLayoutTracker, ViewMode};
pub use protocol::{Pane, Session, SessionStatus};
pub use registry::SessionRegistry;
pub use sink::{SinkKey, TerminalSink};
