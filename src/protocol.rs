//! Relay wire protocol.
//!
//! Every WebSocket text frame is one JSON [`Envelope`]. The `type` field
//! decides which of the other fields matter, so envelopes are converted into
//! typed frames at the boundary and nothing past this module looks at raw
//! optional fields.
//!
//! ## Message types (relay → client)
//!
//! | Type            | Fields used                                          |
//! |-----------------|------------------------------------------------------|
//! | `screen`        | `session`, `payload` (base64), `meta.pane?`          |
//! | `screenGz`      | `session`, `payload` (base64 gzip), `meta.pane?`     |
//! | `sessionList`   | `sessions[]`                                         |
//! | `sessionStatus` | `session`, `status` (`online` / `offline`)           |
//! | `paneLayout`    | `session`, `payload?` (JSON pane array)              |
//! | `file_view`     | `session?`, `payload`, `meta.filePath`, `meta.contentType?`, `meta.language?` |
//!
//! ## Message types (client → relay)
//!
//! | Type                   | Fields                                         |
//! |------------------------|------------------------------------------------|
//! | `listSessions`         | —                                              |
//! | `register`             | `role` = `viewer`, `session`                   |
//! | `keys`                 | `session`, `payload` (raw input), `meta.pane?` |
//! | `resize`               | `session`, `meta.cols`, `meta.rows`, `meta.pane?` |
//! | `createSession`        | `meta.machineId`, `meta.sessionName`           |
//! | `killSession`          | `session`                                      |
//! | `requestFileView`      | `session`, `meta.filePath`                     |
//! | `clearOfflineSessions` | —                                              |

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::codec::{self, DecodeError};

/// Liveness of a remote session as reported by the relay.
///
/// Statuses this client doesn't know (`starting`, `sleeping`, ...) read as
/// offline so one odd entry can't fail a whole session list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum SessionStatus {
    Online,
    Offline,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    /// Parse the wire spelling; anything else is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

impl From<String> for SessionStatus {
    fn from(s: String) -> Self {
        Self::parse(&s).unwrap_or(Self::Offline)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rectangular sub-terminal of a multiplexed session.
///
/// Geometry is in grid cells relative to the whole layout's bounding box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pane {
    pub id: String,
    #[serde(default)]
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub top: u32,
    pub left: u32,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub title: String,
}

/// A remote terminal (or multiplexed terminal group) tracked by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "machineId", default)]
    pub owner_machine_id: String,
    pub status: SessionStatus,
    /// Present only for multiplexed sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panes: Option<Vec<Pane>>,
}

impl Session {
    /// Number of panes, treating a plain terminal as zero.
    pub fn pane_count(&self) -> usize {
        self.panes.as_ref().map_or(0, Vec::len)
    }
}

/// The raw JSON object carried by every frame, in both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<Session>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Envelope {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    /// Non-empty `meta` value.
    fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str).filter(|s| !s.is_empty())
    }
}

/// Why an inbound frame was dropped.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("undecodable {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: DecodeError,
    },
    #[error("invalid pane layout: {0}")]
    PaneLayout(#[source] serde_json::Error),
}

/// Body of a `file_view` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    /// Decoded UTF-8 text.
    Text(String),
    /// Image bytes, still base64-encoded as received.
    Base64(String),
}

/// Out-of-band file contents pushed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileView {
    pub session: Option<String>,
    pub path: String,
    pub filename: String,
    pub content_type: String,
    pub content: FileContent,
}

/// A decoded relay → client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Terminal output, already decoded (and inflated for `screenGz`).
    Screen {
        session: String,
        pane: Option<String>,
        text: String,
    },
    /// New pane layout. `panes == None` means "refetch the session list".
    PaneLayout {
        session: String,
        panes: Option<Vec<Pane>>,
    },
    SessionList(Vec<Session>),
    SessionStatus {
        session: String,
        status: SessionStatus,
    },
    FileView(FileView),
}

impl InboundFrame {
    /// Decode one text frame.
    ///
    /// `Ok(None)` means the frame is well-formed JSON but not something this
    /// client acts on (unknown type, missing required fields).
    pub fn parse(text: &str) -> Result<Option<Self>, FrameError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(mut env: Envelope) -> Result<Option<Self>, FrameError> {
        let frame = match env.kind.as_str() {
            "screen" | "screenGz" => {
                let compressed = env.kind == "screenGz";
                let pane = env.meta_str("pane").map(str::to_string);
                let (Some(session), Some(payload)) = (non_empty(env.session), non_empty(env.payload))
                else {
                    return Ok(None);
                };
                let decoded = if compressed {
                    codec::decode_compressed(&payload)
                } else {
                    codec::decode_plain(&payload)
                };
                let text = decoded.map_err(|source| FrameError::Payload {
                    kind: if compressed { "screenGz" } else { "screen" },
                    source,
                })?;
                Self::Screen {
                    session,
                    pane,
                    text,
                }
            }
            "paneLayout" => {
                let Some(session) = non_empty(env.session) else {
                    return Ok(None);
                };
                let panes = match non_empty(env.payload) {
                    Some(json) => {
                        Some(serde_json::from_str(&json).map_err(FrameError::PaneLayout)?)
                    }
                    None => None,
                };
                Self::PaneLayout { session, panes }
            }
            "sessionList" => match env.sessions.take() {
                Some(sessions) => Self::SessionList(sessions),
                None => return Ok(None),
            },
            "sessionStatus" => {
                let status = env.status.as_deref().and_then(SessionStatus::parse);
                let (Some(session), Some(status)) = (non_empty(env.session), status) else {
                    return Ok(None);
                };
                Self::SessionStatus { session, status }
            }
            "file_view" => {
                let path = env
                    .meta_str("filePath")
                    .or_else(|| env.meta_str("filename"))
                    .map(str::to_string);
                let (Some(path), Some(payload)) = (path, env.payload.take()) else {
                    return Ok(None);
                };
                let filename = path.rsplit('/').next().unwrap_or(&path).to_string();
                let content_type = match env.meta_str("contentType") {
                    Some(ty) => ty.to_string(),
                    None => {
                        codec::classify_file_content_type(&filename, env.meta_str("language"))
                            .to_string()
                    }
                };
                let content = if codec::is_image(&content_type) {
                    FileContent::Base64(payload)
                } else {
                    FileContent::Text(codec::decode_plain(&payload).map_err(|source| {
                        FrameError::Payload {
                            kind: "file_view",
                            source,
                        }
                    })?)
                };
                Self::FileView(FileView {
                    session: non_empty(env.session),
                    path,
                    filename,
                    content_type,
                    content,
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(frame))
    }
}

/// Relays that serialize a nil map send `"meta": null`.
fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, String>, D::Error> {
    Option::<BTreeMap<String, String>>::deserialize(d).map(Option::unwrap_or_default)
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

/// A client → relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    ListSessions,
    /// Join a session as a viewer.
    Register { session: String },
    Keys {
        session: String,
        keys: String,
        pane: Option<String>,
    },
    Resize {
        session: String,
        cols: u16,
        rows: u16,
        pane: Option<String>,
    },
    CreateSession {
        machine_id: String,
        session_name: String,
    },
    KillSession { session: String },
    RequestFileView { session: String, file_path: String },
    ClearOfflineSessions,
}

impl OutboundFrame {
    /// Wire `type` of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListSessions => "listSessions",
            Self::Register { .. } => "register",
            Self::Keys { .. } => "keys",
            Self::Resize { .. } => "resize",
            Self::CreateSession { .. } => "createSession",
            Self::KillSession { .. } => "killSession",
            Self::RequestFileView { .. } => "requestFileView",
            Self::ClearOfflineSessions => "clearOfflineSessions",
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut env = Envelope::new(self.kind());
        match self {
            Self::ListSessions | Self::ClearOfflineSessions => {}
            Self::Register { session } => {
                env.role = Some("viewer".to_string());
                env.session = Some(session.clone());
            }
            Self::Keys {
                session,
                keys,
                pane,
            } => {
                env.session = Some(session.clone());
                env.payload = Some(keys.clone());
                if let Some(p) = pane {
                    env.meta.insert("pane".into(), p.clone());
                }
            }
            Self::Resize {
                session,
                cols,
                rows,
                pane,
            } => {
                env.session = Some(session.clone());
                env.meta.insert("cols".into(), cols.to_string());
                env.meta.insert("rows".into(), rows.to_string());
                if let Some(p) = pane {
                    env.meta.insert("pane".into(), p.clone());
                }
            }
            Self::CreateSession {
                machine_id,
                session_name,
            } => {
                env.meta.insert("machineId".into(), machine_id.clone());
                env.meta.insert("sessionName".into(), session_name.clone());
            }
            Self::KillSession { session } => {
                env.session = Some(session.clone());
            }
            Self::RequestFileView { session, file_path } => {
                env.session = Some(session.clone());
                env.meta.insert("filePath".into(), file_path.clone());
            }
        }
        env
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope())
    }
}
