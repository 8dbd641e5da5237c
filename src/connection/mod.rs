//! Connection manager: one resilient duplex link to the relay.
//!
//! [`ConnectionManager`] owns the physical connection (through a
//! [`Transport`]), the reconnect schedule and the current-session marker, and
//! dispatches every inbound frame to the registry, the pane tracker and the
//! mounted terminal sinks.
//!
//! ```text
//! Disconnected --connect()--> Connecting --opened--> Connected
//!      ^                          |                      |
//!      +-------- closed ----------+---------- closed ----+
//!                (reconnect deadline armed, fires connect())
//! ```
//!
//! The manager is synchronous and does no I/O of its own. The async driver in
//! [`crate::client`] feeds it transport events and fires the reconnect
//! deadline; tests drive it directly with a fake transport.
//!
//! Every physical connection carries a [`ConnectionId`]. Only events for the
//! connection of record may move the state machine; a late `Closed` from a
//! superseded connection is ignored.

pub mod backoff;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::panes::{PaneLayoutTracker, ViewMode};
use crate::protocol::{FileView, InboundFrame, OutboundFrame, Pane, Session, SessionStatus};
use crate::registry::{Outcome, RegistryUpdate, SessionRegistry};
use crate::sink::{SinkKey, SinkMap, TerminalSink};
use crate::snapshot;

pub use backoff::{Backoff, BackoffConfig};
pub use transport::{ConnectionId, Transport, TransportEvent, WsTransport};

/// Largest amount of pane output kept for a pane whose sink isn't mounted yet.
const MAX_PANE_BACKLOG: usize = 1024 * 1024;

/// Connection status, surfaced to the UI as an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StatusChanged(ConnectionState),
    /// The registry changed; carries the full current list.
    SessionsChanged(Vec<Session>),
    LayoutChanged {
        session: String,
        panes: Vec<Pane>,
    },
    ViewModeChanged {
        session: String,
        mode: ViewMode,
    },
    /// Output arrived for a session nobody is rendering.
    ScreenActivity {
        session: String,
    },
    FileView(FileView),
}

/// Identity inputs of the connection: changing either one means reconnecting.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: Url,
    pub token: Option<String>,
    pub backoff: BackoffConfig,
}

/// An armed reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReconnect {
    pub delay: Duration,
    pub due: Instant,
}

type Listener = Box<dyn FnMut(ClientEvent) + Send>;

pub struct ConnectionManager<T: Transport> {
    transport: T,
    url: Url,
    token: Option<String>,
    state: ConnectionState,
    /// The connection of record.
    current: Option<ConnectionId>,
    next_id: u64,
    backoff: Backoff,
    rng: StdRng,
    reconnect: Option<PendingReconnect>,
    current_session: Option<String>,
    registry: SessionRegistry,
    layout: PaneLayoutTracker,
    sinks: SinkMap,
    /// Output for panes of the current session whose sink isn't mounted yet.
    pane_backlog: HashMap<String, String>,
    listener: Option<Listener>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        Self {
            transport,
            url: config.url,
            token: config.token,
            state: ConnectionState::Disconnected,
            current: None,
            next_id: 0,
            backoff: Backoff::new(config.backoff),
            rng: StdRng::from_entropy(),
            reconnect: None,
            current_session: None,
            registry: SessionRegistry::new(),
            layout: PaneLayoutTracker::new(),
            sinks: SinkMap::new(),
            pane_backlog: HashMap::new(),
            listener: None,
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Open a connection unless one is already open or opening.
    ///
    /// Without a token nothing happens: the caller is not signed in.
    pub fn connect(&mut self) {
        if self.current.is_some() {
            return;
        }
        self.cancel_reconnect();
        let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) else {
            warn!("No auth token available, not connecting");
            return;
        };
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", token);

        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.current = Some(id);
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {} (connection {id})", self.url);
        self.transport.open(id, url.as_str());
    }

    /// Drop the current connection (if any) and connect again right away.
    pub fn reconnect_now(&mut self) {
        self.cancel_reconnect();
        if let Some(id) = self.current.take() {
            debug!("Superseding connection {id}");
            self.transport.close(id);
        }
        self.set_state(ConnectionState::Disconnected);
        self.connect();
    }

    /// Replace the auth token. A different token reconnects immediately; no
    /// token disconnects and stays down.
    pub fn set_token(&mut self, token: Option<String>) {
        if self.token == token {
            return;
        }
        self.token = token;
        self.backoff.reset();
        self.reconnect_now();
    }

    /// Close everything. Nothing fires after this returns.
    pub fn shutdown(&mut self) {
        self.cancel_reconnect();
        if let Some(id) = self.current.take() {
            self.transport.close(id);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Connection manager shut down");
    }

    /// Feed one transport event.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened(id) => self.on_open(id),
            TransportEvent::Frame(id, text) => self.on_frame(id, &text),
            TransportEvent::Error(id, e) => self.on_error(id, &e),
            TransportEvent::Closed(id) => self.on_close(id),
        }
    }

    pub fn on_open(&mut self, id: ConnectionId) {
        if self.current != Some(id) {
            debug!("Ignoring open of superseded connection {id}");
            self.transport.close(id);
            return;
        }
        self.backoff.reset();
        self.set_state(ConnectionState::Connected);
        info!("Connected (connection {id})");

        self.send(OutboundFrame::ListSessions);
        if let Some(session) = self.current_session.clone() {
            self.send(OutboundFrame::Register { session });
        }
    }

    pub fn on_frame(&mut self, id: ConnectionId, text: &str) {
        if self.current != Some(id) {
            debug!("Dropping frame from superseded connection {id}");
            return;
        }
        self.handle_frame(text);
    }

    pub fn on_error(&mut self, id: ConnectionId, error: &str) {
        if self.current == Some(id) {
            warn!("Connection {id} error: {error}");
        } else {
            debug!("Error on superseded connection {id}: {error}");
        }
    }

    pub fn on_close(&mut self, id: ConnectionId) {
        self.transport.close(id);
        if self.current != Some(id) {
            debug!("Ignoring close of superseded connection {id}");
            return;
        }
        self.current = None;
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay(&mut self.rng);
        info!(
            "Disconnected, reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            self.backoff.attempts()
        );
        self.reconnect = Some(PendingReconnect {
            delay,
            due: Instant::now() + delay,
        });
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect = None;
    }

    /// When the armed reconnect is due, if any.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect.map(|r| r.due)
    }

    pub fn pending_reconnect(&self) -> Option<PendingReconnect> {
        self.reconnect
    }

    /// Fire the armed reconnect. No-op when nothing is armed.
    pub fn fire_reconnect(&mut self) {
        if self.reconnect.take().is_some() {
            self.connect();
        }
    }

    // ---------------------------------------------------------------------
    // Outbound operations (no-ops unless connected)
    // ---------------------------------------------------------------------

    /// Start viewing `session` and register as its viewer.
    ///
    /// The session is remembered and re-registered after every reconnect.
    pub fn join_session(&mut self, session: &str) {
        if self.current_session.as_deref() != Some(session) {
            self.current_session = Some(session.to_string());
            self.pane_backlog.clear();
            if let Some(mode) = self.layout.set_active_session(Some(session)) {
                self.emit(ClientEvent::ViewModeChanged {
                    session: session.to_string(),
                    mode,
                });
            }
        }
        self.send(OutboundFrame::Register {
            session: session.to_string(),
        });
    }

    /// Stop viewing any session.
    pub fn leave_session(&mut self) {
        self.current_session = None;
        self.pane_backlog.clear();
        self.layout.set_active_session(None);
    }

    pub fn send_keys(&mut self, session: &str, keys: &str, pane: Option<&str>) {
        self.send(OutboundFrame::Keys {
            session: session.to_string(),
            keys: keys.to_string(),
            pane: pane.map(str::to_string),
        });
    }

    pub fn send_resize(&mut self, session: &str, cols: u16, rows: u16, pane: Option<&str>) {
        self.send(OutboundFrame::Resize {
            session: session.to_string(),
            cols,
            rows,
            pane: pane.map(str::to_string),
        });
    }

    /// Ask the relay to start a session; a placeholder shows up in the
    /// registry until the next session list replaces it.
    pub fn create_session(&mut self, machine_id: &str, session_name: &str) {
        let sent = self.send(OutboundFrame::CreateSession {
            machine_id: machine_id.to_string(),
            session_name: session_name.to_string(),
        });
        if sent {
            self.registry.insert_pending(machine_id, session_name);
            self.emit_sessions_changed();
        }
    }

    pub fn kill_session(&mut self, session: &str) {
        self.send(OutboundFrame::KillSession {
            session: session.to_string(),
        });
    }

    pub fn list_sessions(&mut self) {
        self.send(OutboundFrame::ListSessions);
    }

    pub fn request_file_view(&mut self, session: &str, file_path: &str) {
        self.send(OutboundFrame::RequestFileView {
            session: session.to_string(),
            file_path: file_path.to_string(),
        });
    }

    pub fn clear_offline_sessions(&mut self) {
        self.send(OutboundFrame::ClearOfflineSessions);
    }

    fn send(&mut self, frame: OutboundFrame) -> bool {
        let (ConnectionState::Connected, Some(id)) = (self.state, self.current) else {
            trace!("Not connected, dropping outbound {}", frame.kind());
            return false;
        };
        match frame.to_json() {
            Ok(text) => {
                self.transport.send(id, text);
                true
            }
            Err(e) => {
                warn!("Failed to encode outbound {}: {e}", frame.kind());
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // Sinks, listener, view state
    // ---------------------------------------------------------------------

    /// Mount a terminal sink. Pane output buffered while the pane had no sink
    /// is written first.
    pub fn mount_sink(&mut self, key: SinkKey, mut sink: Box<dyn TerminalSink>) {
        if let Some(pane_id) = key.pane.as_deref() {
            if let Some(p) = self.layout.panes(&key.session).iter().find(|p| p.id == pane_id) {
                sink.resize(clamp_u16(p.width), clamp_u16(p.height));
            }
            if self.current_session.as_deref() == Some(key.session.as_str()) {
                if let Some(backlog) = self.pane_backlog.remove(pane_id) {
                    sink.write(&backlog);
                }
            }
        }
        self.sinks.mount(key, sink);
    }

    pub fn unmount_sink(&mut self, key: &SinkKey) -> Option<Box<dyn TerminalSink>> {
        self.sinks.unmount(key)
    }

    /// Install the event listener, replacing any previous one. It is looked up
    /// fresh for every event, so swapping it never touches the connection.
    pub fn set_listener(&mut self, listener: impl FnMut(ClientEvent) + Send + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn clear_listener(&mut self) {
        self.listener = None;
    }

    /// Select a pane of the current session for input routing.
    pub fn select_pane(&mut self, pane: Option<&str>) -> bool {
        self.layout.select_pane(pane)
    }

    pub fn set_view_mode(&mut self, mode: ViewMode) {
        self.layout.set_view_mode(mode);
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.current
    }

    pub fn current_session(&self) -> Option<&str> {
        self.current_session.as_deref()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn layout(&self) -> &PaneLayoutTracker {
        &self.layout
    }

    /// Reconnect attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ---------------------------------------------------------------------
    // Inbound dispatch
    // ---------------------------------------------------------------------

    /// Decode-or-drop: a frame that fails to decode is logged and discarded;
    /// the next frame is processed normally.
    fn handle_frame(&mut self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                trace!("Ignoring unrecognised or incomplete frame");
                return;
            }
            Err(e) => {
                warn!("Dropping frame: {e}");
                return;
            }
        };

        match frame {
            InboundFrame::Screen {
                session,
                pane,
                text,
            } => self.route_screen(session, pane, &text),
            InboundFrame::PaneLayout { session, panes } => self.apply_pane_layout(session, panes),
            InboundFrame::SessionList(sessions) => self.apply_session_list(sessions),
            InboundFrame::SessionStatus { session, status } => {
                self.apply_session_status(session, status);
            }
            InboundFrame::FileView(view) => self.emit(ClientEvent::FileView(view)),
        }
    }

    fn route_screen(&mut self, session: String, pane: Option<String>, text: &str) {
        let rendered = snapshot::rewrite_snapshot(text);
        let key = SinkKey { session, pane };
        if self.sinks.write(&key, &rendered) {
            return;
        }

        let is_current = self.current_session.as_deref() == Some(key.session.as_str());
        match (key.pane, is_current) {
            (Some(pane), true) => {
                let backlog = self.pane_backlog.entry(pane).or_default();
                if rendered.len() > MAX_PANE_BACKLOG {
                    warn!(
                        "Dropping {} byte frame for unmounted pane, over the {MAX_PANE_BACKLOG} byte backlog",
                        rendered.len()
                    );
                    backlog.clear();
                    return;
                }
                if snapshot::is_full_repaint(text) {
                    backlog.clear();
                }
                if backlog.len() + rendered.len() > MAX_PANE_BACKLOG {
                    warn!("Pane backlog over {MAX_PANE_BACKLOG} bytes, discarding it");
                    backlog.clear();
                }
                backlog.push_str(&rendered);
            }
            (None, true) => trace!("No sink mounted for current session {}", key.session),
            (_, false) => self.emit(ClientEvent::ScreenActivity {
                session: key.session,
            }),
        }
    }

    fn apply_pane_layout(&mut self, session: String, panes: Option<Vec<Pane>>) {
        let outcome = self.registry.apply(RegistryUpdate::PaneLayout {
            id: session.clone(),
            panes: panes.clone(),
        });
        match outcome {
            Outcome::Changed => self.emit_sessions_changed(),
            Outcome::RefetchRequired => {
                debug!("Pane layout for {session} needs a session list refetch");
                self.send(OutboundFrame::ListSessions);
            }
            Outcome::Unchanged => {}
        }
        if let Some(panes) = panes {
            self.update_layout(&session, panes);
        }
    }

    fn apply_session_list(&mut self, sessions: Vec<Session>) {
        let layouts: Vec<(String, Vec<Pane>)> = sessions
            .iter()
            .map(|s| (s.id.clone(), s.panes.clone().unwrap_or_default()))
            .collect();
        if self.registry.apply(RegistryUpdate::SessionList(sessions)) == Outcome::Changed {
            self.emit_sessions_changed();
        }
        self.layout
            .retain_sessions(|id| layouts.iter().any(|(known, _)| known == id));
        for (id, panes) in layouts {
            self.update_layout(&id, panes);
        }
    }

    fn apply_session_status(&mut self, session: String, status: SessionStatus) {
        let outcome = self.registry.apply(RegistryUpdate::SessionStatus {
            id: session,
            status,
        });
        if outcome == Outcome::Changed {
            self.emit_sessions_changed();
        }
    }

    fn update_layout(&mut self, session: &str, panes: Vec<Pane>) {
        if self.layout.panes(session) == panes.as_slice() {
            return;
        }
        if self.current_session.as_deref() == Some(session) {
            self.pane_backlog
                .retain(|id, _| panes.iter().any(|p| &p.id == id));
        }
        for p in &panes {
            let key = SinkKey::pane(session, p.id.as_str());
            self.sinks.resize(&key, clamp_u16(p.width), clamp_u16(p.height));
        }

        let mode = self.layout.apply(session, panes.clone());
        self.emit(ClientEvent::LayoutChanged {
            session: session.to_string(),
            panes,
        });
        if let Some(mode) = mode {
            info!("View mode for {session} is now {mode}");
            self.emit(ClientEvent::ViewModeChanged {
                session: session.to_string(),
                mode,
            });
        }
    }

    // ---------------------------------------------------------------------
    // Notifications
    // ---------------------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.emit(ClientEvent::StatusChanged(state));
        }
    }

    fn emit_sessions_changed(&mut self) {
        let sessions = self.registry.sessions().to_vec();
        self.emit(ClientEvent::SessionsChanged(sessions));
    }

    fn emit(&mut self, event: ClientEvent) {
        if let Some(listener) = self.listener.as_mut() {
            listener(event);
        }
    }
}

impl<T: Transport> fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.url.as_str())
            .field("state", &self.state)
            .field("current", &self.current)
            .field("attempts", &self.backoff.attempts())
            .field("current_session", &self.current_session)
            .field("sinks", &self.sinks)
            .finish_non_exhaustive()
    }
}

fn clamp_u16(v: u32) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::{json, Value};

    use super::*;
    use crate::panes::pane;
    use crate::sink::RecordingSink;

    /// Records everything the manager asks of the network.
    #[derive(Default)]
    struct FakeTransport {
        opened: Vec<(ConnectionId, String)>,
        sent: Vec<(ConnectionId, String)>,
        closed: Vec<ConnectionId>,
    }

    impl FakeTransport {
        fn sent_types(&self) -> Vec<String> {
            self.sent
                .iter()
                .map(|(_, text)| {
                    let v: Value = serde_json::from_str(text).unwrap();
                    v["type"].as_str().unwrap().to_string()
                })
                .collect()
        }

        fn last_sent(&self) -> Value {
            serde_json::from_str(&self.sent.last().unwrap().1).unwrap()
        }
    }

    impl Transport for FakeTransport {
        fn open(&mut self, id: ConnectionId, url: &str) {
            self.opened.push((id, url.to_string()));
        }
        fn send(&mut self, id: ConnectionId, text: String) {
            self.sent.push((id, text));
        }
        fn close(&mut self, id: ConnectionId) {
            self.closed.push(id);
        }
    }

    fn manager(token: Option<&str>) -> ConnectionManager<FakeTransport> {
        ConnectionManager::new(
            FakeTransport::default(),
            ConnectionConfig {
                url: Url::parse("ws://relay.test/ws").unwrap(),
                token: token.map(str::to_string),
                backoff: BackoffConfig {
                    jitter: 0.0,
                    ..BackoffConfig::default()
                },
            },
        )
    }

    fn record_events(m: &mut ConnectionManager<FakeTransport>) -> Arc<Mutex<Vec<ClientEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        m.set_listener(move |e| sink.lock().unwrap().push(e));
        events
    }

    fn connected(token: &str) -> (ConnectionManager<FakeTransport>, ConnectionId) {
        let mut m = manager(Some(token));
        m.connect();
        let id = m.connection_id().unwrap();
        m.on_open(id);
        (m, id)
    }

    fn screen(session: &str, text: &str) -> String {
        json!({ "type": "screen", "session": session, "payload": STANDARD.encode(text) })
            .to_string()
    }

    fn pane_layout(session: &str, panes: &[Pane]) -> String {
        json!({
            "type": "paneLayout",
            "session": session,
            "payload": serde_json::to_string(panes).unwrap(),
        })
        .to_string()
    }

    #[test]
    fn no_token_means_no_connection() {
        let mut m = manager(None);
        m.connect();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.transport().opened.is_empty());

        let mut m = manager(Some(""));
        m.connect();
        assert!(m.transport().opened.is_empty());
    }

    #[test]
    fn token_travels_as_query_parameter() {
        let mut m = manager(Some("T"));
        m.connect();
        assert_eq!(m.state(), ConnectionState::Connecting);
        let (_, url) = &m.transport().opened[0];
        assert_eq!(url, "ws://relay.test/ws?token=T");
    }

    #[test]
    fn connect_is_idempotent_while_connecting() {
        let mut m = manager(Some("T"));
        m.connect();
        m.connect();
        assert_eq!(m.transport().opened.len(), 1);
    }

    #[test]
    fn open_requests_sessions_and_rejoins_current_session() {
        let mut m = manager(Some("T"));
        m.join_session("s1");
        assert!(m.transport().sent.is_empty());
        m.connect();
        let id = m.connection_id().unwrap();
        m.on_open(id);
        assert_eq!(m.transport().sent_types(), vec!["listSessions", "register"]);
        assert_eq!(
            m.transport().last_sent(),
            json!({ "type": "register", "role": "viewer", "session": "s1" })
        );
    }

    #[test]
    fn outbound_operations_are_silent_no_ops_when_disconnected() {
        let mut m = manager(Some("T"));
        m.send_keys("s1", "ls\r", None);
        m.send_resize("s1", 80, 24, Some("%1"));
        m.create_session("m1", "work");
        m.kill_session("s1");
        m.request_file_view("s1", "/etc/hosts");
        m.clear_offline_sessions();
        m.list_sessions();
        assert!(m.transport().sent.is_empty());
        assert!(m.registry().sessions().is_empty());
    }

    #[test]
    fn outbound_operations_encode_frames() {
        let (mut m, _) = connected("T");
        m.send_keys("s1", "ls\r", Some("%1"));
        assert_eq!(
            m.transport().last_sent(),
            json!({ "type": "keys", "session": "s1", "payload": "ls\r", "meta": { "pane": "%1" } })
        );
        m.send_resize("s1", 132, 43, None);
        assert_eq!(
            m.transport().last_sent(),
            json!({ "type": "resize", "session": "s1", "meta": { "cols": "132", "rows": "43" } })
        );
        m.request_file_view("s1", "README.md");
        assert_eq!(
            m.transport().last_sent(),
            json!({ "type": "requestFileView", "session": "s1", "meta": { "filePath": "README.md" } })
        );
        m.clear_offline_sessions();
        assert_eq!(m.transport().last_sent(), json!({ "type": "clearOfflineSessions" }));
    }

    #[test]
    fn create_session_inserts_placeholder() {
        let (mut m, _) = connected("T");
        let events = record_events(&mut m);
        m.create_session("m1", "build");
        assert_eq!(
            m.transport().last_sent(),
            json!({ "type": "createSession", "meta": { "machineId": "m1", "sessionName": "build" } })
        );
        assert_eq!(m.registry().sessions()[0].label, "build");
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(ClientEvent::SessionsChanged(_))
        ));
    }

    #[test]
    fn end_to_end_screen_reaches_sink_unchanged() {
        let (mut m, id) = connected("T");
        m.on_frame(
            id,
            &json!({
                "type": "sessionList",
                "sessions": [{ "id": "s1", "label": "work", "machineId": "m1", "status": "online" }],
            })
            .to_string(),
        );
        assert_eq!(m.registry().get("s1").unwrap().label, "work");

        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::session("s1"), Box::new(sink.clone()));
        m.join_session("s1");
        assert_eq!(
            m.transport().last_sent(),
            json!({ "type": "register", "role": "viewer", "session": "s1" })
        );

        m.on_frame(id, &screen("s1", "hello\r\n"));
        assert_eq!(*sink.writes.lock().unwrap(), vec!["hello\r\n".to_string()]);
    }

    #[test]
    fn full_repaint_is_rewritten_before_the_sink() {
        let (mut m, id) = connected("T");
        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::session("s1"), Box::new(sink.clone()));
        m.join_session("s1");
        m.on_frame(id, &screen("s1", "\x1b[2J\x1b[HL1\r\nL2\r\n"));
        let written = sink.joined();
        assert!(!written.contains("\x1b[2J\x1b[H"));
        assert!(written.contains("L1\x1b[K\r\nL2"));
    }

    #[test]
    fn compressed_screen_is_inflated() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let (mut m, id) = connected("T");
        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::session("s1"), Box::new(sink.clone()));
        let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(b"zipped\r\n").unwrap();
        let payload = STANDARD.encode(enc.finish().unwrap());
        m.on_frame(
            id,
            &json!({ "type": "screenGz", "session": "s1", "payload": payload }).to_string(),
        );
        assert_eq!(sink.joined(), "zipped\r\n");
    }

    #[test]
    fn bad_frames_are_dropped_and_processing_continues() {
        let (mut m, id) = connected("T");
        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::session("s1"), Box::new(sink.clone()));
        m.on_frame(id, "{ definitely not json");
        m.on_frame(id, r#"{"type":"screen","session":"s1","payload":"!!!"}"#);
        m.on_frame(id, r#"{"type":"screenGz","session":"s1","payload":"aGVsbG8="}"#);
        m.on_frame(id, r#"{"type":"mystery","session":"s1"}"#);
        m.on_frame(id, &screen("s1", "still alive"));
        assert_eq!(sink.joined(), "still alive");
        assert!(m.is_connected());
    }

    #[test]
    fn pane_layout_flips_active_session_to_layout_view() {
        let (mut m, id) = connected("T");
        let events = record_events(&mut m);
        m.join_session("s1");
        assert_eq!(m.layout().view_mode(), ViewMode::Single);

        let panes = [pane("%0", 0, 0, 40, 24), pane("%1", 0, 41, 39, 24)];
        m.on_frame(id, &pane_layout("s1", &panes));
        assert_eq!(m.layout().view_mode(), ViewMode::Layout);
        assert!(events.lock().unwrap().contains(&ClientEvent::ViewModeChanged {
            session: "s1".into(),
            mode: ViewMode::Layout,
        }));
    }

    #[test]
    fn pane_layout_without_payload_refetches_sessions() {
        let (mut m, id) = connected("T");
        let before = m.transport().sent.len();
        m.on_frame(id, r#"{"type":"paneLayout","session":"s1"}"#);
        assert_eq!(m.transport().sent.len(), before + 1);
        assert_eq!(m.transport().last_sent(), json!({ "type": "listSessions" }));
    }

    #[test]
    fn pane_output_is_buffered_until_its_sink_mounts() {
        let (mut m, id) = connected("T");
        m.join_session("s1");
        let panes = [pane("%0", 0, 0, 40, 24), pane("%1", 0, 41, 39, 24)];
        m.on_frame(id, &pane_layout("s1", &panes));
        let pane_screen = json!({
            "type": "screen", "session": "s1",
            "payload": STANDARD.encode("top\r\n"), "meta": { "pane": "%1" },
        })
        .to_string();
        m.on_frame(id, &pane_screen);

        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::pane("s1", "%1"), Box::new(sink.clone()));
        assert_eq!(sink.joined(), "top\r\n");
        assert_eq!(*sink.sizes.lock().unwrap(), vec![(39, 24)]);
    }

    fn pane_screen(session: &str, pane: &str, text: &str) -> String {
        json!({
            "type": "screen", "session": session,
            "payload": STANDARD.encode(text), "meta": { "pane": pane },
        })
        .to_string()
    }

    #[test]
    fn oversized_pane_frame_is_not_buffered() {
        let (mut m, id) = connected("T");
        m.join_session("s1");
        m.on_frame(id, &pane_screen("s1", "%1", "early"));
        m.on_frame(id, &pane_screen("s1", "%1", &"x".repeat(MAX_PANE_BACKLOG + 1)));

        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::pane("s1", "%1"), Box::new(sink.clone()));
        assert_eq!(sink.joined(), "");
    }

    #[test]
    fn pane_backlog_keeps_frames_after_an_oversized_one() {
        let (mut m, id) = connected("T");
        m.join_session("s1");
        m.on_frame(id, &pane_screen("s1", "%1", &"x".repeat(MAX_PANE_BACKLOG + 1)));
        m.on_frame(id, &pane_screen("s1", "%1", "after"));

        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::pane("s1", "%1"), Box::new(sink.clone()));
        assert_eq!(sink.joined(), "after");
    }

    #[test]
    fn pane_backlog_stays_under_the_cap() {
        let (mut m, id) = connected("T");
        m.join_session("s1");
        let chunk = "y".repeat(MAX_PANE_BACKLOG / 2 + 1);
        m.on_frame(id, &pane_screen("s1", "%1", &chunk));
        m.on_frame(id, &pane_screen("s1", "%1", &chunk));

        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::pane("s1", "%1"), Box::new(sink.clone()));
        assert_eq!(sink.joined(), chunk);
    }

    #[test]
    fn null_meta_screen_reaches_primary_sink() {
        let (mut m, id) = connected("T");
        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::session("s1"), Box::new(sink.clone()));
        m.join_session("s1");
        m.on_frame(id, r#"{"type":"screen","session":"s1","payload":"aGk=","meta":null}"#);
        assert_eq!(sink.joined(), "hi");
    }

    #[test]
    fn resize_for_a_pane_carries_pane_meta() {
        let (mut m, _) = connected("T");
        m.send_resize("s1", 132, 43, Some("%1"));
        assert_eq!(
            m.transport().last_sent(),
            json!({
                "type": "resize",
                "session": "s1",
                "meta": { "cols": "132", "rows": "43", "pane": "%1" },
            })
        );
    }

    #[test]
    fn switching_sessions_discards_pane_backlog() {
        let (mut m, id) = connected("T");
        m.join_session("s1");
        let pane_screen = json!({
            "type": "screen", "session": "s1",
            "payload": STANDARD.encode("stale"), "meta": { "pane": "%1" },
        })
        .to_string();
        m.on_frame(id, &pane_screen);
        m.join_session("s2");
        m.join_session("s1");

        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::pane("s1", "%1"), Box::new(sink.clone()));
        assert_eq!(sink.joined(), "");
    }

    #[test]
    fn background_output_raises_activity() {
        let (mut m, id) = connected("T");
        let events = record_events(&mut m);
        m.join_session("s1");
        m.on_frame(id, &screen("s2", "ping"));
        assert!(events.lock().unwrap().contains(&ClientEvent::ScreenActivity {
            session: "s2".into()
        }));
    }

    #[test]
    fn session_status_patches_registry() {
        let (mut m, id) = connected("T");
        m.on_frame(
            id,
            &json!({
                "type": "sessionList",
                "sessions": [{ "id": "s1", "label": "work", "machineId": "m1", "status": "online" }],
            })
            .to_string(),
        );
        m.on_frame(id, r#"{"type":"sessionStatus","session":"s1","status":"offline"}"#);
        assert_eq!(m.registry().get("s1").unwrap().status, SessionStatus::Offline);
    }

    #[test]
    fn file_view_surfaces_as_event() {
        let (mut m, id) = connected("T");
        let events = record_events(&mut m);
        m.on_frame(
            id,
            &json!({
                "type": "file_view", "session": "s1",
                "payload": STANDARD.encode("fn main() {}\n"),
                "meta": { "filePath": "src/main.rs" },
            })
            .to_string(),
        );
        let events = events.lock().unwrap();
        let Some(ClientEvent::FileView(view)) = events.last() else {
            panic!("expected a file view event");
        };
        assert_eq!(view.content_type, "text/x-rust");
    }

    #[test]
    fn close_schedules_reconnect_with_backoff() {
        let (mut m, id) = connected("T");
        m.on_close(id);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.pending_reconnect().unwrap().delay, Duration::from_secs(1));

        m.fire_reconnect();
        let second = m.connection_id().unwrap();
        assert_ne!(second, id);
        m.on_close(second); // failed before opening
        assert_eq!(m.pending_reconnect().unwrap().delay, Duration::from_secs(2));

        m.fire_reconnect();
        let third = m.connection_id().unwrap();
        m.on_close(third);
        assert_eq!(m.pending_reconnect().unwrap().delay, Duration::from_secs(4));
    }

    #[test]
    fn successful_open_resets_backoff() {
        let (mut m, id) = connected("T");
        m.on_close(id);
        for _ in 0..3 {
            m.fire_reconnect();
            let failed = m.connection_id().unwrap();
            m.on_close(failed);
        }
        assert_eq!(m.attempts(), 4);
        assert_eq!(m.pending_reconnect().unwrap().delay, Duration::from_secs(8));

        m.fire_reconnect();
        let good = m.connection_id().unwrap();
        m.on_open(good);
        assert_eq!(m.attempts(), 0);
        m.on_close(good);
        assert_eq!(m.pending_reconnect().unwrap().delay, Duration::from_secs(1));
    }

    #[test]
    fn late_close_of_superseded_connection_is_ignored() {
        let (mut m, a) = connected("T");
        m.on_close(a);
        m.fire_reconnect();
        let b = m.connection_id().unwrap();
        m.on_open(b);
        assert!(m.is_connected());

        let events = record_events(&mut m);
        m.on_close(a);
        assert!(m.is_connected());
        assert_eq!(m.connection_id(), Some(b));
        assert!(m.pending_reconnect().is_none());
        assert_eq!(m.attempts(), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn superseding_reconnect_ignores_old_events() {
        let (mut m, a) = connected("T");
        m.reconnect_now();
        let b = m.connection_id().unwrap();
        assert_ne!(a, b);
        assert!(m.transport().closed.contains(&a));

        // A's frames and close trickle in after B was opened.
        m.on_open(b);
        let sink = RecordingSink::default();
        m.mount_sink(SinkKey::session("s1"), Box::new(sink.clone()));
        m.on_frame(a, &screen("s1", "from A"));
        m.on_close(a);
        assert!(m.is_connected());
        assert!(m.pending_reconnect().is_none());
        assert_eq!(sink.joined(), "");
    }

    #[test]
    fn late_open_of_superseded_connection_is_closed() {
        let mut m = manager(Some("T"));
        m.connect();
        let a = m.connection_id().unwrap();
        m.reconnect_now();
        m.on_open(a);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(m.transport().sent.is_empty());
    }

    #[test]
    fn shutdown_cancels_reconnect_and_closes_transport() {
        let (mut m, a) = connected("T");
        m.on_close(a);
        assert!(m.reconnect_deadline().is_some());
        m.shutdown();
        assert!(m.reconnect_deadline().is_none());
        m.fire_reconnect();
        assert_eq!(m.transport().opened.len(), 1);

        let (mut m, b) = connected("T");
        m.shutdown();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.transport().closed.contains(&b));
        // close event arriving after teardown does not re-arm anything
        m.on_close(b);
        assert!(m.reconnect_deadline().is_none());
    }

    #[test]
    fn token_change_reconnects_and_token_loss_disconnects() {
        let (mut m, a) = connected("T");
        m.set_token(Some("U".into()));
        assert!(m.transport().closed.contains(&a));
        assert_eq!(m.transport().opened.last().unwrap().1, "ws://relay.test/ws?token=U");

        m.set_token(None);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.connection_id().is_none());
        assert!(m.reconnect_deadline().is_none());
    }

    #[test]
    fn listener_replacement_takes_effect_immediately() {
        let (mut m, id) = connected("T");
        let first = record_events(&mut m);
        m.on_frame(id, &screen("s9", "x"));
        let second = record_events(&mut m);
        m.on_frame(id, &screen("s9", "y"));
        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn status_changes_are_reported() {
        let mut m = manager(Some("T"));
        let events = record_events(&mut m);
        m.connect();
        let id = m.connection_id().unwrap();
        m.on_open(id);
        m.on_close(id);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ClientEvent::StatusChanged(ConnectionState::Connecting),
                ClientEvent::StatusChanged(ConnectionState::Connected),
                ClientEvent::StatusChanged(ConnectionState::Disconnected),
            ]
        );
    }
}
