//! Async driver around [`ConnectionManager`].
//!
//! [`spawn`] starts one task that owns the manager and a [`WsTransport`], and
//! multiplexes three inputs with `tokio::select!`:
//!
//! - transport events (open / frame / error / close, tagged by connection id)
//! - commands from any number of cloned [`ClientHandle`]s
//! - the armed reconnect deadline, if any
//!
//! Notifications leave through the [`ClientEvent`] receiver returned by
//! [`spawn`]. Dropping every handle shuts the task down.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState, WsTransport};
use crate::panes::ViewMode;
use crate::protocol::Session;
use crate::sink::{SinkKey, TerminalSink};

pub use crate::connection::ClientEvent;

/// Point-in-time view of the driver's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub sessions: Vec<Session>,
    pub current_session: Option<String>,
    /// Pane input should go to in the current session.
    pub focused_pane: Option<String>,
    pub view_mode: ViewMode,
}

enum Command {
    Join(String),
    Leave,
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
    KillSession(String),
    ListSessions,
    RequestFileView {
        session: String,
        file_path: String,
    },
    ClearOfflineSessions,
    MountSink(SinkKey, Box<dyn TerminalSink>),
    UnmountSink(SinkKey),
    SelectPane(Option<String>),
    SetViewMode(ViewMode),
    SetToken(Option<String>),
    Reconnect,
    Status(oneshot::Sender<ClientStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable command handle for a running client task.
///
/// Every method is fire-and-forget; operations that need a live connection
/// are silently dropped while disconnected.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            debug!("Client task has exited, dropping command");
        }
    }

    pub fn join_session(&self, session: &str) {
        self.send(Command::Join(session.to_string()));
    }

    pub fn leave_session(&self) {
        self.send(Command::Leave);
    }

    pub fn send_keys(&self, session: &str, keys: &str, pane: Option<&str>) {
        self.send(Command::Keys {
            session: session.to_string(),
            keys: keys.to_string(),
            pane: pane.map(str::to_string),
        });
    }

    pub fn send_resize(&self, session: &str, cols: u16, rows: u16, pane: Option<&str>) {
        self.send(Command::Resize {
            session: session.to_string(),
            cols,
            rows,
            pane: pane.map(str::to_string),
        });
    }

    pub fn create_session(&self, machine_id: &str, session_name: &str) {
        self.send(Command::CreateSession {
            machine_id: machine_id.to_string(),
            session_name: session_name.to_string(),
        });
    }

    pub fn kill_session(&self, session: &str) {
        self.send(Command::KillSession(session.to_string()));
    }

    pub fn list_sessions(&self) {
        self.send(Command::ListSessions);
    }

    pub fn request_file_view(&self, session: &str, file_path: &str) {
        self.send(Command::RequestFileView {
            session: session.to_string(),
            file_path: file_path.to_string(),
        });
    }

    pub fn clear_offline_sessions(&self) {
        self.send(Command::ClearOfflineSessions);
    }

    pub fn mount_sink(&self, key: SinkKey, sink: Box<dyn TerminalSink>) {
        self.send(Command::MountSink(key, sink));
    }

    pub fn unmount_sink(&self, key: SinkKey) {
        self.send(Command::UnmountSink(key));
    }

    pub fn select_pane(&self, pane: Option<&str>) {
        self.send(Command::SelectPane(pane.map(str::to_string)));
    }

    pub fn set_view_mode(&self, mode: ViewMode) {
        self.send(Command::SetViewMode(mode));
    }

    /// Swap the auth token; the connection is re-established with it.
    pub fn set_token(&self, token: Option<String>) {
        self.send(Command::SetToken(token));
    }

    /// Drop the current connection and connect again without waiting.
    pub fn reconnect_now(&self) {
        self.send(Command::Reconnect);
    }

    /// `None` once the task has exited.
    pub async fn status(&self) -> Option<ClientStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx));
        rx.await.ok()
    }

    /// Close the connection and stop the task. Returns once it is down.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx));
        let _ = rx.await;
    }
}

/// Start a client task and begin connecting.
pub fn spawn(
    config: ConnectionConfig,
) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(config, cmd_rx, event_tx));
    (ClientHandle { tx: cmd_tx }, event_rx, task)
}

async fn run(
    config: ConnectionConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
    let mut manager = ConnectionManager::new(WsTransport::new(transport_tx), config);
    manager.set_listener(move |event| {
        let _ = events.send(event);
    });
    manager.connect();

    loop {
        let deadline = manager.reconnect_deadline();
        tokio::select! {
            Some(event) = transport_rx.recv() => manager.handle_transport_event(event),
            cmd = commands.recv() => match cmd {
                Some(cmd) => {
                    if !apply(&mut manager, cmd) {
                        break;
                    }
                }
                None => {
                    manager.shutdown();
                    break;
                }
            },
            () = wait_until(deadline) => manager.fire_reconnect(),
        }
    }
    info!("Client task stopped");
}

async fn wait_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Returns `false` once the task should stop.
fn apply(manager: &mut ConnectionManager<WsTransport>, cmd: Command) -> bool {
    match cmd {
        Command::Join(session) => manager.join_session(&session),
        Command::Leave => manager.leave_session(),
        Command::Keys {
            session,
            keys,
            pane,
        } => manager.send_keys(&session, &keys, pane.as_deref()),
        Command::Resize {
            session,
            cols,
            rows,
            pane,
        } => manager.send_resize(&session, cols, rows, pane.as_deref()),
        Command::CreateSession {
            machine_id,
            session_name,
        } => manager.create_session(&machine_id, &session_name),
        Command::KillSession(session) => manager.kill_session(&session),
        Command::ListSessions => manager.list_sessions(),
        Command::RequestFileView { session, file_path } => {
            manager.request_file_view(&session, &file_path);
        }
        Command::ClearOfflineSessions => manager.clear_offline_sessions(),
        Command::MountSink(key, sink) => manager.mount_sink(key, sink),
        Command::UnmountSink(key) => {
            manager.unmount_sink(&key);
        }
        Command::SelectPane(pane) => {
            manager.select_pane(pane.as_deref());
        }
        Command::SetViewMode(mode) => manager.set_view_mode(mode),
        Command::SetToken(token) => manager.set_token(token),
        Command::Reconnect => manager.reconnect_now(),
        Command::Status(reply) => {
            let layout = manager.layout();
            let _ = reply.send(ClientStatus {
                state: manager.state(),
                sessions: manager.registry().sessions().to_vec(),
                current_session: manager.current_session().map(str::to_string),
                focused_pane: layout.focused_pane().map(|p| p.id.clone()),
                view_mode: layout.view_mode(),
            });
        }
        Command::Shutdown(done) => {
            manager.shutdown();
            let _ = done.send(());
            return false;
        }
    }
    true
}
