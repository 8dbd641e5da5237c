//! Physical connections.
//!
//! The [`ConnectionManager`](super::ConnectionManager) talks to the network
//! only through [`Transport`]. Every connection it opens gets a fresh
//! [`ConnectionId`], and everything the transport reports back is tagged with
//! that id so events from superseded connections can be told apart.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Identity of one physical connection, assigned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something the transport observed on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened(ConnectionId),
    Frame(ConnectionId, String),
    /// Informational; a `Closed` always follows for the same id.
    Error(ConnectionId, String),
    Closed(ConnectionId),
}

/// Opens, writes to, and closes physical connections.
pub trait Transport {
    /// Start opening `url`. Completion is reported asynchronously.
    fn open(&mut self, id: ConnectionId, url: &str);

    /// Queue a text frame. Unknown or closed ids are ignored.
    fn send(&mut self, id: ConnectionId, text: String);

    /// Tear the connection down immediately. Idempotent.
    fn close(&mut self, id: ConnectionId);
}

/// [`Transport`] over `tokio-tungstenite`, one task per connection.
///
/// Closing an open connection drops its outgoing queue: the task flushes
/// whatever was already queued, sends a close frame and exits. A connection
/// still dialing is aborted on the spot. Dropping the transport closes every
/// connection the same way.
pub struct WsTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    conns: HashMap<ConnectionId, WsConn>,
}

struct WsConn {
    outgoing: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
    /// Set by the task once the handshake completes.
    opened: Arc<AtomicBool>,
}

impl WsConn {
    fn release(self, id: ConnectionId) {
        if self.opened.load(Ordering::Acquire) {
            debug!("transport: connection {id} released");
        } else {
            debug!("transport: connection {id} aborted while connecting");
            self.task.abort();
        }
    }
}

impl WsTransport {
    /// Events for every connection are delivered on `events`.
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            conns: HashMap::new(),
        }
    }
}

impl Transport for WsTransport {
    fn open(&mut self, id: ConnectionId, url: &str) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let opened = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(connection_task(
            id,
            url.to_string(),
            out_rx,
            self.events.clone(),
            Arc::clone(&opened),
        ));
        let conn = WsConn {
            outgoing: out_tx,
            task,
            opened,
        };
        if let Some(old) = self.conns.insert(id, conn) {
            old.release(id);
        }
    }

    fn send(&mut self, id: ConnectionId, text: String) {
        if let Some(conn) = self.conns.get(&id) {
            let _ = conn.outgoing.send(text);
        }
    }

    fn close(&mut self, id: ConnectionId) {
        if let Some(conn) = self.conns.remove(&id) {
            conn.release(id);
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for (id, conn) in self.conns.drain() {
            conn.release(id);
        }
    }
}

/// Connect, then pump frames both ways until either side goes away.
async fn connection_task(
    id: ConnectionId,
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    opened: Arc<AtomicBool>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let _ = events.send(TransportEvent::Error(id, e.to_string()));
            let _ = events.send(TransportEvent::Closed(id));
            return;
        }
    };
    opened.store(true, Ordering::Release);
    let _ = events.send(TransportEvent::Opened(id));

    let (mut ws_sink, mut ws_reader) = ws_stream.split();
    loop {
        tokio::select! {
            msg = ws_reader.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Frame(id, text.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error(id, e.to_string()));
                    break;
                }
                _ => {} // Binary/Ping/Pong — ignore
            },
            out = outgoing.recv() => match out {
                Some(text) => {
                    if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                        let _ = events.send(TransportEvent::Error(id, e.to_string()));
                        break;
                    }
                }
                None => {
                    // Owner dropped the sender: close politely.
                    let _ = ws_sink.close().await;
                    break;
                }
            },
        }
    }
    let _ = events.send(TransportEvent::Closed(id));
}
