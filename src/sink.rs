//! Terminal sinks: where decoded screen output ends up.
//!
//! Whatever mounts a terminal view registers a [`TerminalSink`] under a
//! [`SinkKey`] and removes it on unmount. There is no global "current
//! writer"; frames are routed by `(session, pane)`.

use std::collections::HashMap;

/// Something that renders terminal output.
pub trait TerminalSink: Send {
    fn write(&mut self, text: &str);

    /// Called when the viewer's grid size changes. Optional.
    fn resize(&mut self, _cols: u16, _rows: u16) {}
}

/// Routing key for a sink: a whole session, or one pane of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SinkKey {
    pub session: String,
    pub pane: Option<String>,
}

impl SinkKey {
    /// The primary sink of a session without panes.
    pub fn session(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            pane: None,
        }
    }

    pub fn pane(session: impl Into<String>, pane: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            pane: Some(pane.into()),
        }
    }
}

/// Mounted sinks, keyed by [`SinkKey`].
#[derive(Default)]
pub struct SinkMap {
    sinks: HashMap<SinkKey, Box<dyn TerminalSink>>,
}

impl SinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a sink, replacing any previous one under the same key.
    pub fn mount(&mut self, key: SinkKey, sink: Box<dyn TerminalSink>) {
        self.sinks.insert(key, sink);
    }

    pub fn unmount(&mut self, key: &SinkKey) -> Option<Box<dyn TerminalSink>> {
        self.sinks.remove(key)
    }

    pub fn contains(&self, key: &SinkKey) -> bool {
        self.sinks.contains_key(key)
    }

    /// Write to the sink under `key`. Returns `false` when none is mounted.
    pub fn write(&mut self, key: &SinkKey, text: &str) -> bool {
        match self.sinks.get_mut(key) {
            Some(sink) => {
                sink.write(text);
                true
            }
            None => false,
        }
    }

    /// Resize the sink under `key`. Returns `false` when none is mounted.
    pub fn resize(&mut self, key: &SinkKey, cols: u16, rows: u16) -> bool {
        match self.sinks.get_mut(key) {
            Some(sink) => {
                sink.resize(cols, rows);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for SinkMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkMap")
            .field("keys", &self.sinks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Sink that appends everything to a shared buffer. Used by tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    pub writes: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    pub sizes: std::sync::Arc<std::sync::Mutex<Vec<(u16, u16)>>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn joined(&self) -> String {
        self.writes.lock().unwrap().concat()
    }
}

#[cfg(test)]
impl TerminalSink for RecordingSink {
    fn write(&mut self, text: &str) {
        self.writes.lock().unwrap().push(text.to_string());
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.sizes.lock().unwrap().push((cols, rows));
    }
}
