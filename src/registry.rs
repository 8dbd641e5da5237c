//! Authoritative list of remote sessions.
//!
//! The relay pushes full lists and per-session patches; [`SessionRegistry`]
//! is a plain reducer over those updates. The viewing layer filters (hidden
//! sessions, unread markers) on top without mutating it.

use std::collections::HashSet;

use crate::protocol::{Pane, Session, SessionStatus};

/// Id prefix of placeholders inserted while a creation request is in flight.
pub const PENDING_PREFIX: &str = "pending:";

/// One change pushed by the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryUpdate {
    /// Full replacement.
    SessionList(Vec<Session>),
    SessionStatus { id: String, status: SessionStatus },
    /// `panes == None` is the "layout changed, refetch" encoding.
    PaneLayout { id: String, panes: Option<Vec<Pane>> },
}

/// Result of applying a [`RegistryUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Changed,
    Unchanged,
    /// The update only signalled a change; the caller must re-request the
    /// full session list.
    RefetchRequired,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
    revision: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: RegistryUpdate) -> Outcome {
        let outcome = match update {
            RegistryUpdate::SessionList(sessions) => {
                if sessions == self.sessions {
                    Outcome::Unchanged
                } else {
                    self.sessions = sessions;
                    Outcome::Changed
                }
            }
            RegistryUpdate::SessionStatus { id, status } => match self.get_mut(&id) {
                Some(s) if s.status != status => {
                    s.status = status;
                    Outcome::Changed
                }
                _ => Outcome::Unchanged,
            },
            RegistryUpdate::PaneLayout { panes: None, .. } => Outcome::RefetchRequired,
            RegistryUpdate::PaneLayout {
                id,
                panes: Some(panes),
            } => match self.get_mut(&id) {
                Some(s) if s.panes.as_ref() != Some(&panes) => {
                    s.panes = Some(panes);
                    Outcome::Changed
                }
                Some(_) => Outcome::Unchanged,
                None => Outcome::RefetchRequired,
            },
        };
        if outcome == Outcome::Changed {
            self.revision += 1;
        }
        outcome
    }

    /// Insert a placeholder for a session whose creation was just requested.
    ///
    /// It is replaced by the next authoritative [`RegistryUpdate::SessionList`].
    pub fn insert_pending(&mut self, machine_id: &str, name: &str) -> String {
        let id = format!("{PENDING_PREFIX}{machine_id}/{name}");
        if self.get(&id).is_none() {
            self.sessions.push(Session {
                id: id.clone(),
                label: name.to_string(),
                owner_machine_id: machine_id.to_string(),
                status: SessionStatus::Offline,
                panes: None,
            });
            self.revision += 1;
        }
        id
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Sessions not in `hidden`, in relay order.
    pub fn visible<'a>(&'a self, hidden: &'a HashSet<String>) -> impl Iterator<Item = &'a Session> {
        self.sessions.iter().filter(move |s| !hidden.contains(&s.id))
    }

    /// Bumped on every change; cheap "did anything happen" check for views.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
