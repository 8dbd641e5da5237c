//! Pane layout tracking for multiplexed sessions.
//!
//! [`PaneLayoutTracker`] stores the latest pane list per session and, for the
//! session currently being viewed, recommends whether to show a single
//! terminal or the whole pane grid.

use std::collections::HashMap;
use std::fmt;

use crate::protocol::Pane;

/// How the active session should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    /// One terminal: the whole session, or the focused pane.
    #[default]
    Single,
    /// Every pane drawn in its grid position.
    Layout,
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "single",
            Self::Layout => "layout",
        })
    }
}

/// Rectangle handed to the renderer for one pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneRect {
    pub pane_id: String,
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

/// Latest pane layouts plus the view state of the active session.
#[derive(Debug, Default)]
pub struct PaneLayoutTracker {
    layouts: HashMap<String, Vec<Pane>>,
    active_session: Option<String>,
    view_mode: ViewMode,
    selected_pane: Option<String>,
}

impl PaneLayoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pane list of `session`.
    ///
    /// Returns the new view mode when the update flipped it. Only the active
    /// session can flip the mode; background sessions are stored silently.
    pub fn apply(&mut self, session: &str, panes: Vec<Pane>) -> Option<ViewMode> {
        let count = panes.len();
        self.layouts.insert(session.to_string(), panes);

        if self.active_session.as_deref() != Some(session) {
            return None;
        }
        if let Some(sel) = &self.selected_pane {
            if !self.contains_pane(session, sel) {
                self.selected_pane = None;
            }
        }
        self.recompute_view_mode(count)
    }

    fn recompute_view_mode(&mut self, count: usize) -> Option<ViewMode> {
        let next = match self.view_mode {
            ViewMode::Single if count > 1 && self.selected_pane.is_none() => ViewMode::Layout,
            ViewMode::Layout if count <= 1 => ViewMode::Single,
            current => current,
        };
        if next == self.view_mode {
            None
        } else {
            self.view_mode = next;
            Some(next)
        }
    }

    /// Make `session` the one being viewed. Resets selection and view mode,
    /// then applies the transition rule to whatever layout is already known.
    pub fn set_active_session(&mut self, session: Option<&str>) -> Option<ViewMode> {
        self.active_session = session.map(str::to_string);
        self.selected_pane = None;
        let previous = self.view_mode;
        self.view_mode = ViewMode::Single;
        let count = session.map_or(0, |s| self.panes(s).len());
        self.recompute_view_mode(count);
        (self.view_mode != previous).then_some(self.view_mode)
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }

    /// Explicitly select (or clear) a pane of the active session.
    ///
    /// Unknown pane ids are ignored. Returns whether the selection changed.
    pub fn select_pane(&mut self, pane: Option<&str>) -> bool {
        let valid = match (pane, self.active_session.as_deref()) {
            (None, _) => true,
            (Some(p), Some(s)) => self.contains_pane(s, p),
            (Some(_), None) => false,
        };
        if !valid || self.selected_pane.as_deref() == pane {
            return false;
        }
        self.selected_pane = pane.map(str::to_string);
        true
    }

    pub fn selected_pane(&self) -> Option<&str> {
        self.selected_pane.as_deref()
    }

    /// User override of the recommended view mode.
    pub fn set_view_mode(&mut self, mode: ViewMode) {
        self.view_mode = mode;
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view_mode
    }

    /// Current pane list of `session` (empty when unknown or single-terminal).
    pub fn panes(&self, session: &str) -> &[Pane] {
        self.layouts.get(session).map_or(&[][..], Vec::as_slice)
    }

    /// Drop stored layouts of sessions for which `keep` returns false.
    pub fn retain_sessions(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.layouts.retain(|id, _| keep(id));
    }

    /// The pane keystrokes should go to in the active session: the explicit
    /// selection, else the multiplexer's active pane, else none.
    pub fn focused_pane(&self) -> Option<&Pane> {
        let panes = self.panes(self.active_session.as_deref()?);
        if let Some(sel) = &self.selected_pane {
            if let Some(p) = panes.iter().find(|p| &p.id == sel) {
                return Some(p);
            }
        }
        panes.iter().find(|p| p.active)
    }

    /// Total `(cols, rows)` spanned by the layout, never less than 1×1.
    ///
    /// Geometry comes from the relay, so sums saturate at `u32::MAX`.
    pub fn grid_extent(&self, session: &str) -> (u32, u32) {
        let panes = self.panes(session);
        let cols = panes.iter().map(|p| p.left.saturating_add(p.width)).max().unwrap_or(0);
        let rows = panes.iter().map(|p| p.top.saturating_add(p.height)).max().unwrap_or(0);
        (cols.max(1), rows.max(1))
    }

    /// Draw rectangles for `session`.
    ///
    /// The multiplexer reserves one cell for the separator between adjacent
    /// panes; panes off the top/left edge grow back over it so neighbours
    /// abut. Stored panes are not modified.
    pub fn draw_rects(&self, session: &str) -> Vec<PaneRect> {
        self.panes(session)
            .iter()
            .map(|p| {
                let (top, height) = if p.top > 0 {
                    (p.top - 1, p.height.saturating_add(1))
                } else {
                    (p.top, p.height)
                };
                let (left, width) = if p.left > 0 {
                    (p.left - 1, p.width.saturating_add(1))
                } else {
                    (p.left, p.width)
                };
                PaneRect {
                    pane_id: p.id.clone(),
                    top,
                    left,
                    width,
                    height,
                }
            })
            .collect()
    }

    fn contains_pane(&self, session: &str, pane: &str) -> bool {
        self.panes(session).iter().any(|p| p.id == pane)
    }
}

#[cfg(test)]
pub(crate) fn pane(id: &str, top: u32, left: u32, width: u32, height: u32) -> Pane {
    Pane {
        id: id.to_string(),
        index: 0,
        width,
        height,
        top,
        left,
        active: false,
        title: String::new(),
    }
}
