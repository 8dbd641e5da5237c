//! In-place replay of full-screen snapshots.
//!
//! Upstream emits a full repaint as `ESC[2J ESC[H` followed by every row of
//! the new screen. Written verbatim into an emulator with scrollback, the
//! clear pushes the old screen into history and shorter rows leave stale
//! cells behind. [`rewrite_snapshot`] turns such a payload into one that
//! overwrites the visible screen row by row instead.

use std::borrow::Cow;

/// Clear screen followed by cursor home: the shape of a full repaint.
pub const CLEAR_AND_HOME: &str = "\x1b[2J\x1b[H";

const AUTOWRAP_OFF: &str = "\x1b[?7l";
const AUTOWRAP_ON: &str = "\x1b[?7h";
const CURSOR_HOME: &str = "\x1b[H";
const ERASE_LINE_RIGHT: &str = "\x1b[K";
const ERASE_BELOW: &str = "\x1b[J";

/// Whether `payload` is a full-screen repaint.
pub fn is_full_repaint(payload: &str) -> bool {
    payload.starts_with(CLEAR_AND_HOME)
}

/// Rewrite a full repaint so it draws in place; anything else is returned
/// untouched (borrowed).
pub fn rewrite_snapshot(payload: &str) -> Cow<'_, str> {
    let Some(body) = payload.strip_prefix(CLEAR_AND_HOME) else {
        return Cow::Borrowed(payload);
    };
    let body = body
        .strip_suffix("\r\n")
        .or_else(|| body.strip_suffix('\n'))
        .unwrap_or(body);

    let breaks = body.matches('\n').count();
    let mut out = String::with_capacity(
        body.len()
            + breaks * ERASE_LINE_RIGHT.len()
            + AUTOWRAP_OFF.len()
            + CURSOR_HOME.len()
            + ERASE_BELOW.len()
            + AUTOWRAP_ON.len(),
    );
    out.push_str(AUTOWRAP_OFF);
    out.push_str(CURSOR_HOME);

    let mut rest = body;
    while let Some(pos) = rest.find('\n') {
        let (line, tail) = rest.split_at(pos);
        match line.strip_suffix('\r') {
            Some(line) => {
                out.push_str(line);
                out.push_str(ERASE_LINE_RIGHT);
                out.push_str("\r\n");
            }
            None => {
                out.push_str(line);
                out.push_str(ERASE_LINE_RIGHT);
                out.push('\n');
            }
        }
        rest = &tail[1..];
    }
    out.push_str(rest);

    out.push_str(ERASE_BELOW);
    out.push_str(AUTOWRAP_ON);
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_payload_passes_through_borrowed() {
        let payload = "hello\r\n";
        let out = rewrite_snapshot(payload);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out, payload);
        assert!(std::ptr::eq(&*out, payload));
    }

    #[test]
    fn clear_sequence_not_at_start_is_not_a_repaint() {
        let payload = "x\x1b[2J\x1b[Hy";
        assert_eq!(rewrite_snapshot(payload), payload);
    }

    #[test]
    fn repaint_drops_clear_and_erases_each_line() {
        let out = rewrite_snapshot("\x1b[2J\x1b[HL1\r\nL2");
        assert!(!out.contains(CLEAR_AND_HOME));
        assert!(out.contains("L1\x1b[K\r\nL2"));
    }

    #[test]
    fn repaint_full_shape() {
        let out = rewrite_snapshot("\x1b[2J\x1b[Habc\r\nde\r\n");
        assert_eq!(out, "\x1b[?7l\x1b[Habc\x1b[K\r\nde\x1b[J\x1b[?7h");
    }

    #[test]
    fn only_one_trailing_terminator_is_stripped() {
        let out = rewrite_snapshot("\x1b[2J\x1b[Ha\r\n\r\n");
        assert_eq!(out, "\x1b[?7l\x1b[Ha\x1b[K\r\n\x1b[J\x1b[?7h");
    }

    #[test]
    fn bare_newlines_are_handled() {
        let out = rewrite_snapshot("\x1b[2J\x1b[Hone\ntwo\n");
        assert_eq!(out, "\x1b[?7l\x1b[Hone\x1b[K\ntwo\x1b[J\x1b[?7h");
    }

    #[test]
    fn empty_repaint_still_clears_below_home() {
        let out = rewrite_snapshot(CLEAR_AND_HOME);
        assert_eq!(out, "\x1b[?7l\x1b[H\x1b[J\x1b[?7h");
    }

    #[test]
    fn rewrite_is_deterministic() {
        let payload = "\x1b[2J\x1b[H$ ls\r\nCargo.toml  src\r\n$ ";
        assert_eq!(rewrite_snapshot(payload), rewrite_snapshot(payload));
        assert!(is_full_repaint(payload));
    }
}
