//! Local terminal helpers for the CLI: raw mode, a stdout sink, window size
//! and stdin UTF-8 decoding.
//!
//! Uses the `nix` crate for termios and a raw `TIOCGWINSZ` ioctl for the
//! window size, both on the process's own stdio.

use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd};

use nix::sys::termios::{self, SetArg, Termios};
use tracing::debug;

use crate::sink::TerminalSink;

/// Puts stdin into raw mode; restores the saved settings on drop.
pub struct RawModeGuard {
    saved: Termios,
}

impl RawModeGuard {
    pub fn enable() -> Result<Self, nix::Error> {
        let stdin = io::stdin();
        let saved = termios::tcgetattr(stdin.as_fd())?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;
        Ok(Self { saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &self.saved) {
            debug!("Failed to restore terminal mode: {e}");
        }
    }
}

/// Current `(cols, rows)` of the terminal on stdout.
pub fn window_size() -> Result<(u16, u16), nix::Error> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ fills a winsize struct we own.
    let ret = unsafe {
        libc::ioctl(
            io::stdout().as_raw_fd(),
            libc::TIOCGWINSZ,
            std::ptr::addr_of_mut!(ws),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok((ws.ws_col, ws.ws_row))
    }
}

/// Writes terminal output straight to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl TerminalSink for StdoutSink {
    fn write(&mut self, text: &str) {
        let mut out = io::stdout().lock();
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            debug!("stdout write failed: {e}");
        }
    }
}

/// Decodes stdin reads into text, carrying a multi-byte character split
/// across two reads over to the next one.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// Decode `input` after any bytes held back from the previous call.
    /// Invalid bytes become U+FFFD; an incomplete trailing sequence is kept.
    pub fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest = &self.pending[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // from_utf8 checked this prefix.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(n) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }
}
