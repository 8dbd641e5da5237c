//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/.castview.toml"` → `"/home/user/.castview.toml"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Cow::Owned(format!("{home}{}", &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Parse a key description such as `"0x1d"`, `"29"` or `"^]"` into the byte it sends.
pub fn parse_key_byte(text: &str) -> Option<u8> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u8::from_str_radix(hex, 16).ok();
    }
    if let Some(rest) = text.strip_prefix('^') {
        let mut chars = rest.chars();
        return match (chars.next(), chars.next()) {
            (Some(c), None) if ('@'..='_').contains(&c.to_ascii_uppercase()) => {
                Some(c.to_ascii_uppercase() as u8 - b'@')
            }
            _ => None,
        };
    }
    text.parse().ok()
}
