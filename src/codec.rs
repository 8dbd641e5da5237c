//! Payload decoding for screen and file frames.
//!
//! Screen payloads arrive base64-encoded, optionally gzip-compressed. Both
//! decoders are pure and report failures as [`DecodeError`]; callers log and
//! drop the offending frame rather than tearing down the connection.

use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::MultiGzDecoder;

/// Why a payload could not be turned into text.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid gzip stream: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Decode a base64 payload into UTF-8 text.
pub fn decode_plain(payload: &str) -> Result<String, DecodeError> {
    let bytes = STANDARD.decode(payload)?;
    Ok(String::from_utf8(bytes)?)
}

/// Decode a base64 payload, gunzip it, and interpret the result as UTF-8.
pub fn decode_compressed(payload: &str) -> Result<String, DecodeError> {
    let compressed = STANDARD.decode(payload)?;
    let mut inflated = Vec::with_capacity(compressed.len() * 4);
    MultiGzDecoder::new(compressed.as_slice())
        .read_to_end(&mut inflated)
        .map_err(DecodeError::Gzip)?;
    Ok(String::from_utf8(inflated)?)
}

/// Fallback content type for anything unrecognised.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Map a file name (and optional language hint) to a MIME-ish content type.
///
/// A recognised language hint wins over the extension; an unknown extension
/// yields [`DEFAULT_CONTENT_TYPE`].
pub fn classify_file_content_type(filename: &str, language_hint: Option<&str>) -> &'static str {
    if let Some(ty) = language_hint.and_then(content_type_for_language) {
        return ty;
    }
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    content_type_for_extension(&ext).unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// Whether a content type is carried as raw base64 rather than text.
pub fn is_image(content_type: &str) -> bool {
    content_type.starts_with("image/")
}

fn content_type_for_language(language: &str) -> Option<&'static str> {
    let ty = match language.to_ascii_lowercase().as_str() {
        "markdown" | "md" => "text/markdown",
        "html" => "text/html",
        "css" | "scss" => "text/css",
        "javascript" | "js" | "jsx" => "text/javascript",
        "typescript" | "ts" | "tsx" => "text/typescript",
        "json" => "application/json",
        "python" | "py" => "text/x-python",
        "java" => "text/x-java",
        "kotlin" => "text/x-kotlin",
        "swift" => "text/x-swift",
        "go" => "text/x-go",
        "rust" | "rs" => "text/x-rust",
        "bash" | "sh" | "shell" | "zsh" => "text/x-shellscript",
        "yaml" | "yml" => "application/yaml",
        "sql" => "application/sql",
        "plaintext" | "text" => "text/plain",
        _ => return None,
    };
    Some(ty)
}

fn content_type_for_extension(ext: &str) -> Option<&'static str> {
    let ty = match ext {
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" | "scss" => "text/css",
        "js" | "mjs" | "cjs" | "jsx" => "text/javascript",
        "ts" | "tsx" => "text/typescript",
        "json" => "application/json",
        "py" => "text/x-python",
        "java" => "text/x-java",
        "kt" | "kts" => "text/x-kotlin",
        "swift" => "text/x-swift",
        "go" => "text/x-go",
        "rs" => "text/x-rust",
        "sh" | "bash" | "zsh" => "text/x-shellscript",
        "yml" | "yaml" => "application/yaml",
        "toml" => "application/toml",
        "sql" => "application/sql",
        "xml" => "application/xml",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        _ => return None,
    };
    Some(ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip_b64(text: &str) -> String {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        STANDARD.encode(enc.finish().unwrap())
    }

    #[test]
    fn plain_round_trip_preserves_escapes_and_unicode() {
        let text = "\x1b[1;32m✓ done\x1b[0m\r\n한글 ok\r\n";
        assert_eq!(decode_plain(&STANDARD.encode(text)).unwrap(), text);
    }

    #[test]
    fn compressed_round_trip() {
        let text = "\x1b[2J\x1b[H".to_string() + &"row of output\r\n".repeat(200);
        assert_eq!(decode_compressed(&gzip_b64(&text)).unwrap(), text);
    }

    #[test]
    fn empty_payload_decodes_to_empty_text() {
        assert_eq!(decode_plain("").unwrap(), "");
    }

    #[test]
    fn malformed_base64_is_an_error() {
        assert!(matches!(
            decode_plain("not*base64!"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let payload = STANDARD.encode([0xff, 0xfe, 0x41]);
        assert!(matches!(decode_plain(&payload), Err(DecodeError::Utf8(_))));
    }

    #[test]
    fn uncompressed_payload_fails_gzip_decode() {
        let payload = STANDARD.encode("plain text, no gzip header");
        assert!(matches!(
            decode_compressed(&payload),
            Err(DecodeError::Gzip(_))
        ));
    }

    #[test]
    fn classify_by_extension() {
        assert_eq!(classify_file_content_type("README.md", None), "text/markdown");
        assert_eq!(classify_file_content_type("index.HTM", None), "text/html");
        assert_eq!(classify_file_content_type("shot.PNG", None), "image/png");
        assert_eq!(classify_file_content_type("src/main.rs", None), "text/x-rust");
    }

    #[test]
    fn language_hint_wins_over_extension() {
        assert_eq!(
            classify_file_content_type("notes.txt", Some("markdown")),
            "text/markdown"
        );
    }

    #[test]
    fn unknown_hint_falls_back_to_extension() {
        assert_eq!(
            classify_file_content_type("config.yaml", Some("klingon")),
            "application/yaml"
        );
    }

    #[test]
    fn unknown_or_missing_extension_is_plain_text() {
        assert_eq!(classify_file_content_type("blob.xyz", None), DEFAULT_CONTENT_TYPE);
        assert_eq!(classify_file_content_type("Makefile", None), DEFAULT_CONTENT_TYPE);
        assert_eq!(classify_file_content_type("", None), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn image_detection() {
        assert!(is_image("image/png"));
        assert!(!is_image("text/markdown"));
    }
}
