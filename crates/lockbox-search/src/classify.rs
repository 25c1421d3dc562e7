//! Content-type detection from a bounded probe of the upload.

use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Decides a MIME type from the file name and the first bytes of content.
///
/// `probe` is at most the configured probe window; implementations must not
/// assume they see the whole file.
pub trait ContentClassifier: Send + Sync {
    fn detect(&self, name: &str, probe: &[u8]) -> String;
}

/// Magic numbers first, then a text/binary decision, then the extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinClassifier;

const MAGIC: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/gzip"),
    (b"\x7fELF", "application/x-executable"),
];

impl ContentClassifier for BuiltinClassifier {
    fn detect(&self, name: &str, probe: &[u8]) -> String {
        if let Some((_, mime)) = MAGIC.iter().find(|(magic, _)| probe.starts_with(magic)) {
            return (*mime).to_string();
        }
        let ext = extension(name);
        if probe.is_empty() {
            return by_extension(&ext).unwrap_or(OCTET_STREAM).to_string();
        }
        if looks_like_text(probe) {
            return text_type(&ext, probe).to_string();
        }
        match by_extension(&ext) {
            Some(mime) if !mime.starts_with("text/") => mime.to_string(),
            _ => OCTET_STREAM.to_string(),
        }
    }
}

fn extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// UTF-8 without control bytes. A multi-byte character cut off by the end
/// of the probe still counts as text.
fn looks_like_text(probe: &[u8]) -> bool {
    let valid = match std::str::from_utf8(probe) {
        Ok(s) => s,
        Err(e) if e.error_len().is_none() => {
            // valid up to the cut
            match std::str::from_utf8(&probe[..e.valid_up_to()]) {
                Ok(s) => s,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    !valid
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\x0c'))
}

fn text_type(ext: &str, probe: &[u8]) -> &'static str {
    if let Some(mime) = by_extension(ext) {
        if mime.starts_with("text/") || mime == "application/json" || mime == "application/xml" {
            return mime;
        }
    }
    let head = String::from_utf8_lossy(&probe[..probe.len().min(256)]).to_ascii_lowercase();
    let head = head.trim_start();
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        "text/html"
    } else if head.starts_with("<?xml") {
        "application/xml"
    } else {
        "text/plain"
    }
}

fn by_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "txt" | "text" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => return None,
    })
}
