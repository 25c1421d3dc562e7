//! Text extraction for indexing.

use std::collections::HashMap;

use lockbox_core::LockboxResult;

/// Turns stored content into named text fields.
///
/// Fields named `title` and `body` are indexed as such; any other field is
/// searchable as metadata. The file name is added by the caller.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, name: &str, bytes: &[u8], mime: &str)
        -> LockboxResult<HashMap<String, String>>;
}

/// Handles text formats; binary formats only contribute their content type.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinExtractor;

impl TextExtractor for BuiltinExtractor {
    fn extract(
        &self,
        _name: &str,
        bytes: &[u8],
        mime: &str,
    ) -> LockboxResult<HashMap<String, String>> {
        let mut fields = HashMap::new();
        fields.insert("content-type".to_string(), mime.to_string());

        if !is_textual(mime) {
            return Ok(fields);
        }
        let text = String::from_utf8_lossy(bytes);

        let (title, body) = match mime {
            "text/html" => (html_title(&text), strip_tags(&text)),
            "text/markdown" => (markdown_title(&text), text.to_string()),
            _ => (None, text.to_string()),
        };
        if let Some(title) = title {
            fields.insert("title".to_string(), title);
        }
        fields.insert("body".to_string(), body);
        Ok(fields)
    }
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/") || mime == "application/json" || mime == "application/xml"
}

fn markdown_title(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn html_title(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find("<title>")? + "<title>".len();
    let end = start + lower[start..].find("</title>")?;
    let title = text.get(start..end)?.trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// Drop markup, keep text. Script and style bodies are not removed.
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_body() {
        let fields = BuiltinExtractor
            .extract("report.txt", b"hello world", "text/plain")
            .unwrap();
        assert_eq!(fields["body"], "hello world");
        assert_eq!(fields["content-type"], "text/plain");
        assert!(!fields.contains_key("title"));
    }

    #[test]
    fn test_markdown_title() {
        let fields = BuiltinExtractor
            .extract("notes.md", b"intro\n# Quarterly Plan\nbody", "text/markdown")
            .unwrap();
        assert_eq!(fields["title"], "Quarterly Plan");
    }

    #[test]
    fn test_html() {
        let html = b"<html><head><TITLE>Minutes</TITLE></head><body><p>budget  approved</p></body></html>";
        let fields = BuiltinExtractor
            .extract("m.html", html, "text/html")
            .unwrap();
        assert_eq!(fields["title"], "Minutes");
        assert_eq!(fields["body"], "Minutes budget approved");
    }

    #[test]
    fn test_binary_has_no_body() {
        let fields = BuiltinExtractor
            .extract("photo.png", &[0x89, b'P', b'N', b'G'], "image/png")
            .unwrap();
        assert!(!fields.contains_key("body"));
        assert_eq!(fields["content-type"], "image/png");
    }
}
