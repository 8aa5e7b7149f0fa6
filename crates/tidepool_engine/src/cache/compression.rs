//! Whitespace compression for cached payloads.
//!
//! Payloads longer than the threshold have every run of four or more
//! identical whitespace characters replaced by a `~{count}{char}` token,
//! inside string literals too. A literal `~` is written as `~~`. The
//! encoding is reversible with [`decompress`], which the cache applies on
//! read to entries flagged `compressed`.

/// Shortest run worth a token.
const MIN_RUN: usize = 4;

/// Escape character of the encoding.
const MARKER: char = '~';

/// Result of [`compress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    /// Possibly encoded content.
    pub content: String,
    /// Whether the content was encoded.
    pub compressed: bool,
}

/// Compresses `content` if it is longer than `threshold` characters.
pub fn compress(content: &str, threshold: usize) -> Compressed {
    if content.chars().count() <= threshold {
        return Compressed {
            content: content.to_string(),
            compressed: false,
        };
    }
    Compressed {
        content: collapse_runs(content),
        compressed: true,
    }
}

fn collapse_runs(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if c == MARKER {
            out.push(MARKER);
            out.push(MARKER);
            continue;
        }
        if !c.is_whitespace() {
            out.push(c);
            continue;
        }
        let mut run = 1;
        while chars.peek() == Some(&c) {
            chars.next();
            run += 1;
        }
        if run >= MIN_RUN {
            out.push(MARKER);
            out.push_str(&run.to_string());
            out.push(c);
        } else {
            out.extend(std::iter::repeat(c).take(run));
        }
    }
    out
}

/// Reverses [`compress`]. Returns `None` for malformed input.
pub fn decompress(content: &str) -> Option<String> {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if c != MARKER {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&MARKER) {
            chars.next();
            out.push(MARKER);
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        let run: usize = digits.parse().ok()?;
        let ws = chars.next().filter(|w| w.is_whitespace())?;
        out.extend(std::iter::repeat(ws).take(run));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn below_threshold_is_unchanged() {
        let text = "a    b";
        let out = compress(text, 6);
        assert!(!out.compressed);
        assert_eq!(out.content, text);
    }

    #[test]
    fn above_threshold_collapses_runs() {
        let text = "alpha      beta\n\n\n\n gamma  delta";
        let out = compress(text, 10);
        assert!(out.compressed);
        assert_eq!(out.content, "alpha~6 beta~4\n gamma  delta");
        assert!(out.content.len() < text.len());
        assert_eq!(decompress(&out.content).as_deref(), Some(text));
    }

    #[test]
    fn markers_in_content_survive() {
        let text = "~~ ~5 tilde~     ~";
        let out = compress(text, 1);
        assert_eq!(decompress(&out.content).as_deref(), Some(text));
    }

    #[test]
    fn compact_json_with_padded_strings_shrinks() {
        let value = json!({"id": "m-1", "content": format!("hello{}world", " ".repeat(2000))});
        let raw = value.to_string();
        let out = compress(&raw, 1024);
        assert!(out.compressed);
        assert!(out.content.len() < 100);
        let restored: Value = serde_json::from_str(&decompress(&out.content).unwrap()).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert_eq!(decompress("~x"), None);
        assert_eq!(decompress("~12"), None);
        assert_eq!(decompress("~3a"), None);
    }
}
