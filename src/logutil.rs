//! Helpers that keep log lines single-line and bounded when they carry message
//! text heard off the mesh or raw frame bytes.

use std::fmt::Write;

const MAX_PREVIEW_CHARS: usize = 300;

/// Escape control characters so mesh text cannot break a log line.
///
/// `\n`, `\r`, `\t` and backslash get their usual escapes, other control characters
/// become `\xNN`. Anything past 300 characters is replaced with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW_CHARS) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW_CHARS {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Escaped preview of at most `max_bytes` of `input`, cut on a char boundary.
pub fn truncate_for_log(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

/// Lowercase hex of the first `max` bytes, with a length marker when cut short.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let shown = &data[..data.len().min(max)];
    let mut out = hex::encode(shown);
    if shown.len() < data.len() {
        let _ = write!(&mut out, "..(+{}B)", data.len() - shown.len());
    }
    out
}

/// Twelve-digit key prefix used when naming contacts in logs.
pub fn short_key(key: &str) -> &str {
    let end = key
        .char_indices()
        .nth(12)
        .map(|(idx, _)| idx)
        .unwrap_or(key.len());
    &key[..end]
}
