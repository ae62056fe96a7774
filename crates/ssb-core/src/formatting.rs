//! Telegram-HTML helpers for outbound replies.

/// Escape text for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Wrap already-escaped text in a monospace block.
pub fn code_block(escaped: &str) -> String {
    format!("<pre>{escaped}</pre>")
}

fn escaped_char_len(ch: char) -> usize {
    match ch {
        '&' => "&amp;".len(),
        '<' | '>' => "&lt;".len(),
        '"' => "&quot;".len(),
        _ => 1,
    }
}

/// Length of `escape_html(s)` in characters, without allocating.
pub fn escaped_len(s: &str) -> usize {
    s.chars().map(escaped_char_len).sum()
}

/// Split raw text so no piece exceeds `max_len` characters once HTML-escaped.
/// Splits fall between raw characters, so entities produced by escaping are
/// never cut apart.
pub fn split_escaped_chunks(s: &str, max_len: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut cur_len = 0usize;

    for ch in s.chars() {
        let w = escaped_char_len(ch);
        if cur_len + w > max_len && !cur.is_empty() {
            out.push(cur);
            cur = String::new();
            cur_len = 0;
        }
        cur.push(ch);
        cur_len += w;
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}
