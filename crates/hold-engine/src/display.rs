use std::borrow::Cow;

/// Upper bound on payload text included in a log line.
pub const LOG_CONTENT_MAX: usize = 1_000;

/// Upper bound on metadata (ids, channel lists) included in a log line.
pub const LOG_METADATA_MAX: usize = 1_000;

/// Shortens `s` to at most `max` bytes, cutting on a char boundary and
/// marking the cut with an ellipsis.
pub fn trim_for_display(s: &str, max: usize) -> Cow<'_, str> {
    if s.len() <= max {
        return Cow::Borrowed(s);
    }

    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    Cow::Owned(format!("{}...", &s[..end]))
}

/// Lossy, bounded rendering of an opaque payload for debug logs.
pub fn payload_preview(payload: &[u8]) -> String {
    if payload.is_empty() {
        return String::from("<0 bytes>");
    }

    let text = String::from_utf8_lossy(payload);
    format!(
        "{} bytes {:?}",
        payload.len(),
        trim_for_display(&text, LOG_CONTENT_MAX)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_are_borrowed() {
        assert!(matches!(trim_for_display("hello", 10), Cow::Borrowed("hello")));
    }

    #[test]
    fn trims_on_char_boundary() {
        // 'é' is two bytes; a cut at byte 2 would split it.
        assert_eq!(trim_for_display("aé-tail", 2), "a...");
        assert_eq!(trim_for_display("abcdef", 3), "abc...");
    }

    #[test]
    fn preview_reports_length() {
        assert_eq!(payload_preview(b""), "<0 bytes>");
        assert_eq!(payload_preview(b"hi"), "2 bytes \"hi\"");
    }
}
