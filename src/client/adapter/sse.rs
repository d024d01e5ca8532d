//! Server-sent event body parsing for buffered streaming responses.

/// `data:` payloads of an event-stream body, excluding the `[DONE]` sentinel.
pub(crate) fn data_lines(body: &str) -> impl Iterator<Item = &str> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty() && *data != "[DONE]")
}

pub(crate) fn looks_like_event_stream(body: &str) -> bool {
    body.trim_start().starts_with("data:") || body.trim_start().starts_with("event:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_lines() {
        let body = "event: ping\ndata: {\"a\":1}\n\ndata:{\"b\":2}\ndata: [DONE]\n";
        let lines: Vec<&str> = data_lines(body).collect();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert!(looks_like_event_stream(body));
        assert!(!looks_like_event_stream("{\"id\":1}"));
    }
}
