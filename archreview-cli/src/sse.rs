//! Incremental server-sent-events decoding.

use anyhow::{anyhow, Result};

/// One decoded event: its name and its (possibly multi-line) data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// SSE stream processor that handles UTF-8 chunk boundaries correctly
#[derive(Default)]
pub struct SseProcessor {
    buffer: Vec<u8>,
}

impl SseProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk of bytes to the buffer
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Try to extract the next complete event from the buffer.
    /// Returns None if no complete event is available yet.
    pub fn next_event(&mut self) -> Option<Result<SseEvent>> {
        // Keep-alive comments have no data and are skipped
        loop {
            let boundary = self.find_event_boundary()?;
            let event_bytes: Vec<u8> = self.buffer.drain(..boundary.end).collect();

            let event_str = match std::str::from_utf8(&event_bytes[..boundary.start]) {
                Ok(s) => s,
                Err(e) => return Some(Err(anyhow!("Invalid UTF-8 in SSE event: {}", e))),
            };

            if let Some(parsed) = Self::parse_event(event_str) {
                return Some(Ok(parsed));
            }
        }
    }

    /// Range of the next event: `start` ends its content, `end` includes the delimiter.
    fn find_event_boundary(&self) -> Option<std::ops::Range<usize>> {
        let crlf = self
            .buffer
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|i| i..i + 4);
        let lf = self
            .buffer
            .windows(2)
            .position(|w| w == b"\n\n")
            .map(|i| i..i + 2);
        match (crlf, lf) {
            (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    /// Space after the colon is optional and data lines are joined with newlines.
    /// Without an `event:` line the name is "message".
    fn parse_event(event_str: &str) -> Option<SseEvent> {
        let mut event = None;
        let mut data_lines: Vec<&str> = Vec::new();

        for line in event_str.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }

        if data_lines.is_empty() {
            None
        } else {
            Some(SseEvent {
                event: event.unwrap_or_else(|| "message".to_string()),
                data: data_lines.join("\n"),
            })
        }
    }

    /// Check if there's any non-whitespace data left in the buffer
    pub fn has_remaining(&self) -> bool {
        self.buffer.iter().any(|&b| !b.is_ascii_whitespace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(processor: &mut SseProcessor) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(event) = processor.next_event() {
            events.push(event.unwrap());
        }
        events
    }

    #[test]
    fn test_parses_named_event() {
        let mut sse = SseProcessor::new();
        sse.push(b"event: reviewUpdated\nid: 3\ndata: {\"a\":1}\n\n");
        assert_eq!(
            drain(&mut sse),
            vec![SseEvent {
                event: "reviewUpdated".to_string(),
                data: "{\"a\":1}".to_string(),
            }]
        );
        assert!(!sse.has_remaining());
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut sse = SseProcessor::new();
        sse.push(b"event:reviewUpd");
        assert!(sse.next_event().is_none());
        sse.push(b"ated\ndata:x\n");
        assert!(sse.next_event().is_none());
        sse.push(b"\n");
        let events = drain(&mut sse);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "reviewUpdated");
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let text = "data: é\n\n".as_bytes();
        let (a, b) = text.split_at(7);
        let mut sse = SseProcessor::new();
        sse.push(a);
        assert!(sse.next_event().is_none());
        sse.push(b);
        assert_eq!(drain(&mut sse)[0].data, "é");
    }

    #[test]
    fn test_keep_alive_comments_are_skipped() {
        let mut sse = SseProcessor::new();
        sse.push(b":\n\n: keep-alive\n\ndata: one\n\n");
        let events = drain(&mut sse);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "one");
    }

    #[test]
    fn test_crlf_and_multiline_data() {
        let mut sse = SseProcessor::new();
        sse.push(b"data: first\r\ndata: second\r\n\r\ndata: third\n\n");
        let events = drain(&mut sse);
        assert_eq!(events[0].data, "first\nsecond");
        assert_eq!(events[1].data, "third");
    }

    #[test]
    fn test_leftover_data_is_reported() {
        let mut sse = SseProcessor::new();
        sse.push(b"data: partial");
        assert!(sse.next_event().is_none());
        assert!(sse.has_remaining());
    }
}
