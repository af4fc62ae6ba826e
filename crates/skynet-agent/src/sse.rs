//! Incremental line/SSE decoding shared by every streaming adapter.
//!
//! Provider SSE transports make no guarantee that a chunk boundary falls on
//! a UTF-8 character boundary or a line boundary — §4.3 requires buffering
//! any trailing incomplete bytes/line across `bytes_stream()` chunks rather
//! than dropping them.

/// Accumulates raw bytes across network chunks and yields complete lines,
/// holding back a trailing partial line (and any trailing incomplete UTF-8
/// sequence) until more bytes arrive.
#[derive(Default)]
pub struct LineDecoder {
    pending_bytes: Vec<u8>,
    line_buf: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a new chunk of bytes, returning the complete lines it produced
    /// (without trailing `\n`/`\r`). Any trailing partial line or dangling
    /// UTF-8 bytes are retained for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending_bytes.extend_from_slice(chunk);

        // Decode as much valid UTF-8 as possible; hold back a trailing
        // incomplete multibyte sequence (at most 3 bytes) for the next feed.
        let (valid, consumed) = match std::str::from_utf8(&self.pending_bytes) {
            Ok(s) => (s.to_string(), self.pending_bytes.len()),
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                let s = std::str::from_utf8(&self.pending_bytes[..valid_up_to])
                    .expect("valid_up_to is always a char boundary")
                    .to_string();
                (s, valid_up_to)
            }
        };
        self.pending_bytes.drain(..consumed);

        self.line_buf.push_str(&valid);
        let mut lines: Vec<String> = self.line_buf.split('\n').map(|s| s.to_string()).collect();
        // The last element is either empty (buffer ended on \n) or a partial
        // line — keep it in line_buf for the next feed.
        self.line_buf = lines.pop().unwrap_or_default();

        lines.into_iter().map(|l| l.trim_end_matches('\r').to_string()).collect()
    }
}

/// A single parsed SSE line: either an `event:` declaration or a `data:` payload.
#[derive(Debug)]
pub enum SseLine {
    Event(String),
    Data(String),
    Other,
}

pub fn parse_sse_line(line: &str) -> SseLine {
    if let Some(event_type) = line.strip_prefix("event: ") {
        SseLine::Event(event_type.to_string())
    } else if let Some(data) = line.strip_prefix("data: ") {
        SseLine::Data(data.to_string())
    } else if let Some(data) = line.strip_prefix("data:") {
        SseLine::Data(data.to_string())
    } else {
        SseLine::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_splits_complete_lines_only() {
        let mut dec = LineDecoder::new();
        let lines = dec.feed(b"event: x\ndata: {\"a\":1}\ndata: partial");
        assert_eq!(lines, vec!["event: x", "data: {\"a\":1}"]);
        let lines2 = dec.feed(b" line\n");
        assert_eq!(lines2, vec!["data: partial line"]);
    }

    #[test]
    fn feed_holds_back_split_multibyte_char() {
        let text = "caf\u{e9}"; // "café"
        let bytes = text.as_bytes();
        // Split in the middle of the 2-byte 'é' sequence.
        let (first, second) = bytes.split_at(bytes.len() - 1);

        let mut dec = LineDecoder::new();
        let lines = dec.feed(first);
        assert!(lines.is_empty(), "no newline fed yet, nothing to flush");
        let lines = dec.feed(second);
        assert!(lines.is_empty(), "still no newline");
        let lines = dec.feed(b"\n");
        assert_eq!(lines, vec![text.to_string()]);
    }
}
