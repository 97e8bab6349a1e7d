//! Server-Sent Events framing for the streaming endpoints.
//!
//! Events are separated by a blank line; only `data:` lines are kept. Byte
//! chunks from the transport may cut an event (or a UTF-8 sequence) anywhere,
//! so incomplete input stays buffered until the next `feed`.

#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw transport bytes and returns the `data` payload of every event
    /// completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((end, sep_len)) = find_boundary(&self.pending) {
            let block: Vec<u8> = self.pending.drain(..end + sep_len).take(end).collect();
            let block = String::from_utf8_lossy(&block);
            let data = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|val| val.strip_prefix(' ').unwrap_or(val))
                .collect::<Vec<_>>();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }

        events
    }

    /// Returns a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.pending);
        rest.extend_from_slice(b"\n\n");
        self.feed(&rest).into_iter().next()
    }
}

fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_events() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: hello\n\ndata: world\n\n");
        assert_eq!(events, vec!["hello".to_string(), "world".to_string()]);
    }

    #[test]
    fn buffers_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\":").is_empty());
        let events = parser.feed(b"1}\r\n\r\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn keeps_multibyte_characters_split_between_chunks() {
        let payload = "data: مرحبا\n\n".as_bytes();
        let mut parser = SseParser::new();
        let mut events = parser.feed(&payload[..8]);
        events.extend(parser.feed(&payload[8..]));
        assert_eq!(events, vec!["مرحبا".to_string()]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: x\ndata: tail").is_empty());
        assert_eq!(parser.finish().as_deref(), Some("tail"));
        assert_eq!(parser.finish(), None);
    }
}
