//! The chat response wire format. One byte stream carries two kinds of
//! content: padded single-line status records and free-form body text. The
//! writer half guarantees a status line never starts mid-body-line; the
//! parser half reassembles both sides exactly no matter how the transport
//! chunks the bytes.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Marks a status line. Anything between this prefix and the next newline is
/// progress reporting, not reply text.
pub const STATUS_PREFIX: &str = "@@STATUS@@:";

/// Minimum size of an emitted status line. Small writes get buffered by
/// intermediary proxies; padding each status line past their coalescing
/// window keeps progress updates arriving live.
pub const STATUS_LINE_MIN_BYTES: usize = 2048;

/// The client hung up. Raised by the writer on the first failed send; the
/// shared token is cancelled at the same moment so in-flight work stops.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("response stream closed by the client")]
pub struct StreamClosed;

/// Writer half of the protocol, held by the agent loop for the lifetime of
/// one request.
pub struct ReplyStream {
    sender: mpsc::Sender<Bytes>,
    token: CancellationToken,
    at_line_start: bool,
}

impl ReplyStream {
    pub fn new(sender: mpsc::Sender<Bytes>, token: CancellationToken) -> Self {
        Self { sender, token, at_line_start: true }
    }

    /// Emits one padded status line. Opens with a newline first when body
    /// bytes left the stream mid-line, so a status never splices into a
    /// body line.
    pub async fn status(&mut self, text: &str) -> Result<(), StreamClosed> {
        let mut line = String::with_capacity(STATUS_LINE_MIN_BYTES + 1);
        if !self.at_line_start {
            line.push('\n');
        }
        line.push_str(STATUS_PREFIX);
        line.push_str(text);
        let padded_len = line.len().max(if self.at_line_start {
            STATUS_LINE_MIN_BYTES
        } else {
            STATUS_LINE_MIN_BYTES + 1
        });
        while line.len() < padded_len {
            line.push(' ');
        }
        line.push('\n');

        self.at_line_start = true;
        self.send(Bytes::from(line)).await
    }

    /// Appends reply text as-is.
    pub async fn body(&mut self, text: &str) -> Result<(), StreamClosed> {
        if text.is_empty() {
            return Ok(());
        }
        self.at_line_start = text.ends_with('\n');
        self.send(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Whether the next byte would start a fresh line.
    pub fn at_line_start(&self) -> bool {
        self.at_line_start
    }

    /// Ends the stream. Dropping the writer has the same effect; this spells
    /// out that the response is complete rather than abandoned.
    pub fn finish(self) {}

    async fn send(&mut self, bytes: Bytes) -> Result<(), StreamClosed> {
        if self.sender.send(bytes).await.is_err() {
            self.token.cancel();
            return Err(StreamClosed);
        }
        Ok(())
    }
}

/// What the parser half yields: either one status line's payload (padding
/// stripped) or a run of body text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Status(String),
    Body(String),
}

/// Incremental decoder for the response stream. Feed it chunks in arrival
/// order; it holds back only what it must, a possible status-marker prefix
/// at a line start or a split UTF-8 sequence, and releases everything else
/// immediately.
pub struct ReplyStreamParser {
    carry: Vec<u8>,
    at_line_start: bool,
}

impl Default for ReplyStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyStreamParser {
    pub fn new() -> Self {
        Self { carry: Vec::new(), at_line_start: true }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.carry.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            if self.carry.is_empty() {
                break;
            }

            if self.at_line_start {
                let marker = STATUS_PREFIX.as_bytes();
                let shared = self
                    .carry
                    .iter()
                    .zip(marker)
                    .take_while(|(byte, expected)| byte == expected)
                    .count();

                if shared == marker.len() {
                    // A full status line ends at the next newline.
                    let Some(end) = position_of(&self.carry, b'\n') else {
                        break;
                    };
                    let payload = String::from_utf8_lossy(&self.carry[marker.len()..end]);
                    events.push(StreamEvent::Status(payload.trim_end_matches(' ').to_string()));
                    self.carry.drain(..=end);
                    continue;
                }
                if shared == self.carry.len() {
                    // Everything so far could still become the marker.
                    break;
                }
            }

            // Body mode: release bytes up to the next line start, where the
            // marker check applies again.
            match position_of(&self.carry, b'\n') {
                Some(newline) => {
                    // A '\n' byte never falls inside a multibyte sequence,
                    // so a whole line always decodes cleanly.
                    let taken: Vec<u8> = self.carry.drain(..=newline).collect();
                    push_body(&mut events, String::from_utf8_lossy(&taken).into_owned());
                    self.at_line_start = true;
                }
                None => {
                    let taken: Vec<u8> = self.carry.drain(..).collect();
                    let (text, incomplete) = take_complete_utf8(taken);
                    // A split sequence finishes with the next chunk.
                    self.carry = incomplete;
                    self.at_line_start = false;
                    if !text.is_empty() {
                        push_body(&mut events, text);
                    }
                    break;
                }
            }
        }

        events
    }

    /// Flushes whatever is still held. A truncated status line surfaces as a
    /// status; stray partial bytes surface as body.
    pub fn finish(self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.carry.is_empty() {
            return events;
        }
        let carry = self.carry;
        let marker = STATUS_PREFIX.as_bytes();
        if self.at_line_start && carry.starts_with(marker) {
            let payload = String::from_utf8_lossy(&carry[marker.len()..]);
            events.push(StreamEvent::Status(payload.trim_end_matches(' ').to_string()));
        } else {
            events.push(StreamEvent::Body(String::from_utf8_lossy(&carry).into_owned()));
        }
        events
    }
}

fn position_of(bytes: &[u8], needle: u8) -> Option<usize> {
    bytes.iter().position(|byte| *byte == needle)
}

/// Splits trailing bytes of an unfinished UTF-8 sequence off the decodable
/// prefix.
fn take_complete_utf8(bytes: Vec<u8>) -> (String, Vec<u8>) {
    match String::from_utf8(bytes) {
        Ok(text) => (text, Vec::new()),
        Err(error) => {
            let valid_up_to = error.utf8_error().valid_up_to();
            let split_sequence = error.utf8_error().error_len().is_none();
            let bytes = error.into_bytes();
            if split_sequence {
                let text = String::from_utf8_lossy(&bytes[..valid_up_to]).into_owned();
                (text, bytes[valid_up_to..].to_vec())
            } else {
                (String::from_utf8_lossy(&bytes).into_owned(), Vec::new())
            }
        }
    }
}

fn push_body(events: &mut Vec<StreamEvent>, text: String) {
    if let Some(StreamEvent::Body(existing)) = events.last_mut() {
        existing.push_str(&text);
    } else {
        events.push(StreamEvent::Body(text));
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{
        ReplyStream, ReplyStreamParser, StreamEvent, STATUS_LINE_MIN_BYTES, STATUS_PREFIX,
    };

    fn statuses(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Status(text) => Some(text.clone()),
                StreamEvent::Body(_) => None,
            })
            .collect()
    }

    fn body(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Body(text) => Some(text.as_str()),
                StreamEvent::Status(_) => None,
            })
            .collect()
    }

    fn writer() -> (ReplyStream, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        (ReplyStream::new(tx, CancellationToken::new()), rx)
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }

    #[tokio::test]
    async fn status_lines_are_padded_and_newline_terminated() {
        let (mut stream, rx) = writer();
        stream.status("searching: mugs").await.expect("status");
        stream.finish();
        let bytes = drain(rx).await;

        assert!(bytes.len() > STATUS_LINE_MIN_BYTES);
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert!(bytes.starts_with(STATUS_PREFIX.as_bytes()));
        // Exactly one line: the newline terminating the padding.
        assert_eq!(bytes.iter().filter(|byte| **byte == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn status_after_midline_body_opens_its_own_line() {
        let (mut stream, rx) = writer();
        stream.body("partial sentence").await.expect("body");
        stream.status("still looking").await.expect("status");
        stream.finish();
        let bytes = drain(rx).await;

        let text = String::from_utf8(bytes).expect("utf8");
        let marker_at = text.find(STATUS_PREFIX).expect("marker present");
        assert_eq!(&text[marker_at - 1..marker_at], "\n");
    }

    #[tokio::test]
    async fn failed_send_cancels_the_shared_token() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let token = CancellationToken::new();
        let mut stream = ReplyStream::new(tx, token.clone());

        assert!(stream.body("anyone there?").await.is_err());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn one_byte_chunking_matches_single_chunk_parsing() {
        let (mut stream, rx) = writer();
        stream.status("thinking").await.expect("status");
        stream.body("Here are two finds.\n").await.expect("body");
        stream.status("searching: 陶瓷杯").await.expect("status");
        stream.body("第二段 body text").await.expect("body");
        stream.finish();
        let bytes = drain(rx).await;

        let mut whole = ReplyStreamParser::new();
        let mut whole_events = whole.push(&bytes);
        whole_events.extend(whole.finish());

        let mut drip = ReplyStreamParser::new();
        let mut drip_events = Vec::new();
        for byte in &bytes {
            drip_events.extend(drip.push(std::slice::from_ref(byte)));
        }
        drip_events.extend(drip.finish());

        assert_eq!(statuses(&whole_events), statuses(&drip_events));
        assert_eq!(body(&whole_events), body(&drip_events));
        assert_eq!(statuses(&whole_events), vec!["thinking", "searching: 陶瓷杯"]);
        assert_eq!(body(&whole_events), "Here are two finds.\n第二段 body text");
    }

    #[test]
    fn padding_is_stripped_from_status_payloads() {
        let line = format!("{STATUS_PREFIX}selecting{}\n", " ".repeat(512));
        let mut parser = ReplyStreamParser::new();
        let events = parser.push(line.as_bytes());
        assert_eq!(events, vec![StreamEvent::Status("selecting".to_string())]);
    }

    #[test]
    fn marker_lookalike_inside_a_body_line_stays_body() {
        let mut parser = ReplyStreamParser::new();
        let mut events = parser.push(format!("prices like {STATUS_PREFIX} happen\n").as_bytes());
        events.extend(parser.finish());

        assert_eq!(statuses(&events), Vec::<String>::new());
        assert_eq!(body(&events), format!("prices like {STATUS_PREFIX} happen\n"));
    }

    #[test]
    fn partial_marker_at_line_start_is_held_then_resolved_as_body() {
        let mut parser = ReplyStreamParser::new();
        // "@@ST" could still become the marker: nothing may be released yet.
        assert!(parser.push(b"@@ST").is_empty());
        // "@@STOP" diverges, so the held bytes flush as body.
        let events = parser.push(b"OP now\n");
        assert_eq!(body(&events), "@@STOP now\n");
    }

    #[test]
    fn body_bytes_flow_without_waiting_for_a_newline() {
        let mut parser = ReplyStreamParser::new();
        let events = parser.push("streamed narra".as_bytes());
        assert_eq!(body(&events), "streamed narra");
    }

    #[test]
    fn truncated_status_line_flushes_on_finish() {
        let mut parser = ReplyStreamParser::new();
        assert!(parser.push(format!("{STATUS_PREFIX}cut off").as_bytes()).is_empty());
        let events = parser.finish();
        assert_eq!(events, vec![StreamEvent::Status("cut off".to_string())]);
    }
}
