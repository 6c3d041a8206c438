//! Chunk reassembly for streamed backend responses.
//!
//! Backends deliver their stream as arbitrarily fragmented bytes. A
//! [`Reassembler`] owns the partial state of exactly one response and turns
//! those bytes into complete [`Frame`]s using the framing its adapter
//! declared up front.

use super::error::ProviderError;
use tracing::{debug, warn};

/// Upper bound on frames extracted by a single `feed` call
pub const MAX_FRAMES_PER_FEED: usize = 512;

/// Literal some event streams send as their last data line
const TERMINAL_LITERAL: &str = "[DONE]";

/// One complete logical unit from a backend stream
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// Parse the payload as JSON
    pub fn json(&self) -> Result<serde_json::Value, ProviderError> {
        serde_json::from_str(&self.data).map_err(|e| {
            let preview: String = self.data.chars().take(120).collect();
            ProviderError::Protocol(format!("{} (unit: {})", e, preview))
        })
    }

    /// Format as SSE output for client
    pub fn to_sse_string(&self) -> String {
        let mut output = String::new();

        if let Some(ref event_type) = self.event {
            output.push_str(&format!("event: {}\n", event_type));
        }

        output.push_str(&format!("data: {}\n\n", self.data));
        output
    }
}

/// Wire framing of a backend stream, fixed per adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `event:` / `data:` lines (Server-Sent Events)
    EventStream,
    /// JSON objects back to back, optionally inside `[`/`]` and separated by
    /// commas or newlines
    ConcatenatedJson,
    /// A chunk that is one whole object is used as-is, anything else goes
    /// through the concatenated-object scanner
    DirectObject,
}

/// Brace-scanner state, kept across feeds so a split object is never rescanned
#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    pos: usize,
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

/// Request-scoped stream reassembler
#[derive(Debug)]
pub struct Reassembler {
    framing: Framing,
    buffer: Vec<u8>,
    scan: ScanState,
    pending_event: Option<String>,
    saw_terminal: bool,
    cap: usize,
    cap_hits: usize,
}

impl Reassembler {
    pub fn new(framing: Framing) -> Self {
        Self::with_cap(framing, MAX_FRAMES_PER_FEED)
    }

    pub fn with_cap(framing: Framing, cap: usize) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            scan: ScanState::default(),
            pending_event: None,
            saw_terminal: false,
            cap: cap.max(1),
            cap_hits: 0,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Whether the event-stream terminal literal has been seen
    pub fn saw_terminal_marker(&self) -> bool {
        self.saw_terminal
    }

    /// Number of feeds that stopped at the extraction cap
    pub fn cap_hits(&self) -> usize {
        self.cap_hits
    }

    /// Bytes held back waiting for the rest of a unit
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and extract every complete unit, up to the per-feed cap.
    /// Units left over by the cap are returned by later feeds or `finish`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        if self.framing == Framing::DirectObject && self.buffer.is_empty() {
            if let Some(frame) = direct_object(chunk) {
                return vec![frame];
            }
        }

        self.buffer.extend_from_slice(chunk);
        let frames = self.extract(self.cap);

        if frames.len() >= self.cap && self.has_complete_unit() {
            self.cap_hits += 1;
            warn!(
                "⚠️ Reassembler hit the {} units/feed cap, {} bytes deferred",
                self.cap,
                self.buffer.len()
            );
        }

        frames
    }

    /// Drain everything left at end of stream. A trailing event-stream line
    /// without newline is still honored; an unterminated object is dropped.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = self.extract(usize::MAX);

        if self.framing == Framing::EventStream && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            frames.extend(self.handle_line(&line));
        }

        if !self.buffer.iter().all(u8::is_ascii_whitespace) {
            warn!(
                "⚠️ Stream ended inside an unterminated unit ({} bytes dropped)",
                self.buffer.len()
            );
        }
        self.buffer.clear();
        self.scan = ScanState::default();

        frames
    }

    fn extract(&mut self, limit: usize) -> Vec<Frame> {
        match self.framing {
            Framing::EventStream => self.extract_lines(limit),
            Framing::ConcatenatedJson | Framing::DirectObject => self.extract_objects(limit),
        }
    }

    fn has_complete_unit(&self) -> bool {
        match self.framing {
            Framing::EventStream => self.buffer.contains(&b'\n'),
            Framing::ConcatenatedJson | Framing::DirectObject => {
                let mut cursor = self.scan;
                scan_object(&self.buffer, &mut cursor).is_some()
            }
        }
    }

    fn extract_lines(&mut self, limit: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut consumed = 0;

        while frames.len() < limit {
            let Some(offset) = self.buffer[consumed..].iter().position(|&b| b == b'\n') else {
                break;
            };
            let end = consumed + offset;
            let line = self.buffer[consumed..end].to_vec();
            consumed = end + 1;

            if let Some(frame) = self.handle_line(&line) {
                frames.push(frame);
            }
        }

        self.buffer.drain(..consumed);
        frames
    }

    fn handle_line(&mut self, raw: &[u8]) -> Option<Frame> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);

        if line.trim().is_empty() {
            // Blank line closes the current event
            self.pending_event = None;
            return None;
        }

        if line.starts_with(':') {
            // Comment / keep-alive
            return None;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            let payload = rest.trim();
            if payload.is_empty() {
                return None;
            }
            if payload == TERMINAL_LITERAL {
                self.saw_terminal = true;
                return None;
            }
            return Some(Frame {
                event: self.pending_event.clone(),
                data: payload.to_string(),
            });
        }

        if let Some(rest) = line.strip_prefix("event:") {
            self.pending_event = Some(rest.trim().to_string());
            return None;
        }

        // id:, retry: and anything unknown
        debug!("Ignoring event-stream line: {}", line);
        None
    }

    fn extract_objects(&mut self, limit: usize) -> Vec<Frame> {
        let mut frames = Vec::new();

        while frames.len() < limit {
            match scan_object(&self.buffer, &mut self.scan) {
                Some((start, end)) => {
                    frames.push(Frame::data(
                        String::from_utf8_lossy(&self.buffer[start..end]).into_owned(),
                    ));
                    self.scan = ScanState {
                        pos: end,
                        ..ScanState::default()
                    };
                }
                None => break,
            }
        }

        // Everything before the current object start (or scan position when
        // no object is open) is consumed: emitted units and separators.
        let consumed = self.scan.start.unwrap_or(self.scan.pos);
        self.buffer.drain(..consumed);
        self.scan.pos -= consumed;
        self.scan.start = self.scan.start.map(|s| s - consumed);

        if self.buffer.trim_ascii() == b"]" {
            self.buffer.clear();
            self.scan = ScanState::default();
        }

        frames
    }
}

/// Advance the scanner over `buf`, returning the span of the next complete
/// object. Braces inside strings never count; a backslash inside a string
/// consumes the following byte.
fn scan_object(buf: &[u8], state: &mut ScanState) -> Option<(usize, usize)> {
    while state.pos < buf.len() {
        let b = buf[state.pos];
        let i = state.pos;
        state.pos += 1;

        let Some(start) = state.start else {
            if b == b'{' {
                state.start = Some(i);
                state.depth = 1;
            }
            continue;
        };

        if state.in_string {
            if state.escaped {
                state.escaped = false;
            } else if b == b'\\' {
                state.escaped = true;
            } else if b == b'"' {
                state.in_string = false;
            }
            continue;
        }

        match b {
            b'"' => state.in_string = true,
            b'{' => state.depth += 1,
            b'}' => {
                state.depth -= 1;
                if state.depth == 0 {
                    return Some((start, state.pos));
                }
            }
            _ => {}
        }
    }
    None
}

fn direct_object(chunk: &[u8]) -> Option<Frame> {
    let trimmed = chunk.trim_ascii();
    if trimmed.first() != Some(&b'{') || trimmed.last() != Some(&b'}') {
        return None;
    }
    match serde_json::from_slice::<serde_json::Value>(trimmed) {
        Ok(value) if value.is_object() => {
            Some(Frame::data(String::from_utf8_lossy(trimmed).into_owned()))
        }
        _ => None,
    }
}
