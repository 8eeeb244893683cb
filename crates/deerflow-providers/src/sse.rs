//! Incremental SSE (Server-Sent Events) decoding.
//!
//! [`SseDecoder`] turns arbitrary text fragments into complete events and is
//! independent of any transport. [`parse_sse_stream`] drives it from a
//! `reqwest::Response` body.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Line-oriented SSE decoder that tolerates frames split across reads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: String,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fragment of the body; returns every event completed by it.
    pub fn feed(&mut self, fragment: &str) -> Vec<SseEvent> {
        self.pending.push_str(fragment);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let _ = self.line(rest.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(event)
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

struct SseState {
    bytes: ByteStream,
    decoder: SseDecoder,
    ready: VecDeque<SseEvent>,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    carry: Vec<u8>,
    done: bool,
}

impl SseState {
    fn feed_bytes(&mut self, chunk: &[u8]) {
        self.carry.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.carry.len(),
        };
        let head: Vec<u8> = self.carry.drain(..valid).collect();
        let text = String::from_utf8_lossy(&head);
        let events = self.decoder.feed(&text);
        self.ready.extend(events);
    }
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> {
    let state = SseState {
        bytes: Box::pin(response.bytes_stream()),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        carry: Vec::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.feed_bytes(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                }
                None => {
                    state.done = true;
                    if !state.carry.is_empty() {
                        let rest = std::mem::take(&mut state.carry);
                        let events = state.decoder.feed(&String::from_utf8_lossy(&rest));
                        state.ready.extend(events);
                    }
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
}
