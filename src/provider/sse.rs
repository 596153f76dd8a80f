//! Server-sent event framing and the shared stream driver used by every adapter.

use futures::StreamExt;

use super::{ByteStream, DeltaStream};
use crate::error::{KestrelError, Result};
use crate::types::StreamDelta;

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental SSE decoder. Bytes may be split anywhere, including inside a
/// UTF-8 sequence or between `\r` and `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line)
                .map_err(|_| KestrelError::malformed("stream line is not valid UTF-8"))?;
            if let Some(event) = self.feed_line(&line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Result<Option<SseEvent>> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8(rest)
                .map_err(|_| KestrelError::malformed("stream line is not valid UTF-8"))?;
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.feed_line(&line) {
                return Ok(Some(event));
            }
        }
        Ok(self.dispatch())
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
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
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

/// What a wire-format parser made of one event.
#[derive(Debug, Default)]
pub(crate) struct ParseStep {
    pub deltas: Vec<StreamDelta>,
    /// The provider signalled the end of the response.
    pub done: bool,
}

impl ParseStep {
    pub fn deltas(deltas: Vec<StreamDelta>) -> Self {
        Self { deltas, done: false }
    }

    pub fn one(delta: StreamDelta) -> Self {
        Self::deltas(vec![delta])
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn done() -> Self {
        Self {
            deltas: Vec::new(),
            done: true,
        }
    }
}

/// Per-wire-format event interpreter.
pub(crate) trait StreamParser: Send + 'static {
    fn on_event(&mut self, event: &SseEvent) -> Result<ParseStep>;

    /// Whether a finish reason arrived, so a body closed without the explicit
    /// terminator still counts as a complete response.
    fn saw_finish(&self) -> bool;

    /// Final delta carrying finish reason and usage. Called once, after an
    /// explicit terminator or a finish reason.
    fn finish(&mut self) -> StreamDelta;
}

/// Turn raw body chunks into normalized deltas with `parser`.
///
/// The first error ends the stream. A body that closes before the provider
/// signalled completion is a malformed stream, not a short answer.
pub(crate) fn drive<P: StreamParser>(mut chunks: ByteStream, mut parser: P) -> DeltaStream {
    Box::pin(async_stream::stream! {
        let mut decoder = SseDecoder::new();
        let mut done = false;

        'outer: while let Some(chunk) = chunks.next().await {
            let events = match chunk.and_then(|bytes| decoder.push(&bytes)) {
                Ok(events) => events,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for event in events {
                match parser.on_event(&event) {
                    Ok(step) => {
                        for delta in step.deltas {
                            yield Ok(delta);
                        }
                        if step.done {
                            done = true;
                            break 'outer;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if !done {
            match decoder.finish() {
                Ok(Some(event)) => match parser.on_event(&event) {
                    Ok(step) => {
                        for delta in step.deltas {
                            yield Ok(delta);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
            if !parser.saw_finish() {
                yield Err(KestrelError::malformed("stream ended before completion"));
                return;
            }
        }

        yield Ok(parser.finish());
    })
}

/// Parse an event's data as JSON, mapping failures to a malformed-stream error.
pub(crate) fn json_data(event: &SseEvent) -> Result<serde_json::Value> {
    serde_json::from_str(&event.data).map_err(|e| {
        KestrelError::malformed(format!("malformed stream chunk ({e}): {}", truncate(&event.data)))
    })
}

fn truncate(data: &str) -> &str {
    let mut end = data.len().min(200);
    while !data.is_char_boundary(end) {
        end -= 1;
    }
    &data[..end]
}
