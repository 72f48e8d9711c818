//! Decoding of the backend's newline-delimited progress stream.

use std::collections::VecDeque;

use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::FlowError;
use crate::wire::{OperationFailure, ProgressEvent, StreamEvent, SuccessPayload, TerminalEvent};

pub type ByteChunk = Result<Vec<u8>, FlowError>;

pub(crate) const CONNECTION_LOST: &str = "connection lost";
pub(crate) const STREAM_TRUNCATED: &str = "stream ended before a result was reported";
const DEFAULT_FAILURE: &str = "operation failed";

/// Splits a byte stream into complete lines. The trailing partial line stays
/// buffered until a later chunk completes it or [`LineSplitter::finish`] is
/// called at end of stream.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
    scanned: usize,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.buffer[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            lines.push(strip_cr(&self.buffer[start..end]).to_vec());
            start = end + 1;
            cursor = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        lines
    }

    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(strip_cr(&rest).to_vec())
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parses one complete line. Returns `None` for anything that is not a
/// recognized event: blank or comment lines, malformed JSON, invalid UTF-8,
/// and objects without a known key.
pub fn parse_line(raw: &[u8]) -> Option<StreamEvent> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(err) => {
            debug!("skipping non-utf8 stream line: {err}");
            return None;
        }
    };
    let json = if let Some(rest) = line.strip_prefix("data:") {
        rest.strip_prefix(' ').unwrap_or(rest)
    } else if line.starts_with('{') {
        line
    } else {
        return None;
    };
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(fields)) => classify(fields),
        Ok(_) => None,
        Err(err) => {
            debug!("skipping malformed stream line: {err}");
            None
        }
    }
}

fn classify(fields: Map<String, Value>) -> Option<StreamEvent> {
    if let Some(error) = fields.get("error").filter(|value| truthy(value)) {
        let message = match error {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        return Some(terminal_error(OperationFailure::operation(message)));
    }

    match fields.get("success").and_then(Value::as_bool) {
        Some(true) => {
            return Some(StreamEvent::Terminal(TerminalEvent::Success(
                SuccessPayload::new(fields),
            )))
        }
        Some(false) => {
            let message = fields
                .get("message")
                .and_then(Value::as_str)
                .filter(|message| !message.trim().is_empty())
                .unwrap_or(DEFAULT_FAILURE);
            return Some(terminal_error(OperationFailure::operation(message)));
        }
        None => {}
    }

    let percent = fields.get("progress").and_then(Value::as_f64)?;
    let status_text = fields
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(StreamEvent::Progress(ProgressEvent {
        percent: percent.clamp(0.0, 100.0).round() as u8,
        status_text,
    }))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn terminal_error(failure: OperationFailure) -> StreamEvent {
    StreamEvent::Terminal(TerminalEvent::Error(failure))
}

/// Lazily turns a response body into progress events followed by exactly one
/// terminal event. Not restartable: once the terminal event is returned the
/// source is never polled again.
pub struct EventStreamReader<S> {
    source: S,
    splitter: LineSplitter,
    ready: VecDeque<StreamEvent>,
    source_done: bool,
    finished: bool,
}

impl<S> EventStreamReader<S>
where
    S: Stream<Item = ByteChunk> + Unpin,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            splitter: LineSplitter::default(),
            ready: VecDeque::new(),
            source_done: false,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(event) = self.ready.pop_front() {
                if matches!(event, StreamEvent::Terminal(_)) {
                    self.finish();
                }
                return Some(event);
            }
            if self.source_done {
                self.finish();
                return Some(terminal_error(OperationFailure::transport(STREAM_TRUNCATED)));
            }
            match self.source.next().await {
                Some(Ok(chunk)) => {
                    for line in self.splitter.push(&chunk) {
                        self.enqueue(&line);
                    }
                }
                Some(Err(err)) => {
                    warn!("progress stream failed: {err}");
                    self.finish();
                    return Some(terminal_error(OperationFailure::transport(CONNECTION_LOST)));
                }
                None => {
                    self.source_done = true;
                    if let Some(rest) = self.splitter.finish() {
                        self.enqueue(&rest);
                    }
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        futures_util::stream::unfold(self, |mut reader| async move {
            reader.next_event().await.map(|event| (event, reader))
        })
    }

    fn enqueue(&mut self, line: &[u8]) {
        if let Some(event) = parse_line(line) {
            self.ready.push_back(event);
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.ready.clear();
    }
}
