// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

/// A decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Value of the `event:` field, when present.
    pub event: Option<String>,
    /// Concatenation of all `data:` lines, joined with `\n`.
    pub data: String,
    /// Last seen `id:` field.  Persists across events per the SSE spec.
    pub id: Option<String>,
    /// Value of the `retry:` field, when present and numeric.
    pub retry: Option<u64>,
}

/// One unit produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Event(SseEvent),
    /// The `data: [DONE]` terminator.
    Done,
}

/// Incremental SSE decoder.
///
/// Feed raw body chunks as they arrive; complete events are returned as soon
/// as their terminating blank line has been seen.  Partial lines (a chunk
/// split mid-line or mid-UTF-8 sequence) are carried in an internal buffer
/// until the rest arrives, so TCP chunk boundaries never corrupt an event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();

            if line.is_empty() {
                // Event boundary.  An event with an empty data buffer is not
                // dispatched (comment-only or field-only groups).
                if self.data_lines.is_empty() {
                    self.event = None;
                    self.retry = None;
                    continue;
                }
                let data = std::mem::take(&mut self.data_lines).join("\n");
                let event = self.event.take();
                let retry = self.retry.take();
                if data == "[DONE]" {
                    frames.push(SseFrame::Done);
                } else {
                    frames.push(SseFrame::Event(SseEvent {
                        event,
                        data,
                        id: self.id.clone(),
                        retry,
                    }));
                }
                continue;
            }

            if line.starts_with(':') {
                // Comment line.
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data_lines.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                "retry" => {
                    if let Ok(ms) = value.parse::<u64>() {
                        self.retry = Some(ms);
                    }
                }
                // Unknown fields are ignored per the SSE spec.
                _ => {}
            }
        }

        frames
    }
}

/// Encode an event back to the wire format.  Used by tests and the mock
/// server harness; `decode(encode(e)) == e` for well-formed events.
pub fn encode(event: &SseEvent) -> String {
    let mut out = String::new();
    if let Some(id) = &event.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    if let Some(retry) = event.retry {
        out.push_str(&format!("retry: {retry}\n"));
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
