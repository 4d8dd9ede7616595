// Copyright 2026 The Towline Project
// SPDX-License-Identifier: Apache-2.0

// Event-stream decoder.
//
// The completion endpoint answers with a line-delimited event stream:
// `data: {json}` lines carrying text deltas, terminated by the literal
// `data: [DONE]`. Network chunks can split lines anywhere, including
// inside the `data: ` prefix and inside a multi-byte scalar, so the
// decoder buffers the trailing partial line between feeds.

/// Stream terminator payload.
const DONE_TOKEN: &str = "[DONE]";

/// Event line prefix. Exactly these six bytes; `data:` without the
/// space is not a data line on this wire.
const DATA_PREFIX: &str = "data: ";

/// A decoded unit handed to the forwarding side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// A non-empty piece of response text, in arrival order.
    Text(String),
    /// The stream terminator was seen; no further fragments follow.
    EndOfStream,
}

/// Incremental decoder for one response stream.
///
/// One decoder per outbound request. `feed` never blocks and performs
/// no I/O; fragments come back in decode order.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    /// Bytes of the trailing partial line, carried across feeds.
    pending: Vec<u8>,
    /// Latched once the terminator is seen. Later feeds decode nothing.
    finished: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` terminator has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume one network chunk and return the fragments it completed.
    ///
    /// The chunk boundary carries no meaning: any split of the same byte
    /// stream decodes to the same fragment sequence.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Fragment> {
        if self.finished {
            return Vec::new();
        }

        self.pending.extend_from_slice(chunk);

        let mut fragments = Vec::new();
        let mut consumed = 0;

        while let Some(rel) = self.pending[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + rel;
            let mut line_end = end;
            if line_end > consumed && self.pending[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            // Owned so the buffer can be truncated on the terminator path.
            let line = String::from_utf8_lossy(&self.pending[consumed..line_end]).into_owned();
            consumed = end + 1;

            if line.is_empty() {
                continue;
            }
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                // Comments, keepalives, other event fields.
                continue;
            };
            if payload == DONE_TOKEN {
                fragments.push(Fragment::EndOfStream);
                self.finished = true;
                self.pending.clear();
                return fragments;
            }

            let json: serde_json::Value = match serde_json::from_str(payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, len = payload.len(), "skipping malformed event line");
                    continue;
                }
            };
            if let Some(text) = json
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|choice| choice.get("delta"))
                .and_then(|delta| delta.get("content"))
                .and_then(|content| content.as_str())
            {
                if !text.is_empty() {
                    fragments.push(Fragment::Text(text.to_string()));
                }
            }
        }

        self.pending.drain(..consumed);
        fragments
    }
}
