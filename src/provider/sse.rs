//! Incremental decoder for OpenAI-style chat completion streams.
//!
//! The wire format is SSE: `data: {json}` records separated by blank lines,
//! closed by a `data: [DONE]` sentinel. TCP framing can split a record
//! anywhere, including inside a multi-byte character, so the decoder buffers
//! raw bytes and only interprets whole lines. It understands the chat payload
//! itself and hands back typed [`ChatDelta`]s; callers never see raw JSON.

use serde::Deserialize;

/// One decoded unit of an OpenAI-compatible chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatDelta {
    /// A streamed content token.
    Token(String),
    /// The stream signalled completion: a `finish_reason` from the payload,
    /// or `None` for the bare `[DONE]` sentinel.
    Finished(Option<String>),
}

/// Shape of one streamed `/v1/chat/completions` record. Fields the relay
/// does not consume (ids, usage, model echo) are left to serde to drop.
#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// Streaming decoder for `/v1/chat/completions` SSE bodies.
#[derive(Debug, Default)]
pub struct ChatStreamDecoder {
    pending: Vec<u8>,
}

impl ChatStreamDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw network bytes, returning every delta they completed.
    ///
    /// Bytes after the last newline stay buffered until a later feed (or
    /// [`finish`](Self::finish)) completes their line.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ChatDelta> {
        self.pending.extend_from_slice(bytes);

        // Only the region up to the last newline holds complete lines.
        let cut = match self.pending.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return Vec::new(),
        };
        let tail = self.pending.split_off(cut + 1);
        let complete = std::mem::replace(&mut self.pending, tail);

        complete
            .split(|&b| b == b'\n')
            .filter_map(Self::decode_line)
            .collect()
    }

    /// Decode whatever remains after the stream ends, for servers that do
    /// not newline-terminate their final record.
    pub fn finish(&mut self) -> Vec<ChatDelta> {
        let rest = std::mem::take(&mut self.pending);
        rest.split(|&b| b == b'\n')
            .filter_map(Self::decode_line)
            .collect()
    }

    /// One SSE line → at most one delta. Lines other than `data:` fields
    /// (`event:` names, `:` keep-alive comments, blank separators) carry
    /// nothing the relay needs.
    fn decode_line(line: &[u8]) -> Option<ChatDelta> {
        let text = std::str::from_utf8(line).ok()?.trim();
        let payload = text.strip_prefix("data:")?.trim_start();

        if payload == "[DONE]" {
            return Some(ChatDelta::Finished(None));
        }

        let parsed: StreamPayload = serde_json::from_str(payload).ok()?;
        let choice = parsed.choices.into_iter().next()?;
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            return Some(ChatDelta::Token(content));
        }
        choice
            .finish_reason
            .map(|reason| ChatDelta::Finished(Some(reason)))
    }
}
