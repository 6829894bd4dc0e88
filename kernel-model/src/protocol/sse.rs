use serde_json::Value;
use tracing::warn;

const DONE_SENTINEL: &str = "[DONE]";

/// Splits a byte stream into SSE `data:` payloads.
///
/// Bytes after the last newline stay buffered until the next read, so a JSON
/// object cut across network chunks is only parsed once its line is complete.
#[derive(Debug, Default)]
pub(crate) struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<u8>>();
            if let Some(payload) = data_payload(&line[..line.len() - 1]) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flushes a final line that arrived without a trailing newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches('\r');
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }
    Some(payload.to_string())
}

/// Parses one payload, logging and dropping it when it is not valid JSON.
pub(crate) fn parse_data_payload(payload: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => Some(value),
        Err(error) => {
            let preview = payload.chars().take(120).collect::<String>();
            warn!(%error, preview = %preview, "dropping malformed stream line");
            None
        }
    }
}
