//! Incremental SSE frame decoder for provider byte streams.
//!
//! Network chunks split frames arbitrarily; the decoder buffers bytes and
//! yields complete `data:` frames as they close (blank line).

use serde::de::DeserializeOwned;

/// One complete SSE data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub data: String,
}

impl SseFrame {
    /// Provider end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn try_parse<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_str(&self.data).ok()
    }
}

/// Stateful decoder; feed it raw chunks, collect complete frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push bytes; returns every frame completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();

        // Frames are separated by a blank line; tolerate \r\n line endings.
        while let Some(pos) = self.find_frame_end() {
            let raw: String = self.buffer.drain(..pos).collect();
            // Drop the separator itself.
            while self.buffer.starts_with('\n') || self.buffer.starts_with('\r') {
                self.buffer.remove(0);
            }
            let mut data = String::new();
            for line in raw.lines() {
                if let Some(value) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(value.trim_start());
                }
            }
            if !data.is_empty() {
                frames.push(SseFrame { data });
            }
        }
        frames
    }

    fn find_frame_end(&self) -> Option<usize> {
        let lf = self.buffer.find("\n\n");
        let crlf = self.buffer.find("\r\n\r\n");
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}
