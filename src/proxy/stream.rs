use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::trace;

/// Raw chunks of one streamed attempt plus the assistant text extracted from them.
///
/// Chunks are kept verbatim for replay. Text extraction reassembles SSE lines across
/// chunk boundaries; lines that still fail to parse are skipped.
#[derive(Debug, Default)]
pub struct StreamTranscript {
    chunks: Vec<Bytes>,
    buffered_bytes: usize,
    text: String,
    pending: Vec<u8>,
}

impl StreamTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.scan(&chunk);
        self.buffered_bytes = self.buffered_bytes.saturating_add(chunk.len());
        self.chunks.push(chunk);
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.consume_line(&line);
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }

    /// Only the newly appended bytes are searched; earlier bytes of `pending` hold no newline.
    fn scan(&mut self, chunk: &[u8]) {
        let mut pending = std::mem::take(&mut self.pending);
        let mut search_from = pending.len();
        pending.extend_from_slice(chunk);

        let mut line_start = 0;
        while let Some(rel) = pending[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + rel;
            self.consume_line(&pending[line_start..end]);
            line_start = end + 1;
            search_from = line_start;
        }
        pending.drain(..line_start);
        self.pending = pending;
    }

    fn consume_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        if let Some(content) = delta_content(line.trim_end_matches('\r')) {
            self.text.push_str(&content);
        }
    }
}

/// `choices[0].delta.content` of one `data:` record, if any.
fn delta_content(line: &str) -> Option<String> {
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim() == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(v) => v
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
            .map(str::to_owned),
        Err(err) => {
            trace!("skipping unparsable SSE line ({err}): {line}");
            None
        }
    }
}

/// Result of draining an attempt into a [`StreamTranscript`].
pub enum Drained<S, E> {
    Complete(StreamTranscript),
    /// Buffer ceiling hit; `rest` is the unread remainder of the upstream body.
    Overflow {
        transcript: StreamTranscript,
        rest: S,
    },
    Failed {
        transcript: StreamTranscript,
        error: E,
    },
}

/// Read `chunks` to the end (or until `limit` buffered bytes are exceeded).
pub async fn buffer_stream<S, E>(mut chunks: S, limit: Option<usize>) -> Drained<S, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut transcript = StreamTranscript::new();
    while let Some(item) = chunks.next().await {
        match item {
            Ok(chunk) => {
                transcript.push(chunk);
                if let Some(limit) = limit
                    && transcript.buffered_bytes() > limit
                {
                    return Drained::Overflow {
                        transcript,
                        rest: chunks,
                    };
                }
            }
            Err(error) => return Drained::Failed { transcript, error },
        }
    }
    transcript.finish();
    Drained::Complete(transcript)
}
