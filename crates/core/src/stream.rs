//! Incremental decoding of chat-endpoint server-sent events.
//!
//! Chunk boundaries from the transport do not line up with frame boundaries,
//! so bytes are buffered until a full line is available. Lines that are not
//! `data:` frames, and frames whose JSON does not parse, are skipped.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use crate::error::GenerationError;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// One step of a streamed completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamDelta {
    pub token: String,
    pub aggregate: String,
    pub is_final: bool,
}

impl StreamDelta {
    fn token(token: String, aggregate: &str) -> Self {
        Self {
            token,
            aggregate: aggregate.to_string(),
            is_final: false,
        }
    }

    fn finished(aggregate: &str) -> Self {
        Self {
            token: String::new(),
            aggregate: aggregate.to_string(),
            is_final: true,
        }
    }
}

/// Per-call stream state: undecoded bytes, text so far, and the done flag.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    pending: Vec<u8>,
    aggregate: String,
    done: bool,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(&self) -> &str {
        &self.aggregate
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one raw chunk, returning the token deltas of every complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamDelta> {
        if self.done {
            return Vec::new();
        }
        self.pending.extend_from_slice(chunk);

        let mut deltas = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(delta) = self.consume_line(&line) {
                deltas.push(delta);
            }
            if self.done {
                self.pending.clear();
                break;
            }
        }
        deltas
    }

    /// Flush any trailing partial line and mark the stream finished.
    pub fn finish(&mut self) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        if !self.done && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            if let Some(delta) = self.consume_line(&line) {
                deltas.push(delta);
            }
        }
        self.done = true;
        self.pending.clear();
        deltas.push(StreamDelta::finished(&self.aggregate));
        deltas
    }

    fn consume_line(&mut self, raw: &[u8]) -> Option<StreamDelta> {
        let line = String::from_utf8_lossy(raw);
        match parse_frame(line.trim()) {
            Frame::Done => {
                self.done = true;
                None
            }
            Frame::Token(token) => {
                self.aggregate.push_str(&token);
                Some(StreamDelta::token(token, &self.aggregate))
            }
            Frame::Skip => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Done,
    Token(String),
    Skip,
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

fn parse_frame(line: &str) -> Frame {
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return Frame::Skip;
    };
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Frame::Done;
    }

    let Ok(payload) = serde_json::from_str::<ChunkPayload>(data) else {
        return Frame::Skip;
    };
    payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty())
        .map(Frame::Token)
        .unwrap_or(Frame::Skip)
}

type ChunkStream<'a, B> = Pin<Box<dyn Stream<Item = Result<B, GenerationError>> + Send + 'a>>;

struct DeltaState<'a, B> {
    chunks: ChunkStream<'a, B>,
    aggregator: StreamAggregator,
    ready: VecDeque<StreamDelta>,
    finished: bool,
}

/// Lazily turn raw chunks into deltas. Single pass; ends with one `is_final`
/// delta after the sentinel or when the connection closes.
pub fn delta_stream<'a, S, B>(
    chunks: S,
) -> impl Stream<Item = Result<StreamDelta, GenerationError>> + Send + 'a
where
    S: Stream<Item = Result<B, GenerationError>> + Send + 'a,
    B: AsRef<[u8]> + Send + 'a,
{
    let state = DeltaState {
        chunks: Box::pin(chunks),
        aggregator: StreamAggregator::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.ready.pop_front() {
                return Some((Ok(delta), state));
            }
            if state.finished {
                return None;
            }
            if state.aggregator.is_done() {
                state.ready.extend(state.aggregator.finish());
                state.finished = true;
                continue;
            }

            match state.chunks.next().await {
                Some(Ok(chunk)) => {
                    let deltas = state.aggregator.push(chunk.as_ref());
                    state.ready.extend(deltas);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.ready.extend(state.aggregator.finish());
                    state.finished = true;
                }
            }
        }
    })
}

/// Drain a chunk stream, reporting each delta, and return the final text.
pub async fn collect_stream<'a, S, B, F>(chunks: S, mut on_delta: F) -> Result<String, GenerationError>
where
    S: Stream<Item = Result<B, GenerationError>> + Send + 'a,
    B: AsRef<[u8]> + Send + 'a,
    F: FnMut(&StreamDelta),
{
    let deltas = delta_stream(chunks);
    futures::pin_mut!(deltas);

    let mut aggregate = String::new();
    while let Some(delta) = deltas.next().await {
        let delta = delta?;
        on_delta(&delta);
        if delta.is_final {
            aggregate = delta.aggregate;
        }
    }
    Ok(aggregate)
}
