//! Minimal server-sent events decoder for upstream streaming responses.
//!
//! Only `data:` fields matter to the providers we talk to; `event:`, `id:`
//! and comment lines are ignored.

use crate::{Result, UpstreamError};
use futures::stream::{self, BoxStream, Stream, StreamExt};

#[derive(Default)]
struct Decoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl Decoder {
    /// Feed raw bytes, returning every event completed by them.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(event) = self.line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }

        events
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let event = self.data.join("\n");
        self.data.clear();
        Some(event)
    }

    /// Flush a trailing event that was not terminated by a blank line.
    fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest);
            let rest = rest.strip_suffix('\r').unwrap_or(&rest).to_string();
            if let Some(event) = self.line(&rest) {
                return Some(event);
            }
        }
        self.dispatch()
    }
}

struct DecodeState<B> {
    inner: BoxStream<'static, reqwest::Result<B>>,
    decoder: Decoder,
    pending: std::collections::VecDeque<String>,
    provider: &'static str,
    done: bool,
}

/// Turn an HTTP body stream into a stream of SSE `data` payloads.
///
/// The stream ends after the first transport error.
pub fn data_events<S, B>(body: S, provider: &'static str) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = DecodeState {
        inner: body.boxed(),
        decoder: Decoder::default(),
        pending: Default::default(),
        provider,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }

            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.pending.extend(state.decoder.feed(chunk.as_ref()));
                }
                Some(Err(e)) => {
                    state.done = true;
                    let err = UpstreamError::from_reqwest(state.provider, e);
                    return Some((Err(err.into()), state));
                }
                None => {
                    state.done = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
