//! Capture-and-replay stream adapter.
//!
//! On a miss, a pass-through transform records every chunk of the live
//! provider stream and flushes the recording on normal termination only —
//! never on error. On a hit, a previously recorded chunk sequence is
//! replayed as a lazy, paced stream so a consumer cannot distinguish a
//! cache hit from a live call. A chunk of a type the cache doesn't
//! recognize (`Chunk::Other`) carries its full raw payload, so it is
//! forwarded on capture and replayed verbatim rather than being dropped.
//!
//! Grounded on `net::sse::SseStream` (custom `Stream` framing) and
//! `kiro-gateway-rs::client`'s use of `async-stream`'s `try_stream!` macro to
//! build a boxed stream with ordinary `yield` statements instead of hand
//! written `poll_next` state machines.

use async_stream::stream;
use chrono::DateTime;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;

use crate::config::StreamSimulation;
use crate::error::ProviderError;
use crate::llm::{Chunk, GenerateResult};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, ProviderError>> + Send>>;

/// Wrap a live stream so every chunk is forwarded unchanged while being
/// appended to a buffer; `on_complete` fires with the full buffer exactly
/// once, only if the stream ends normally (not on an upstream error).
pub fn capture_and_record(
    mut inner: ChunkStream,
    on_complete: impl FnOnce(Vec<Chunk>) + Send + 'static,
) -> ChunkStream {
    let wrapped = stream! {
        let mut captured = Vec::new();
        let mut errored = false;

        while let Some(item) = inner.next().await {
            match item {
                Ok(chunk) => {
                    tracing::trace!(chunk = ?chunk, "read stream chunk from provider");
                    captured.push(chunk.clone());
                    yield Ok(chunk);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "provider stream ended with an error");
                    errored = true;
                    yield Err(err);
                    break;
                }
            }
        }

        if !errored {
            tracing::debug!(chunk_count = captured.len(), "captured stream chunks for write-back");
            on_complete(captured);
        }
    };
    Box::pin(wrapped)
}

/// Replay a previously captured chunk sequence, paced by `simulation`.
/// `response-metadata` chunks have their `timestamp` rehydrated from a
/// string into a timestamp value before being yielded.
pub fn replay(chunks: Vec<Chunk>, simulation: StreamSimulation) -> ChunkStream {
    let wrapped = stream! {
        if simulation.enabled && simulation.initial_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(simulation.initial_delay_ms)).await;
        }

        let mut first = true;
        for chunk in chunks {
            if !first && simulation.enabled && simulation.chunk_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(simulation.chunk_delay_ms)).await;
            }
            first = false;
            yield Ok(rehydrate_timestamp(chunk));
        }
    };
    Box::pin(wrapped)
}

fn rehydrate_timestamp(chunk: Chunk) -> Chunk {
    match chunk {
        Chunk::ResponseMetadata { timestamp: Some(Value::String(ts)) } => {
            let rehydrated = DateTime::parse_from_rfc3339(&ts)
                .map(|dt| Value::Number(dt.timestamp_millis().into()))
                .unwrap_or(Value::String(ts));
            Chunk::ResponseMetadata { timestamp: Some(rehydrated) }
        }
        other => other,
    }
}

/// Synthesize `[text-start, text-delta, finish]` from a legacy
/// `{text, id, usage}` payload shape, per the open question on replay ids:
/// the `id` is always the deterministic cache id, never a placeholder.
pub fn synthesize_legacy_chunks(id: &str, result: &GenerateResult) -> Vec<Chunk> {
    vec![
        Chunk::TextStart { id: id.to_string() },
        Chunk::TextDelta { id: id.to_string(), delta: result.text.clone() },
        Chunk::Finish { finish_reason: result.finish_reason.clone(), usage: result.usage.clone() },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn chunk_stream(chunks: Vec<Result<Chunk, ProviderError>>) -> ChunkStream {
        Box::pin(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn capture_forwards_every_chunk_unchanged() {
        let chunks = vec![
            Ok(Chunk::TextStart { id: "x".into() }),
            Ok(Chunk::TextDelta { id: "x".into(), delta: "hi".into() }),
            Ok(Chunk::Finish { finish_reason: "stop".into(), usage: None }),
        ];
        let captured = Arc::new(Mutex::new(None));
        let captured_clone = captured.clone();

        let mut out = capture_and_record(chunk_stream(chunks), move |buf| {
            *captured_clone.lock().unwrap() = Some(buf);
        });

        let mut seen = Vec::new();
        while let Some(item) = out.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(captured.lock().unwrap().as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn capture_does_not_flush_on_error() {
        let chunks = vec![
            Ok(Chunk::TextStart { id: "x".into() }),
            Err(ProviderError::Stream("boom".into())),
        ];
        let captured = Arc::new(Mutex::new(None));
        let captured_clone = captured.clone();

        let mut out = capture_and_record(chunk_stream(chunks), move |buf| {
            *captured_clone.lock().unwrap() = Some(buf);
        });

        let mut saw_error = false;
        while let Some(item) = out.next().await {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(captured.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_preserves_chunk_order_and_content() {
        let chunks = vec![
            Chunk::TextStart { id: "llm:abc".into() },
            Chunk::TextDelta { id: "llm:abc".into(), delta: "an agent is...".into() },
            Chunk::Finish { finish_reason: "stop".into(), usage: None },
        ];
        let mut out = replay(chunks.clone(), StreamSimulation { enabled: false, initial_delay_ms: 0, chunk_delay_ms: 0 });

        let mut seen = Vec::new();
        while let Some(item) = out.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen.len(), chunks.len());
        match &seen[1] {
            Chunk::TextDelta { delta, .. } => assert_eq!(delta, "an agent is..."),
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn legacy_synthesis_uses_the_cache_id_not_a_placeholder() {
        let result = GenerateResult { text: "hi".into(), finish_reason: "stop".into(), usage: None, raw: None };
        let chunks = synthesize_legacy_chunks("llm:deadbeef", &result);
        match &chunks[0] {
            Chunk::TextStart { id } => assert_eq!(id, "llm:deadbeef"),
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn rehydrates_rfc3339_timestamp_string_to_a_number() {
        let chunk = Chunk::ResponseMetadata { timestamp: Some(Value::String("2024-01-01T00:00:00Z".into())) };
        let rehydrated = rehydrate_timestamp(chunk);
        match rehydrated {
            Chunk::ResponseMetadata { timestamp: Some(Value::Number(_)) } => {}
            other => panic!("expected a numeric timestamp, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_and_replay_forward_an_unknown_chunk_type_unchanged() {
        let raw = serde_json::json!({ "type": "tool-call", "toolCallId": "abc", "toolName": "search" });
        let chunks = vec![Ok(Chunk::Other(raw.clone()))];
        let captured = Arc::new(Mutex::new(None));
        let captured_clone = captured.clone();

        let mut out = capture_and_record(chunk_stream(chunks), move |buf| {
            *captured_clone.lock().unwrap() = Some(buf);
        });
        while out.next().await.is_some() {}

        let recorded = captured.lock().unwrap().take().unwrap();
        match &recorded[0] {
            Chunk::Other(value) => assert_eq!(value, &raw),
            other => panic!("expected Other, got {other:?}"),
        }

        let mut replayed = replay(recorded, StreamSimulation { enabled: false, initial_delay_ms: 0, chunk_delay_ms: 0 });
        let first = replayed.next().await.unwrap().unwrap();
        match first {
            Chunk::Other(value) => assert_eq!(value, raw),
            other => panic!("expected Other, got {other:?}"),
        }
    }

    #[test]
    fn chunk_round_trips_through_json_for_an_unknown_type() {
        let raw = serde_json::json!({ "type": "reasoning", "text": "thinking..." });
        let chunk: Chunk = serde_json::from_value(raw.clone()).unwrap();
        match &chunk {
            Chunk::Other(value) => assert_eq!(value, &raw),
            other => panic!("expected Other, got {other:?}"),
        }
        assert_eq!(serde_json::to_value(&chunk).unwrap(), raw);
    }
}
