//! Observability: a tagged step event per suspension point, plus an
//! optional batched background consumer for callers who would rather drain
//! a channel than run work inline in `onStepFinish`.
//!
//! The batching consumer is grounded on `budget::audit::spawn_audit_logger`:
//! an mpsc channel drained by a `tokio::select!` between `rx.recv()` and an
//! interval tick, flushing on either a full batch or a timer, and flushing
//! whatever remains when the sender is dropped.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

/// Tag identifying which suspension point produced a step event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTag {
    IntentExtractionStart,
    IntentExtractionComplete,
    IntentExtractionError,
    CacheCheckStart,
    CacheCheckError,
    CacheHit,
    CacheMiss,
    GenerationStart,
    GenerationComplete,
    CacheStoreStart,
    CacheStoreComplete,
    CacheStoreError,
}

/// One observability event, as described in `onStepFinish`. `correlation_id`
/// groups every event raised while serving a single `generate`/`stream`
/// call, mirroring `AuditEntry::request_id` in the gateway's own audit log.
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub correlation_id: String,
    pub step: StepTag,
    pub cache_id: Option<String>,
    pub user_intention: Option<String>,
    pub extracted_intent: Option<Value>,
    pub cache_score: Option<f32>,
    pub error: Option<String>,
}

impl StepEvent {
    pub fn new(correlation_id: impl Into<String>, step: StepTag) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            step,
            cache_id: None,
            user_intention: None,
            extracted_intent: None,
            cache_score: None,
            error: None,
        }
    }

    pub fn with_cache_id(mut self, id: impl Into<String>) -> Self {
        self.cache_id = Some(id.into());
        self
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.cache_score = Some(score);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_user_intention(mut self, intention: impl Into<String>) -> Self {
        self.user_intention = Some(intention.into());
        self
    }

    pub fn with_extracted_intent(mut self, value: Value) -> Self {
        self.extracted_intent = Some(value);
        self
    }
}

/// Generate a fresh per-call correlation id, the same way the gateway's own
/// audit log stamps each entry with `Uuid::new_v4().to_string()`.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Synchronous callback invoked once per step, mirroring `onStepFinish`.
pub type StepHook = std::sync::Arc<dyn Fn(StepEvent) + Send + Sync>;

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn a background task that drains `StepEvent`s from a channel and
/// invokes `sink` in batches, either when `BATCH_SIZE` accumulates or every
/// `FLUSH_INTERVAL`, whichever comes first. Remaining events are flushed
/// when the sender half is dropped.
pub fn spawn_step_logger(
    mut rx: mpsc::UnboundedReceiver<StepEvent>,
    sink: impl Fn(&[StepEvent]) + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<StepEvent> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(e) => {
                            buffer.push(e);
                            if buffer.len() >= BATCH_SIZE {
                                sink(&buffer);
                                buffer.clear();
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                sink(&buffer);
                            }
                            tracing::debug!("step logger shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        sink(&buffer);
                        buffer.clear();
                    }
                }
            }
        }
    })
}
