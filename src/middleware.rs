//! Binds the fingerprinter, lookup policy, and stream adapter into the four
//! public operation shapes (`stream_text`, `generate_text`, `stream_object`,
//! `generate_object`) behind two facades: [`SemanticMemory`] (prompt
//! variant) and [`IntentMemory`] (intent variant).
//!
//! Grounded on `cache::mod::SemanticCacheService`: a facade over
//! lookup/store with a separately-tracked statistics snapshot, and the
//! teacher's own invariant that stream misses must not skew the general
//! hit/miss counters (kept here as dedicated `hits_stream_*`/`misses_stream`
//! counters alongside the non-stream ones).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{Config, LookupErrorPolicy};
use crate::error::Error;
use crate::fingerprint::{self, Call, Scope};
use crate::hooks::{self, StepEvent, StepHook, StepTag};
use crate::intent::{IntentExtractor, IntentOutcome};
use crate::kv::PayloadStore;
use crate::llm::{Chunk, GenerateResult, LanguageModel};
use crate::lookup::{self, HitKind, LookupResult};
use crate::stream::{self, ChunkStream};
use crate::vector::VectorIndex;

/// Snapshot of the running hit/miss counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub hits_exact: u64,
    pub hits_semantic: u64,
    pub misses: u64,
    pub hits_stream_exact: u64,
    pub hits_stream_semantic: u64,
    pub misses_stream: u64,
}

#[derive(Default)]
struct Stats {
    hits_exact: AtomicU64,
    hits_semantic: AtomicU64,
    misses: AtomicU64,
    hits_stream_exact: AtomicU64,
    hits_stream_semantic: AtomicU64,
    misses_stream: AtomicU64,
}

impl Stats {
    fn record_hit(&self, kind: HitKind, streaming: bool) {
        let counter = match (kind, streaming) {
            (HitKind::Exact, false) => &self.hits_exact,
            (HitKind::Semantic, false) => &self.hits_semantic,
            (HitKind::Exact, true) => &self.hits_stream_exact,
            (HitKind::Semantic, true) => &self.hits_stream_semantic,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self, streaming: bool) {
        let counter = if streaming { &self.misses_stream } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits_exact: self.hits_exact.load(Ordering::Relaxed),
            hits_semantic: self.hits_semantic.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hits_stream_exact: self.hits_stream_exact.load(Ordering::Relaxed),
            hits_stream_semantic: self.hits_stream_semantic.load(Ordering::Relaxed),
            misses_stream: self.misses_stream.load(Ordering::Relaxed),
        }
    }
}

/// Shared plumbing behind both public facades.
struct MemoryCore {
    config: Config,
    vector: Arc<dyn VectorIndex>,
    kv: Arc<dyn PayloadStore>,
    model: Arc<dyn LanguageModel>,
    stats: Stats,
    step_tx: Option<mpsc::UnboundedSender<StepEvent>>,
    hook: Option<StepHook>,
}

impl MemoryCore {
    fn emit(&self, event: StepEvent) {
        if let Some(hook) = &self.hook {
            hook(event.clone());
        }
        if let Some(tx) = &self.step_tx {
            let _ = tx.send(event);
        }
    }

    /// Resolve the embedding + lookup outcome for `(scope, text)`, honoring
    /// the configured fail-open/fail-closed policy for lookup errors.
    async fn resolve(
        &self,
        correlation_id: &str,
        scope: &Scope,
        text: &str,
    ) -> Result<(Option<Vec<f32>>, LookupResult), Error> {
        self.emit(StepEvent::new(correlation_id, StepTag::CacheCheckStart));
        match lookup::lookup(self.vector.as_ref(), self.kv.as_ref(), &self.config, scope, text).await {
            Ok((embedding, outcome)) => Ok((Some(embedding), outcome)),
            Err(err) => {
                self.emit(StepEvent::new(correlation_id, StepTag::CacheCheckError).with_error(err.to_string()));
                match self.config.lookup_error_policy {
                    LookupErrorPolicy::FailClosed => Err(err),
                    // A degraded lookup never had an embedding resolved; skip
                    // write-back entirely for this call rather than risk a
                    // payload with no matching vector entry (invariant 1).
                    LookupErrorPolicy::FailOpen => Ok((None, LookupResult::Miss)),
                }
            }
        }
    }

    async fn write_back(
        &self,
        correlation_id: &str,
        id: &str,
        scope: &Scope,
        text: &str,
        embedding: Option<Vec<f32>>,
        payload: Value,
    ) {
        let Some(embedding) = embedding else { return };

        self.emit(StepEvent::new(correlation_id, StepTag::CacheStoreStart).with_cache_id(id));
        match self.kv.setnx_lock(id).await {
            Ok(true) => {}
            Ok(false) => return, // another writer won the race; abort silently
            Err(err) => {
                tracing::error!(correlation_id, cache_id = id, error = %err, "failed to acquire write-back lock");
                self.emit(
                    StepEvent::new(correlation_id, StepTag::CacheStoreError).with_cache_id(id).with_error(err.to_string()),
                );
                return;
            }
        }

        // Payload before vector entry: the only tolerated inconsistency is a
        // dangling vector (handled by the lookup policy as a miss).
        let result: Result<(), Error> = async {
            self.kv.set(id, payload, self.config.ttl_secs).await?;
            let metadata = lookup::build_metadata(scope, text);
            self.vector
                .upsert(crate::vector::UpsertEntry { id: id.to_string(), vector: embedding, metadata })
                .await?;
            Ok(())
        }
        .await;

        let _ = self.kv.release_lock(id).await;

        match result {
            Ok(()) => self.emit(StepEvent::new(correlation_id, StepTag::CacheStoreComplete).with_cache_id(id)),
            Err(err) => {
                tracing::error!(correlation_id, cache_id = id, error = %err, "write-back failed");
                self.emit(
                    StepEvent::new(correlation_id, StepTag::CacheStoreError).with_cache_id(id).with_error(err.to_string()),
                );
            }
        }
    }

    /// When `config.debug` is set, trace the resolved cache id and scope-hash
    /// tuple at `debug` level. Never logs the fingerprinted text itself.
    fn log_scope_if_debug(&self, correlation_id: &str, id: &str, scope: &Scope) {
        if self.config.debug {
            tracing::debug!(
                correlation_id,
                cache_id = id,
                model = %scope.model,
                system_hash = %scope.system_hash,
                params_hash = %scope.params_hash,
                tools_hash = %scope.tools_hash,
                "resolved cache scope"
            );
        }
    }

    async fn generate(&self, correlation_id: &str, call: &Call, prefix: &str, text: &str) -> Result<GenerateResult, Error> {
        let scope = Scope::from_call(call);
        let id = fingerprint::composite_id(prefix, &scope, text);
        self.log_scope_if_debug(correlation_id, &id, &scope);
        let (embedding, outcome) = self.resolve(correlation_id, &scope, text).await?;

        match outcome {
            LookupResult::Hit { payload, info } => {
                self.emit(StepEvent::new(correlation_id, StepTag::CacheHit).with_cache_id(&id).with_score(info.score));
                self.stats.record_hit(info.kind, false);
                let mut result: GenerateResult = serde_json::from_value(payload)
                    .map_err(|e| Error::Kv(crate::error::KvError::Decode(e.to_string())))?;
                rehydrate_generate_result(&mut result);
                Ok(result)
            }
            LookupResult::Miss => {
                self.emit(StepEvent::new(correlation_id, StepTag::CacheMiss).with_cache_id(&id));
                self.stats.record_miss(false);

                self.emit(StepEvent::new(correlation_id, StepTag::GenerationStart));
                tracing::debug!(correlation_id, model = %call.model, "calling provider for generate");
                let result = self.model.generate(call).await.map_err(|e| {
                    tracing::warn!(correlation_id, error = %e, "provider generate call failed");
                    Error::Provider(e)
                })?;
                self.emit(StepEvent::new(correlation_id, StepTag::GenerationComplete));

                if result.finish_reason == "stop" {
                    let payload = serde_json::to_value(&result).unwrap_or(Value::Null);
                    self.write_back(correlation_id, &id, &scope, text, embedding, payload).await;
                }
                Ok(result)
            }
        }
    }

    async fn stream(&self, correlation_id: &str, call: &Call, prefix: &str, text: &str) -> Result<ChunkStream, Error> {
        let scope = Scope::from_call(call);
        let id = fingerprint::composite_id(prefix, &scope, text);
        self.log_scope_if_debug(correlation_id, &id, &scope);
        let (embedding, outcome) = self.resolve(correlation_id, &scope, text).await?;

        match outcome {
            LookupResult::Hit { payload, info } => {
                self.emit(StepEvent::new(correlation_id, StepTag::CacheHit).with_cache_id(&id).with_score(info.score));
                self.stats.record_hit(info.kind, true);
                let chunks = chunks_from_payload(&id, payload)?;
                Ok(stream::replay(chunks, self.config.simulate_stream))
            }
            LookupResult::Miss => {
                self.emit(StepEvent::new(correlation_id, StepTag::CacheMiss).with_cache_id(&id));
                self.stats.record_miss(true);

                self.emit(StepEvent::new(correlation_id, StepTag::GenerationStart));
                tracing::debug!(correlation_id, model = %call.model, "calling provider for stream");
                let live = self.model.stream(call).await.map_err(|e| {
                    tracing::warn!(correlation_id, error = %e, "provider stream call failed");
                    Error::Provider(e)
                })?;

                // Detached from the caller's point of view: the consumer sees
                // end-of-stream as soon as `live` ends; the store write below
                // runs after, on a spawned task, and never surfaces an error
                // to the stream.
                let core_for_writeback = self.clone_write_back_handles();
                let scope_for_writeback = scope.clone();
                let text_for_writeback = text.to_string();
                let id_for_writeback = id.clone();
                let correlation_id_for_writeback = correlation_id.to_string();

                let captured = stream::capture_and_record(live, move |chunks: Vec<Chunk>| {
                    if finished_normally(&chunks) {
                        tokio::spawn(async move {
                            let payload = serde_json::json!({ "streamParts": chunks });
                            core_for_writeback
                                .write_back(
                                    &correlation_id_for_writeback,
                                    &id_for_writeback,
                                    &scope_for_writeback,
                                    &text_for_writeback,
                                    embedding,
                                    payload,
                                )
                                .await;
                        });
                    }
                });
                Ok(captured)
            }
        }
    }

    /// A write-back-only clone: cheap because every field is already an
    /// `Arc`/`Copy`-able handle, used so the spawned write-back task does not
    /// need to borrow `self` past the stream's lifetime.
    fn clone_write_back_handles(&self) -> Arc<MemoryCore> {
        Arc::new(MemoryCore {
            config: self.config.clone(),
            vector: self.vector.clone(),
            kv: self.kv.clone(),
            model: self.model.clone(),
            stats: Stats::default(),
            step_tx: self.step_tx.clone(),
            hook: self.hook.clone(),
        })
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

fn finished_normally(chunks: &[Chunk]) -> bool {
    matches!(chunks.last(), Some(Chunk::Finish { .. }))
}

fn chunks_from_payload(id: &str, payload: Value) -> Result<Vec<Chunk>, Error> {
    if let Some(parts) = payload.get("streamParts") {
        return serde_json::from_value(parts.clone())
            .map_err(|e| Error::Kv(crate::error::KvError::Decode(e.to_string())));
    }
    // Legacy shape: {text, id, usage}.
    let result: GenerateResult =
        serde_json::from_value(payload).map_err(|e| Error::Kv(crate::error::KvError::Decode(e.to_string())))?;
    Ok(stream::synthesize_legacy_chunks(id, &result))
}

fn rehydrate_generate_result(result: &mut GenerateResult) {
    if let Some(Value::Object(map)) = &mut result.raw {
        if let Some(Value::String(ts)) = map.get("timestamp").cloned() {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(&ts) {
                map.insert("timestamp".to_string(), Value::Number(dt.timestamp_millis().into()));
            }
        }
    }
}

/// Configuration shared by both facades' constructors.
pub struct MemoryBuilder {
    config: Config,
    vector: Arc<dyn VectorIndex>,
    kv: Arc<dyn PayloadStore>,
    model: Arc<dyn LanguageModel>,
    hook: Option<StepHook>,
    step_tx: Option<mpsc::UnboundedSender<StepEvent>>,
}

impl MemoryBuilder {
    pub fn new(
        config: Config,
        vector: Arc<dyn VectorIndex>,
        kv: Arc<dyn PayloadStore>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self { config, vector, kv, model, hook: None, step_tx: None }
    }

    pub fn on_step_finish(mut self, hook: StepHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn step_event_channel(mut self, tx: mpsc::UnboundedSender<StepEvent>) -> Self {
        self.step_tx = Some(tx);
        self
    }

    fn build_core(self) -> MemoryCore {
        MemoryCore {
            config: self.config,
            vector: self.vector,
            kv: self.kv,
            model: self.model,
            stats: Stats::default(),
            step_tx: self.step_tx,
            hook: self.hook,
        }
    }

    /// `createSemanticMemory(cfg)`.
    pub fn build_semantic(self) -> SemanticMemory {
        SemanticMemory { core: self.build_core() }
    }

    /// `createIntentMemory(cfg)`.
    pub fn build_intent(self, extractor: Arc<dyn IntentExtractor>) -> IntentMemory {
        IntentMemory { core: self.build_core(), extractor }
    }
}

const PROMPT_PREFIX: &str = "llm:";
const INTENT_PREFIX: &str = "intent:";

/// Prompt-similarity memory: fingerprints the raw prompt.
pub struct SemanticMemory {
    core: MemoryCore,
}

impl SemanticMemory {
    fn text_for(&self, call: &Call) -> String {
        fingerprint::prompt_text(call, self.core.config.use_full_messages)
    }

    pub async fn generate_text(&self, call: &Call) -> Result<GenerateResult, Error> {
        let correlation_id = hooks::new_correlation_id();
        let text = self.text_for(call);
        self.core.generate(&correlation_id, call, PROMPT_PREFIX, &text).await
    }

    pub async fn stream_text(&self, call: &Call) -> Result<ChunkStream, Error> {
        let correlation_id = hooks::new_correlation_id();
        let text = self.text_for(call);
        self.core.stream(&correlation_id, call, PROMPT_PREFIX, &text).await
    }

    /// Object-mode calls share the exact same cache path as text-mode calls;
    /// the only difference is how the host framework parses the provider's
    /// result, which this crate never inspects.
    pub async fn generate_object(&self, call: &Call) -> Result<GenerateResult, Error> {
        self.generate_text(call).await
    }

    pub async fn stream_object(&self, call: &Call) -> Result<ChunkStream, Error> {
        self.stream_text(call).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats()
    }
}

/// Intent-similarity memory: extracts structured intent from a sliding
/// window, then fingerprints its canonical text.
pub struct IntentMemory {
    core: MemoryCore,
    extractor: Arc<dyn IntentExtractor>,
}

impl IntentMemory {
    async fn text_for(&self, correlation_id: &str, call: &Call) -> String {
        if call.messages.is_empty() {
            return fingerprint::normalize(&call.model);
        }
        self.core.emit(StepEvent::new(correlation_id, StepTag::IntentExtractionStart));
        let outcome = self.extractor.extract(&call.messages).await;

        let event = match &outcome {
            IntentOutcome::Extracted(intent) => {
                let payload = serde_json::to_value(intent).unwrap_or(Value::Null);
                StepEvent::new(correlation_id, StepTag::IntentExtractionComplete)
                    .with_user_intention(intent.intent.as_str())
                    .with_extracted_intent(payload)
            }
            IntentOutcome::FallenBack { intent, reason } => {
                let payload = serde_json::to_value(intent).unwrap_or(Value::Null);
                StepEvent::new(correlation_id, StepTag::IntentExtractionError)
                    .with_user_intention(intent.intent.as_str())
                    .with_extracted_intent(payload)
                    .with_error(reason.to_string())
            }
        };
        self.core.emit(event);

        fingerprint::normalize(&outcome.intent().canonical_text())
    }

    pub async fn generate_text(&self, call: &Call) -> Result<GenerateResult, Error> {
        let correlation_id = hooks::new_correlation_id();
        let text = self.text_for(&correlation_id, call).await;
        self.core.generate(&correlation_id, call, INTENT_PREFIX, &text).await
    }

    pub async fn stream_text(&self, call: &Call) -> Result<ChunkStream, Error> {
        let correlation_id = hooks::new_correlation_id();
        let text = self.text_for(&correlation_id, call).await;
        self.core.stream(&correlation_id, call, INTENT_PREFIX, &text).await
    }

    pub async fn generate_object(&self, call: &Call) -> Result<GenerateResult, Error> {
        self.generate_text(call).await
    }

    pub async fn stream_object(&self, call: &Call) -> Result<ChunkStream, Error> {
        self.stream_text(call).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats()
    }
}
