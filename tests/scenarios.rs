//! End-to-end scenarios against in-memory fakes of every external
//! collaborator: no network or real database is touched here.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use semantic_memory::config::ConfigBuilder;
use semantic_memory::fingerprint::{Call, Message, Role};
use semantic_memory::kv::InMemoryPayloadStore;
use semantic_memory::llm::{Chunk, GenerateResult, LanguageModel};
use semantic_memory::vector::InMemoryVectorIndex;
use semantic_memory::MemoryBuilder;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Turns on `tracing` output for the debug-gated traces exercised below;
/// harmless to call more than once since only the first `try_init` wins.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("debug").try_init();
}

/// A fake model that counts how many times it was actually invoked, so
/// tests can assert a cache hit skipped the live call entirely.
struct CountingModel {
    calls: AtomicUsize,
    canned_text: String,
}

impl CountingModel {
    fn new(canned_text: impl Into<String>) -> Self {
        Self { calls: AtomicUsize::new(0), canned_text: canned_text.into() }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LanguageModel for CountingModel {
    fn model_id(&self) -> &str {
        "fake-model"
    }

    fn generate(&self, _call: &Call) -> BoxFuture<'_, Result<GenerateResult, semantic_memory::error::ProviderError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(GenerateResult {
                text: self.canned_text.clone(),
                finish_reason: "stop".into(),
                usage: None,
                raw: None,
            })
        })
    }

    fn stream(
        &self,
        _call: &Call,
    ) -> BoxFuture<'_, Result<semantic_memory::stream::ChunkStream, semantic_memory::error::ProviderError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = "fake-stream-id".to_string();
        let text = self.canned_text.clone();
        Box::pin(async move {
            let chunks: Vec<Result<Chunk, semantic_memory::error::ProviderError>> = vec![
                Ok(Chunk::TextStart { id: id.clone() }),
                Ok(Chunk::TextDelta { id: id.clone(), delta: text }),
                Ok(Chunk::Finish { finish_reason: "stop".into(), usage: None }),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)) as semantic_memory::stream::ChunkStream)
        })
    }
}

fn user_call(model: &str, text: &str, temperature: f32) -> Call {
    Call {
        model: model.to_string(),
        messages: vec![Message { role: Role::User, content: text.to_string() }],
        temperature: Some(temperature),
        top_p: None,
        tools_json: None,
    }
}

fn build_memory(model: Arc<CountingModel>) -> semantic_memory::SemanticMemory {
    let config = ConfigBuilder::new()
        .model("fake-model")
        .vector_endpoint("https://vector.example", "tok")
        .kv_endpoint("https://kv.example", "tok")
        .build()
        .unwrap();
    MemoryBuilder::new(config, Arc::new(InMemoryVectorIndex::new()), Arc::new(InMemoryPayloadStore::new()), model)
        .build_semantic()
}

#[tokio::test]
async fn exact_reask_hits_and_skips_the_live_model() {
    init_tracing();
    let model = Arc::new(CountingModel::new("an agent is a program that acts on your behalf."));
    let memory = build_memory(model.clone());

    let call = user_call("fake-model", "What is an agent?", 0.7);
    let first = memory.generate_text(&call).await.unwrap();
    assert_eq!(model.call_count(), 1);

    let second = memory.generate_text(&call).await.unwrap();
    assert_eq!(model.call_count(), 1, "second call should hit cache, not the live model");
    assert_eq!(first.text, second.text);

    let stats = memory.stats();
    assert_eq!(stats.hits_exact + stats.hits_semantic, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn near_paraphrase_above_threshold_hits() {
    let model = Arc::new(CountingModel::new("an agent is a program that acts on your behalf."));
    let memory = build_memory(model.clone());

    let first_call = user_call("fake-model", "What is an agent?", 0.7);
    memory.generate_text(&first_call).await.unwrap();
    assert_eq!(model.call_count(), 1);

    // Different wording, same scope: the bag-of-characters embeddings land
    // above the default 0.92 threshold without the fingerprinted text being
    // byte-identical, so this exercises the semantic path, not exact-hash.
    let paraphrase_call = user_call("fake-model", "What exactly is an agent?", 0.7);
    memory.generate_text(&paraphrase_call).await.unwrap();
    assert_eq!(model.call_count(), 1, "a near-paraphrase above threshold should still hit cache");

    let stats = memory.stats();
    assert_eq!(stats.hits_semantic, 1, "the second call should register as a semantic, not exact, hit");
}

#[tokio::test]
async fn scope_mismatch_on_temperature_forces_a_live_call() {
    let model = Arc::new(CountingModel::new("an agent is a program that acts on your behalf."));
    let memory = build_memory(model.clone());

    let call_a = user_call("fake-model", "What is an agent?", 0.2);
    let call_b = user_call("fake-model", "What is an agent?", 0.9);

    memory.generate_text(&call_a).await.unwrap();
    memory.generate_text(&call_b).await.unwrap();

    assert_eq!(model.call_count(), 2, "differing temperature must not share a cache entry");
}

#[tokio::test]
async fn refresh_mode_always_calls_the_live_model() {
    let model = Arc::new(CountingModel::new("an agent is a program that acts on your behalf."));
    let config = ConfigBuilder::new()
        .model("fake-model")
        .vector_endpoint("https://vector.example", "tok")
        .kv_endpoint("https://kv.example", "tok")
        .cache_mode(semantic_memory::CacheMode::Refresh)
        .build()
        .unwrap();
    let memory = MemoryBuilder::new(
        config,
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(InMemoryPayloadStore::new()),
        model.clone(),
    )
    .build_semantic();

    let call = user_call("fake-model", "What is an agent?", 0.7);
    memory.generate_text(&call).await.unwrap();
    memory.generate_text(&call).await.unwrap();

    assert_eq!(model.call_count(), 2, "refresh mode must bypass the cached entry on read");
}

#[tokio::test]
async fn concurrent_writers_for_the_same_id_produce_exactly_one_winner() {
    use semantic_memory::kv::PayloadStore;

    let kv = Arc::new(InMemoryPayloadStore::new());
    let id = "llm:shared";

    let mut handles = Vec::new();
    for _ in 0..8 {
        let kv = kv.clone();
        handles.push(tokio::spawn(async move { kv.setnx_lock(id).await.unwrap() }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1, "exactly one of the concurrent lock attempts should win the race");
}

#[tokio::test]
async fn concurrent_cache_misses_leave_the_store_consistent() {
    let model = Arc::new(CountingModel::new("an agent is a program that acts on your behalf."));
    let memory = Arc::new(build_memory(model.clone()));
    let call = user_call("fake-model", "What is an agent?", 0.7);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let memory = memory.clone();
        let call = call.clone();
        handles.push(tokio::spawn(async move { memory.generate_text(&call).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // However many of the concurrent misses raced the live model, a
    // subsequent call must observe a consistent, single cache entry.
    let follow_up = memory.generate_text(&call).await.unwrap();
    assert_eq!(follow_up.text, "an agent is a program that acts on your behalf.");
    assert!(model.call_count() >= 1 && model.call_count() <= 6);
}

#[tokio::test]
async fn stream_text_replays_the_captured_chunk_sequence_on_a_hit() {
    use futures::StreamExt;

    let model = Arc::new(CountingModel::new("an agent is a program that acts on your behalf."));
    let memory = build_memory(model.clone());
    let call = user_call("fake-model", "What is an agent?", 0.7);

    let mut first_stream = memory.stream_text(&call).await.unwrap();
    let mut first_chunks = Vec::new();
    while let Some(item) = first_stream.next().await {
        first_chunks.push(item.unwrap());
    }
    assert_eq!(model.call_count(), 1);

    // Give the detached write-back task a chance to land before replaying.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut second_stream = memory.stream_text(&call).await.unwrap();
    let mut second_chunks = Vec::new();
    while let Some(item) = second_stream.next().await {
        second_chunks.push(item.unwrap());
    }

    assert_eq!(model.call_count(), 1, "replay must not invoke the live model again");
    assert_eq!(first_chunks.len(), second_chunks.len());
}
