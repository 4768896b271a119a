//! Unified error taxonomy for the semantic cache.
//!
//! Each failing subsystem gets its own `thiserror` enum; [`Error`] aggregates
//! them via `#[from]` so callers can match on one type while call sites that
//! only touch one subsystem (e.g. a `VectorIndex` implementation) keep a
//! precise variant to construct and test against.

/// Configuration errors, surfaced synchronously when a memory is constructed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required credential(s): {0}")]
    MissingCredentials(String),

    #[error("similarity threshold must be in [0, 1], got {0}")]
    InvalidThreshold(f32),

    #[error("ttl must be positive, got {0}")]
    InvalidTtl(i64),

    #[error("intent extractor model is required when using the intent-similarity variant")]
    MissingIntentModel,
}

/// Errors from the vector-similarity-index collaborator.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("embedding request failed: {0}")]
    Embed(String),

    #[error("query request failed: {0}")]
    Query(String),

    #[error("upsert request failed: {0}")]
    Upsert(String),
}

/// Errors from the payload/KV-store collaborator.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("get request failed: {0}")]
    Get(String),

    #[error("set request failed: {0}")]
    Set(String),

    #[error("lock request failed: {0}")]
    Lock(String),

    #[error("payload failed to deserialize: {0}")]
    Decode(String),
}

/// Intent-extraction failures. These are always recovered locally (fallback
/// to the last message) and never escape to the caller; the variant exists
/// so the recovery path can log a specific cause.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("extractor model call failed: {0}")]
    ModelCall(String),

    #[error("no JSON object found in extractor output")]
    NoJsonFound,

    #[error("extractor output did not match the expected shape: {0}")]
    SchemaMismatch(String),
}

/// Errors from the underlying LLM provider. Bubbled through unchanged; no
/// write-back occurs when a live call fails with one of these.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider call failed: {0}")]
    Call(String),

    #[error("provider stream ended with an error: {0}")]
    Stream(String),
}

/// Top-level error type returned by the public memory API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("lookup error: {0}")]
    Vector(#[from] VectorError),

    #[error("lookup error: {0}")]
    Kv(#[from] KvError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
