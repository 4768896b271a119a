//! Lookup policy: combine a similarity-score threshold with an exact scope
//! match, pick the first qualifying candidate, and fall through to a miss on
//! a dangling vector entry.
//!
//! Grounded on `cache::store`'s two-tier `lookup()` dispatch (iterate
//! candidates in descending-score order, reject on scope mismatch, treat an
//! absent payload as a miss rather than an error).

use serde_json::Value;

use crate::config::{CacheMode, Config};
use crate::error::Error;
use crate::fingerprint::Scope;
use crate::kv::PayloadStore;
use crate::vector::{Candidate, VectorIndex};

/// How a hit was produced, surfaced to observability hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    Exact,
    Semantic,
}

#[derive(Debug, Clone)]
pub struct HitInfo {
    pub kind: HitKind,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub enum LookupResult {
    Hit { payload: Value, info: HitInfo },
    Miss,
}

fn scope_matches(candidate_metadata: &Value, scope: &Scope) -> bool {
    let get = |key: &str| candidate_metadata.get(key).and_then(Value::as_str);
    get("model") == Some(scope.model.as_str())
        && get("system_hash") == Some(scope.system_hash.as_str())
        && get("params_hash") == Some(scope.params_hash.as_str())
        && get("tools_hash") == Some(scope.tools_hash.as_str())
}

/// Candidate metadata to attach to an upserted vector entry.
pub fn build_metadata(scope: &Scope, text: &str) -> Value {
    serde_json::json!({
        "model": scope.model,
        "system_hash": scope.system_hash,
        "params_hash": scope.params_hash,
        "tools_hash": scope.tools_hash,
        "text": text,
    })
}

/// Look up `id` via the vector index (embedding `text`) and the payload
/// store, applying the threshold + exact-scope + dangling-hit policy.
///
/// Returns the resolved embedding alongside the lookup result so a
/// subsequent miss-path write-back does not need to re-embed.
pub async fn lookup(
    vector: &dyn VectorIndex,
    kv: &dyn PayloadStore,
    config: &Config,
    scope: &Scope,
    text: &str,
) -> Result<(Vec<f32>, LookupResult), Error> {
    let embedding = vector.embed(text).await?;
    let candidates = vector.query(&embedding, 3).await?;

    for candidate in &candidates {
        if candidate.score < config.threshold {
            continue;
        }
        let Some(metadata) = &candidate.metadata else { continue };
        if !scope_matches(metadata, scope) {
            continue;
        }

        // First qualifying candidate: resolve it, then stop — even a
        // dangling hit here does not fall through to the next candidate.
        let payload = kv.get(&candidate.id).await?;
        return Ok(match payload {
            Some(payload) if config.cache_mode != CacheMode::Refresh => (
                embedding,
                LookupResult::Hit {
                    payload,
                    info: HitInfo { kind: kind_of(&candidate), score: candidate.score },
                },
            ),
            _ => (embedding, LookupResult::Miss),
        });
    }

    Ok((embedding, LookupResult::Miss))
}

fn kind_of(candidate: &Candidate) -> HitKind {
    if candidate.score >= 0.999 {
        HitKind::Exact
    } else {
        HitKind::Semantic
    }
}
