//! Similarity-index collaborator: embed, query, upsert.
//!
//! The REST implementation follows `cache::embedder`'s shape (bearer-auth
//! reqwest POST, typed JSON response struct) extended to the vector store's
//! own `query`/`upsert` verbs, with credentials and timeouts borrowed from
//! `net::client::HttpClient`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RestEndpoint;
use crate::error::VectorError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One entry to upsert into the index.
#[derive(Debug, Clone, Serialize)]
pub struct UpsertEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Value,
}

/// One candidate returned by a query, before threshold/scope filtering.
#[derive(Debug, Clone, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// The similarity-index collaborator contract. Dyn-compatible: callers who
/// already run a vector database supply their own implementation instead of
/// the default REST client.
pub trait VectorIndex: Send + Sync {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, VectorError>>;

    fn query<'a>(
        &'a self,
        vector: &'a [f32],
        top_k: usize,
    ) -> BoxFuture<'a, Result<Vec<Candidate>, VectorError>>;

    fn upsert<'a>(&'a self, entry: UpsertEntry) -> BoxFuture<'a, Result<(), VectorError>>;
}

/// Default REST-backed vector index (Upstash-Vector-style: bearer-token
/// JSON over HTTPS).
pub struct RestVectorIndex {
    client: Client,
    endpoint: RestEndpoint,
    embedding_model: String,
}

impl RestVectorIndex {
    pub fn new(endpoint: RestEndpoint, embedding_model: impl Into<String>) -> Self {
        Self { client: crate::net::default_client(), endpoint, embedding_model: embedding_model.into() }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDataItem>,
}

#[derive(Deserialize)]
struct EmbeddingDataItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: Vec<Candidate>,
}

impl VectorIndex for RestVectorIndex {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, VectorError>> {
        Box::pin(async move {
            tracing::debug!(model = %self.embedding_model, chars = text.len(), "embedding text");
            let body = serde_json::json!({ "model": self.embedding_model, "input": text });
            let resp = self
                .client
                .post(format!("{}/embed", self.endpoint.url))
                .bearer_auth(&self.endpoint.token)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "embed request failed");
                    VectorError::Embed(e.to_string())
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                tracing::warn!(%status, "embed request returned an error status");
                return Err(VectorError::Embed(format!("{status}: {text}")));
            }

            let parsed: EmbeddingResponse =
                resp.json().await.map_err(|e| VectorError::Embed(e.to_string()))?;
            parsed
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| VectorError::Embed("empty embedding response".into()))
        })
    }

    fn query<'a>(
        &'a self,
        vector: &'a [f32],
        top_k: usize,
    ) -> BoxFuture<'a, Result<Vec<Candidate>, VectorError>> {
        Box::pin(async move {
            tracing::debug!(top_k, "querying vector index");
            let body = serde_json::json!({
                "vector": vector,
                "topK": top_k,
                "includeMetadata": true,
            });
            let resp = self
                .client
                .post(format!("{}/query", self.endpoint.url))
                .bearer_auth(&self.endpoint.token)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "query request failed");
                    VectorError::Query(e.to_string())
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                tracing::warn!(%status, "query request returned an error status");
                return Err(VectorError::Query(format!("{status}: {text}")));
            }

            let parsed: QueryResponse =
                resp.json().await.map_err(|e| VectorError::Query(e.to_string()))?;
            Ok(parsed.result)
        })
    }

    fn upsert<'a>(&'a self, entry: UpsertEntry) -> BoxFuture<'a, Result<(), VectorError>> {
        Box::pin(async move {
            tracing::debug!(id = %entry.id, "upserting vector entry");
            let resp = self
                .client
                .post(format!("{}/upsert", self.endpoint.url))
                .bearer_auth(&self.endpoint.token)
                .json(&entry)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "upsert request failed");
                    VectorError::Upsert(e.to_string())
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                tracing::warn!(%status, "upsert request returned an error status");
                return Err(VectorError::Upsert(format!("{status}: {text}")));
            }
            Ok(())
        })
    }
}

/// An in-memory fake used by the crate's own tests and available to callers
/// writing unit tests against `SemanticMemory`/`IntentMemory` without a
/// network dependency.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: std::sync::Mutex<HashMap<String, (Vec<f32>, Value)>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, VectorError>> {
        Box::pin(async move { Ok(fake_embedding(text)) })
    }

    fn query<'a>(
        &'a self,
        vector: &'a [f32],
        top_k: usize,
    ) -> BoxFuture<'a, Result<Vec<Candidate>, VectorError>> {
        Box::pin(async move {
            let entries = self.entries.lock().unwrap();
            let mut scored: Vec<Candidate> = entries
                .iter()
                .map(|(id, (vec, meta))| Candidate {
                    id: id.clone(),
                    score: Self::cosine(vector, vec),
                    metadata: Some(meta.clone()),
                })
                .collect();
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
            scored.truncate(top_k);
            Ok(scored)
        })
    }

    fn upsert<'a>(&'a self, entry: UpsertEntry) -> BoxFuture<'a, Result<(), VectorError>> {
        Box::pin(async move {
            self.entries.lock().unwrap().insert(entry.id, (entry.vector, entry.metadata));
            Ok(())
        })
    }
}

/// Deterministic bag-of-characters embedding: good enough for exercising
/// near-duplicate-text scenarios in tests without calling a real model.
pub fn fake_embedding(text: &str) -> Vec<f32> {
    let mut buckets = [0f32; 32];
    for byte in text.bytes() {
        buckets[(byte as usize) % 32] += 1.0;
    }
    let norm: f32 = buckets.iter().map(|b| b * b).sum::<f32>().sqrt();
    if norm > 0.0 {
        for b in &mut buckets {
            *b /= norm;
        }
    }
    buckets.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_index_finds_itself() {
        let index = InMemoryVectorIndex::new();
        let vec = fake_embedding("what is an agent?");
        index
            .upsert(UpsertEntry { id: "llm:abc".into(), vector: vec.clone(), metadata: serde_json::json!({}) })
            .await
            .unwrap();

        let results = index.query(&vec, 3).await.unwrap();
        assert_eq!(results[0].id, "llm:abc");
        assert!(results[0].score > 0.99);
    }
}
