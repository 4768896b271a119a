//! Payload-store collaborator: get/set a JSON payload by id, with a
//! 15-second NX lock used to serialize write-back across concurrent misses
//! for the same composite id. REST client idiom follows `cache::embedder`
//! and `net::client::HttpClient`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;

use crate::config::RestEndpoint;
use crate::error::KvError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// NX lock TTL: long enough to cover a live provider call plus write-back,
/// short enough to self-heal quickly after a writer crash.
pub const LOCK_TTL_SECS: u64 = 15;

/// The payload-store collaborator contract.
pub trait PayloadStore: Send + Sync {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Value>, KvError>>;

    fn set<'a>(&'a self, id: &'a str, payload: Value, ttl_secs: i64) -> BoxFuture<'a, Result<(), KvError>>;

    /// Attempt to acquire `"lock:" + id` with NX semantics and a 15s expiry.
    /// Returns `true` iff this call acquired the lock.
    fn setnx_lock<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, KvError>>;

    fn release_lock<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), KvError>>;

    /// Remove every payload whose TTL has elapsed. Not scheduled by the
    /// crate itself; exposed for a host application's own sweep.
    fn evict_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, KvError>>;
}

/// Default REST-backed payload store (Upstash-Redis-style REST API: `GET`,
/// `POST` with `EX`/`NX` folded into the request body, `DELETE`).
pub struct RestPayloadStore {
    client: Client,
    endpoint: RestEndpoint,
}

impl RestPayloadStore {
    pub fn new(endpoint: RestEndpoint) -> Self {
        Self { client: crate::net::default_client(), endpoint }
    }
}

impl PayloadStore for RestPayloadStore {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Value>, KvError>> {
        Box::pin(async move {
            tracing::debug!(id, "getting payload");
            let resp = self
                .client
                .get(format!("{}/get/{id}", self.endpoint.url))
                .bearer_auth(&self.endpoint.token)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "get request failed");
                    KvError::Get(e.to_string())
                })?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                tracing::warn!(%status, "get request returned an error status");
                return Err(KvError::Get(format!("{status}: {text}")));
            }

            let body: Value = resp.json().await.map_err(|e| KvError::Decode(e.to_string()))?;
            match body.get("result") {
                None | Some(Value::Null) => Ok(None),
                Some(result) => {
                    let payload: Value = match result {
                        Value::String(s) => serde_json::from_str(s).map_err(|e| KvError::Decode(e.to_string()))?,
                        other => other.clone(),
                    };
                    Ok(Some(payload))
                }
            }
        })
    }

    fn set<'a>(&'a self, id: &'a str, payload: Value, ttl_secs: i64) -> BoxFuture<'a, Result<(), KvError>> {
        Box::pin(async move {
            tracing::debug!(id, ttl_secs, "setting payload");
            let body = serde_json::json!({ "value": payload, "ex": ttl_secs });
            let resp = self
                .client
                .post(format!("{}/set/{id}", self.endpoint.url))
                .bearer_auth(&self.endpoint.token)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "set request failed");
                    KvError::Set(e.to_string())
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                tracing::warn!(%status, "set request returned an error status");
                return Err(KvError::Set(format!("{status}: {text}")));
            }
            Ok(())
        })
    }

    fn setnx_lock<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            tracing::debug!(id, "attempting to acquire write-back lock");
            let lock_key = format!("lock:{id}");
            let body = serde_json::json!({ "value": "1", "nx": true, "ex": LOCK_TTL_SECS });
            let resp = self
                .client
                .post(format!("{}/set/{lock_key}", self.endpoint.url))
                .bearer_auth(&self.endpoint.token)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "setnx request failed");
                    KvError::Lock(e.to_string())
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                tracing::warn!(%status, "setnx request returned an error status");
                return Err(KvError::Lock(format!("{status}: {text}")));
            }

            let body: Value = resp.json().await.map_err(|e| KvError::Decode(e.to_string()))?;
            Ok(!matches!(body.get("result"), None | Some(Value::Null)))
        })
    }

    fn release_lock<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), KvError>> {
        Box::pin(async move {
            tracing::debug!(id, "releasing write-back lock");
            let lock_key = format!("lock:{id}");
            let resp = self
                .client
                .delete(format!("{}/del/{lock_key}", self.endpoint.url))
                .bearer_auth(&self.endpoint.token)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "release lock request failed");
                    KvError::Lock(e.to_string())
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                tracing::warn!(%status, "release lock request returned an error status");
                return Err(KvError::Lock(format!("{status}: {text}")));
            }
            Ok(())
        })
    }

    fn evict_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, KvError>> {
        // A REST KV store expires keys server-side; there's nothing for the
        // client to sweep. Present for trait parity with a host-managed store.
        Box::pin(async move { Ok(0) })
    }
}

struct Entry {
    payload: Value,
    expires_at: Instant,
}

struct LockEntry {
    expires_at: Instant,
}

/// In-memory fake used by the crate's own tests (and by callers' tests).
#[derive(Default)]
pub struct InMemoryPayloadStore {
    entries: std::sync::Mutex<HashMap<String, Entry>>,
    locks: std::sync::Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadStore for InMemoryPayloadStore {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Value>, KvError>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(id) {
                Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.payload.clone())),
                Some(_) => {
                    entries.remove(id);
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    fn set<'a>(&'a self, id: &'a str, payload: Value, ttl_secs: i64) -> BoxFuture<'a, Result<(), KvError>> {
        Box::pin(async move {
            let expires_at = Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64);
            self.entries.lock().unwrap().insert(id.to_string(), Entry { payload, expires_at });
            Ok(())
        })
    }

    fn setnx_lock<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let mut locks = self.locks.lock().unwrap();
            let now = Instant::now();
            if let Some(existing) = locks.get(id) {
                if existing.expires_at > now {
                    return Ok(false);
                }
            }
            locks.insert(id.to_string(), LockEntry { expires_at: now + Duration::from_secs(LOCK_TTL_SECS) });
            Ok(true)
        })
    }

    fn release_lock<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), KvError>> {
        Box::pin(async move {
            self.locks.lock().unwrap().remove(id);
            Ok(())
        })
    }

    fn evict_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, KvError>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().unwrap();
            let now = Instant::now();
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at > now);
            Ok((before - entries.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive() {
        let store = InMemoryPayloadStore::new();
        assert!(store.setnx_lock("llm:abc").await.unwrap());
        assert!(!store.setnx_lock("llm:abc").await.unwrap());
        store.release_lock("llm:abc").await.unwrap();
        assert!(store.setnx_lock("llm:abc").await.unwrap());
    }

    #[tokio::test]
    async fn get_after_set_round_trips() {
        let store = InMemoryPayloadStore::new();
        store.set("llm:abc", serde_json::json!({"text": "hi"}), 3600).await.unwrap();
        let got = store.get("llm:abc").await.unwrap();
        assert_eq!(got, Some(serde_json::json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let store = InMemoryPayloadStore::new();
        assert_eq!(store.get("llm:missing").await.unwrap(), None);
    }
}
