//! The provider-agnostic seam for "the LLM actually doing the work".
//!
//! Grounded on `providers::traits::LlmProvider`: async methods return boxed
//! futures directly so the trait stays dyn-compatible (`Arc<dyn LanguageModel>`)
//! without pulling in `async_trait`. Unlike the gateway's trait, this one
//! does not know about a specific wire format — streaming and non-streaming
//! calls exchange the crate's own [`Chunk`]/[`GenerateResult`] shapes, since
//! framing a provider's native response is the embedding application's job,
//! not the cache's.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ProviderError;
use crate::fingerprint::Call;

/// One chunk of a streamed response. A chunk whose `type` isn't one the
/// cache recognizes is kept as `Other`, carrying the full raw object it was
/// decoded from — capture and replay must forward such chunks unchanged,
/// which a field-less catch-all variant cannot do.
///
/// `Serialize`/`Deserialize` are hand-written rather than derived: the
/// derive's `#[serde(other)]` catch-all only supports a unit variant, which
/// is exactly the shape this type needs to avoid.
#[derive(Debug, Clone)]
pub enum Chunk {
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    ResponseMetadata { timestamp: Option<Value> },
    Finish { finish_reason: String, usage: Option<Value> },
    Other(Value),
}

impl Chunk {
    fn to_value(&self) -> Value {
        match self {
            Chunk::TextStart { id } => serde_json::json!({ "type": "text-start", "id": id }),
            Chunk::TextDelta { id, delta } => {
                serde_json::json!({ "type": "text-delta", "id": id, "delta": delta })
            }
            Chunk::ResponseMetadata { timestamp } => {
                serde_json::json!({ "type": "response-metadata", "timestamp": timestamp })
            }
            Chunk::Finish { finish_reason, usage } => {
                serde_json::json!({ "type": "finish", "finish_reason": finish_reason, "usage": usage })
            }
            Chunk::Other(value) => value.clone(),
        }
    }

    fn from_value(value: Value) -> Self {
        let tag = value.get("type").and_then(Value::as_str);
        match tag {
            Some("text-start") => {
                if let Some(id) = value.get("id").and_then(Value::as_str) {
                    return Chunk::TextStart { id: id.to_string() };
                }
            }
            Some("text-delta") => {
                if let (Some(id), Some(delta)) =
                    (value.get("id").and_then(Value::as_str), value.get("delta").and_then(Value::as_str))
                {
                    return Chunk::TextDelta { id: id.to_string(), delta: delta.to_string() };
                }
            }
            Some("response-metadata") => {
                return Chunk::ResponseMetadata { timestamp: value.get("timestamp").cloned() };
            }
            Some("finish") => {
                if let Some(finish_reason) = value.get("finish_reason").and_then(Value::as_str) {
                    return Chunk::Finish {
                        finish_reason: finish_reason.to_string(),
                        usage: value.get("usage").cloned(),
                    };
                }
            }
            _ => {}
        }
        // Unrecognized type, or a recognized type missing a required field:
        // keep the whole object so capture/replay can still forward it.
        Chunk::Other(value)
    }
}

impl Serialize for Chunk {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Chunk {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(Chunk::from_value)
    }
}

/// Non-streaming call result. Carried through the cache verbatim.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GenerateResult {
    pub text: String,
    pub finish_reason: String,
    pub usage: Option<Value>,
    #[serde(default)]
    pub raw: Option<Value>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ChunkStream = Pin<Box<dyn futures::Stream<Item = Result<Chunk, ProviderError>> + Send>>;

/// An LLM capable of producing a live response, to be called on a cache miss.
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    fn generate(&self, call: &Call) -> BoxFuture<'_, Result<GenerateResult, ProviderError>>;

    fn stream(&self, call: &Call) -> BoxFuture<'_, Result<ChunkStream, ProviderError>>;
}
