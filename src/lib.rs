//! Semantic response cache middleware for LLM calls.
//!
//! Two variants share one core: [`SemanticMemory`] fingerprints the raw
//! prompt, [`IntentMemory`] first extracts a structured intent from a
//! sliding conversation window. Both expose the same four operation shapes
//! (`generate_text`, `stream_text`, `generate_object`, `stream_object`) and
//! are constructed through [`MemoryBuilder`].

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod hooks;
pub mod intent;
pub mod kv;
pub mod llm;
pub mod lookup;
pub mod middleware;
pub mod net;
pub mod stream;
pub mod vector;

pub use config::{CacheMode, Config, ConfigBuilder, LookupErrorPolicy};
pub use error::Error;
pub use fingerprint::{Call, Message, Role};
pub use hooks::{StepEvent, StepTag};
pub use llm::{Chunk, GenerateResult, LanguageModel};
pub use middleware::{IntentMemory, MemoryBuilder, SemanticMemory, StatsSnapshot};
