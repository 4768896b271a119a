//! Configuration for a semantic memory instance.
//!
//! Mirrors the gateway's own settings pattern: a struct with `#[serde(default)]`
//! sections, per-field defaults via free functions, and env-var overrides
//! tracked separately from the effective value so construction can report
//! *which* credential was missing rather than failing on the first gap found.

use std::collections::HashMap;

use crate::error::ConfigError;

/// Tracks which configuration fields were filled in from an environment
/// variable, for diagnostics (not serialized, not consulted for behavior).
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

/// Whether the cache is read-through (`Default`) or write-only (`Refresh`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    Refresh,
}

/// Whether a lookup-subsystem failure (embed/query/get) degrades to a live
/// call or is surfaced to the caller. See `SPEC_FULL.md` open question #1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupErrorPolicy {
    #[default]
    FailClosed,
    FailOpen,
}

/// Pacing for a replayed stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamSimulation {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub chunk_delay_ms: u64,
}

impl Default for StreamSimulation {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 0,
            chunk_delay_ms: 10,
        }
    }
}

/// REST credentials for a collaborator store.
#[derive(Debug, Clone)]
pub struct RestEndpoint {
    pub url: String,
    pub token: String,
}

impl RestEndpoint {
    fn from_env(url_var: &str, token_var: &str, overrides: &mut EnvOverrides, section: &str) -> Option<Self> {
        let url = std::env::var(url_var).ok()?;
        let token = std::env::var(token_var).ok()?;
        overrides.record(&format!("{section}.url"), url_var);
        overrides.record(&format!("{section}.token"), token_var);
        Some(Self { url, token })
    }
}

/// Settings for the intent-similarity variant's extraction step.
#[derive(Debug, Clone)]
pub struct IntentExtractorConfig {
    pub model: String,
    pub window_size: usize,
    pub prompt: Option<String>,
}

impl Default for IntentExtractorConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            window_size: 5,
            prompt: None,
        }
    }
}

/// Top-level configuration for `SemanticMemory` / `IntentMemory`.
#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub vector: RestEndpoint,
    pub kv: RestEndpoint,
    pub threshold: f32,
    pub ttl_secs: i64,
    pub debug: bool,
    pub cache_mode: CacheMode,
    pub simulate_stream: StreamSimulation,
    pub use_full_messages: bool,
    pub lookup_error_policy: LookupErrorPolicy,
    pub skip_models: Vec<String>,
    pub skip_tool_requests: bool,
    pub intent_extractor: Option<IntentExtractorConfig>,
    pub env_overrides: EnvOverrides,
}

/// Builder mirroring the gateway's pattern of optional fields resolved at
/// `build()` time against environment variables, with one aggregated error.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    model: Option<String>,
    vector: Option<RestEndpoint>,
    kv: Option<RestEndpoint>,
    threshold: Option<f32>,
    ttl_secs: Option<i64>,
    debug: bool,
    cache_mode: CacheMode,
    simulate_stream: StreamSimulation,
    use_full_messages: bool,
    lookup_error_policy: LookupErrorPolicy,
    skip_models: Vec<String>,
    skip_tool_requests: bool,
    intent_extractor: Option<IntentExtractorConfig>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn vector_endpoint(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.vector = Some(RestEndpoint { url: url.into(), token: token.into() });
        self
    }

    pub fn kv_endpoint(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.kv = Some(RestEndpoint { url: url.into(), token: token.into() });
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn ttl_secs(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn simulate_stream(mut self, simulation: StreamSimulation) -> Self {
        self.simulate_stream = simulation;
        self
    }

    pub fn use_full_messages(mut self, value: bool) -> Self {
        self.use_full_messages = value;
        self
    }

    pub fn lookup_error_policy(mut self, policy: LookupErrorPolicy) -> Self {
        self.lookup_error_policy = policy;
        self
    }

    pub fn skip_models(mut self, models: Vec<String>) -> Self {
        self.skip_models = models;
        self
    }

    pub fn skip_tool_requests(mut self, value: bool) -> Self {
        self.skip_tool_requests = value;
        self
    }

    pub fn intent_extractor(mut self, config: IntentExtractorConfig) -> Self {
        self.intent_extractor = Some(config);
        self
    }

    /// Resolve remaining required fields from the environment, then
    /// validate. Fails with one error listing every missing piece rather
    /// than the first one found.
    pub fn build(mut self) -> Result<Config, ConfigError> {
        let mut overrides = EnvOverrides::default();
        let mut missing = Vec::new();

        if self.vector.is_none() {
            self.vector = RestEndpoint::from_env("VECTOR_REST_URL", "VECTOR_REST_TOKEN", &mut overrides, "vector");
        }
        if self.kv.is_none() {
            self.kv = RestEndpoint::from_env("REDIS_REST_URL", "REDIS_REST_TOKEN", &mut overrides, "kv");
        }

        if self.model.is_none() {
            missing.push("model");
        }
        if self.vector.is_none() {
            missing.push("vector.url/token (or VECTOR_REST_URL/VECTOR_REST_TOKEN)");
        }
        if self.kv.is_none() {
            missing.push("kv.url/token (or REDIS_REST_URL/REDIS_REST_TOKEN)");
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingCredentials(missing.join(", ")));
        }

        let threshold = self.threshold.unwrap_or(0.92);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidThreshold(threshold));
        }

        let ttl_secs = self.ttl_secs.unwrap_or(14 * 24 * 3600);
        if ttl_secs <= 0 {
            return Err(ConfigError::InvalidTtl(ttl_secs));
        }

        if let Some(extractor) = &self.intent_extractor {
            if extractor.model.is_empty() {
                return Err(ConfigError::MissingIntentModel);
            }
        }

        Ok(Config {
            model: self.model.expect("checked above"),
            vector: self.vector.expect("checked above"),
            kv: self.kv.expect("checked above"),
            threshold,
            ttl_secs,
            debug: self.debug,
            cache_mode: self.cache_mode,
            simulate_stream: self.simulate_stream,
            use_full_messages: self.use_full_messages,
            lookup_error_policy: self.lookup_error_policy,
            skip_models: self.skip_models,
            skip_tool_requests: self.skip_tool_requests,
            intent_extractor: self.intent_extractor,
            env_overrides: overrides,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_everything_reports_all_of_it() {
        let err = ConfigBuilder::new().build().unwrap_err();
        match err {
            ConfigError::MissingCredentials(msg) => {
                assert!(msg.contains("model"));
                assert!(msg.contains("vector"));
                assert!(msg.contains("kv"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = ConfigBuilder::new()
            .model("gpt-4o-mini")
            .vector_endpoint("https://vector.example", "tok")
            .kv_endpoint("https://kv.example", "tok")
            .threshold(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold(_)));
    }

    #[test]
    fn rejects_non_positive_ttl() {
        let err = ConfigBuilder::new()
            .model("gpt-4o-mini")
            .vector_endpoint("https://vector.example", "tok")
            .kv_endpoint("https://kv.example", "tok")
            .ttl_secs(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTtl(_)));
    }

    #[test]
    fn builds_with_defaults() {
        let cfg = ConfigBuilder::new()
            .model("gpt-4o-mini")
            .vector_endpoint("https://vector.example", "tok")
            .kv_endpoint("https://kv.example", "tok")
            .build()
            .unwrap();
        assert_eq!(cfg.threshold, 0.92);
        assert_eq!(cfg.cache_mode, CacheMode::Default);
        assert!(cfg.simulate_stream.enabled);
    }
}
