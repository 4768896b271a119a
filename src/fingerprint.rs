//! Turns a call into `(cache input text, scope tuple, composite id)`.
//!
//! Grounded on the gateway's own `cache::key` module: SHA-256 scope hashing,
//! a `"v1:"` version prefix, and whitespace-trimmed message flattening. The
//! difference here is that the call shape is the crate's own provider-agnostic
//! [`Message`]/[`Call`], not a concrete chat-completion request type, since
//! the LLM provider is an external collaborator rather than a vendored
//! adapter (see `vector.rs`/`kv.rs`).

use sha2::{Digest, Sha256};

use crate::config::Config;

/// One message in a conversation, already normalized to plain text content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The call options relevant to fingerprinting. Mirrors the fields a
/// chat-completion request actually varies on; anything provider-private
/// (request ids, headers) is intentionally absent.
#[derive(Debug, Clone)]
pub struct Call {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub tools_json: Option<String>,
}

/// Four-field scope tuple. Two calls share a scope iff all four fields are
/// byte-equal; scope is never approximated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub model: String,
    pub system_hash: String,
    pub params_hash: String,
    pub tools_hash: String,
}

impl Scope {
    pub fn from_call(call: &Call) -> Self {
        Scope {
            model: call.model.clone(),
            system_hash: system_prompt_hash(call),
            params_hash: params_hash(call),
            tools_hash: tools_hash(call),
        }
    }

    /// `join('|', S)` as described in the data model.
    fn joined(&self) -> String {
        format!("{}|{}|{}|{}", self.model, self.system_hash, self.params_hash, self.tools_hash)
    }
}

fn system_prompt_hash(call: &Call) -> String {
    let mut hasher = Sha256::new();
    for msg in &call.messages {
        if msg.role == Role::System {
            hasher.update(msg.content.trim().as_bytes());
            hasher.update(b";");
        }
    }
    format!("{:x}", hasher.finalize())
}

fn params_hash(call: &Call) -> String {
    let mut hasher = Sha256::new();
    if let Some(t) = call.temperature {
        let rounded = (t * 100.0).round() / 100.0;
        hasher.update(format!("{rounded:.2}").as_bytes());
    }
    hasher.update(b"|");
    if let Some(p) = call.top_p {
        let rounded = (p * 100.0).round() / 100.0;
        hasher.update(format!("{rounded:.2}").as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn tools_hash(call: &Call) -> String {
    let mut hasher = Sha256::new();
    if let Some(tools) = &call.tools_json {
        hasher.update(tools.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// `trim -> lowercase -> collapse runs of whitespace to single ASCII spaces`.
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = false;
    for ch in input.trim().chars() {
        let folded = ch.to_lowercase();
        for lower in folded {
            if lower.is_whitespace() {
                if !last_was_space {
                    out.push(' ');
                }
                last_was_space = true;
            } else {
                out.push(lower);
                last_was_space = false;
            }
        }
    }
    out.trim_end().to_string()
}

/// Prompt-similarity cache-input-text: the last message, or the whole
/// conversation when `use_full_messages` is set.
pub fn prompt_text(call: &Call, use_full_messages: bool) -> String {
    let raw = if use_full_messages {
        call.messages
            .iter()
            .map(|m| format!("{:?}:{}", m.role, m.content.trim()))
            .collect::<Vec<_>>()
            .join(";")
    } else {
        call.messages
            .last()
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default()
    };
    normalize(&raw)
}

/// `id = prefix + SHA256(join('|', S) + '|' + T)`, hex.
pub fn composite_id(prefix: &str, scope: &Scope, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.joined().as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    format!("{prefix}{:x}", hasher.finalize())
}

/// Whether a call should bypass the cache entirely, never reaching the
/// fingerprinter or write-back path.
pub fn should_skip(call: &Call, config: &Config) -> bool {
    if config.skip_tool_requests && call.tools_json.is_some() {
        return true;
    }
    config.skip_models.iter().any(|m| m == &call.model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_call() -> Call {
        Call {
            model: "gpt-4o-mini".into(),
            messages: vec![
                Message { role: Role::System, content: "Be terse.".into() },
                Message { role: Role::User, content: "What is an agent?".into() },
            ],
            temperature: Some(0.7),
            top_p: None,
            tools_json: None,
        }
    }

    #[test]
    fn same_scope_and_text_yield_same_id() {
        let a = sample_call();
        let b = sample_call();
        let scope_a = Scope::from_call(&a);
        let scope_b = Scope::from_call(&b);
        let text_a = prompt_text(&a, false);
        let text_b = prompt_text(&b, false);
        assert_eq!(composite_id("llm:", &scope_a, &text_a), composite_id("llm:", &scope_b, &text_b));
    }

    #[test]
    fn differing_temperature_changes_scope() {
        let mut a = sample_call();
        let mut b = sample_call();
        a.temperature = Some(0.2);
        b.temperature = Some(0.7);
        assert_ne!(Scope::from_call(&a), Scope::from_call(&b));
    }

    #[test]
    fn normalization_is_idempotent() {
        let input = "  What   Is\tAn Agent?  ";
        let once = normalize(input);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalization_lowercases_and_collapses_whitespace() {
        assert_eq!(normalize("  What is an agent?  "), "what is an agent?");
        assert_eq!(normalize("what   is\n\tan agent?"), "what is an agent?");
    }

    #[test]
    fn prompt_text_uses_last_message_by_default() {
        let call = sample_call();
        assert_eq!(prompt_text(&call, false), "what is an agent?");
    }

    #[test]
    fn skip_respects_skip_models_and_tool_requests() {
        let mut call = sample_call();
        call.tools_json = Some("[]".into());

        let cfg = crate::config::ConfigBuilder::new()
            .model("gpt-4o-mini")
            .vector_endpoint("https://vector.example", "tok")
            .kv_endpoint("https://kv.example", "tok")
            .skip_tool_requests(true)
            .build()
            .unwrap();
        assert!(should_skip(&call, &cfg));

        let cfg2 = crate::config::ConfigBuilder::new()
            .model("gpt-4o-mini")
            .vector_endpoint("https://vector.example", "tok")
            .kv_endpoint("https://kv.example", "tok")
            .skip_models(vec!["gpt-4o-mini".into()])
            .build()
            .unwrap();
        let plain_call = sample_call();
        assert!(should_skip(&plain_call, &cfg2));
    }
}

#[cfg(test)]
mod proptests {
    use super::normalize;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalize_is_idempotent(s in ".*") {
            let once = normalize(&s);
            let twice = normalize(&once);
            prop_assert_eq!(once, twice);
        }
    }
}
