//! Structured intent extraction for the intent-similarity cache variant.
//!
//! A sliding window of the conversation is summarized by a small LLM into
//! `{intent, domain[], stack[], goal, constraints[]}`; the extractor never
//! propagates a failure outward as an `Err`, it falls back to the last
//! message instead and reports which happened via [`IntentOutcome`], so
//! callers (the middleware's step-event hook) can still distinguish a clean
//! extraction from a degraded one. The trait follows the boxed-future idiom
//! in `llm::LanguageModel` so a caller can swap in their own extractor
//! without an `async_trait` dependency.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::config::IntentExtractorConfig;
use crate::error::ExtractionError;
use crate::fingerprint::{Call, Message, Role};
use crate::llm::LanguageModel;

/// The structured shape the extractor LLM is asked to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedIntent {
    pub intent: String,
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(default)]
    pub stack: Vec<String>,
    pub goal: String,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl ExtractedIntent {
    /// `[goal, ...domain, ...stack, ...constraints]` joined with spaces,
    /// dropping empties — the text that gets fingerprinted for this variant.
    pub fn canonical_text(&self) -> String {
        let mut parts = vec![self.goal.clone()];
        parts.extend(self.domain.iter().cloned());
        parts.extend(self.stack.iter().cloned());
        parts.extend(self.constraints.iter().cloned());
        parts.into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ")
    }

    fn fallback(last_message: &str) -> Self {
        ExtractedIntent {
            intent: last_message.to_string(),
            domain: Vec::new(),
            stack: Vec::new(),
            goal: last_message.to_string(),
            constraints: Vec::new(),
        }
    }
}

/// Whether extraction succeeded or the extractor fell back to the last
/// message, carried through so the middleware can emit the right step event.
#[derive(Debug)]
pub enum IntentOutcome {
    Extracted(ExtractedIntent),
    FallenBack { intent: ExtractedIntent, reason: ExtractionError },
}

impl IntentOutcome {
    pub fn intent(&self) -> &ExtractedIntent {
        match self {
            IntentOutcome::Extracted(intent) => intent,
            IntentOutcome::FallenBack { intent, .. } => intent,
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Extracts structured intent from a conversation window. Dyn-compatible so
/// a default implementation can be swapped per memory instance.
pub trait IntentExtractor: Send + Sync {
    fn extract<'a>(&'a self, window: &'a [Message]) -> BoxFuture<'a, IntentOutcome>;
}

const DEFAULT_PROMPT: &str = "Summarize the user's intent as a JSON object with keys \
    intent, domain (array), stack (array), goal, constraints (array). Respond with \
    only the JSON object.";

/// Default extractor: formats the trailing window as `role: content` lines,
/// calls the configured extractor model at temperature 0.1, and scans the
/// response for the first brace-delimited JSON object.
pub struct LlmIntentExtractor {
    model: Box<dyn LanguageModel>,
    config: IntentExtractorConfig,
}

impl LlmIntentExtractor {
    pub fn new(model: Box<dyn LanguageModel>, config: IntentExtractorConfig) -> Self {
        Self { model, config }
    }

    fn windowed<'a>(&self, window: &'a [Message]) -> Vec<&'a Message> {
        let len = window.len();
        let start = len.saturating_sub(self.config.window_size);
        window[start..].iter().collect()
    }

    fn format_window(messages: &[&Message]) -> String {
        messages
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn run_extraction(&self, window: &[Message]) -> Result<ExtractedIntent, ExtractionError> {
        let windowed = self.windowed(window);
        let transcript = Self::format_window(&windowed);
        let prompt = self.config.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);

        let call = Call {
            model: self.model.model_id().to_string(),
            messages: vec![
                Message { role: Role::System, content: prompt.to_string() },
                Message { role: Role::User, content: transcript },
            ],
            temperature: Some(0.1),
            top_p: None,
            tools_json: None,
        };

        tracing::debug!(model = self.model.model_id(), window_len = windowed.len(), "calling intent extractor model");
        let result = self
            .model
            .generate(&call)
            .await
            .map_err(|e| ExtractionError::ModelCall(e.to_string()))?;

        parse_extracted_intent(&result.text)
    }
}

impl IntentExtractor for LlmIntentExtractor {
    fn extract<'a>(&'a self, window: &'a [Message]) -> BoxFuture<'a, IntentOutcome> {
        Box::pin(async move {
            let last_message = window.last().map(|m| m.content.as_str()).unwrap_or("");
            match self.run_extraction(window).await {
                Ok(intent) => IntentOutcome::Extracted(intent),
                Err(reason) => {
                    tracing::warn!(error = %reason, "intent extraction failed, falling back to last message");
                    IntentOutcome::FallenBack { intent: ExtractedIntent::fallback(last_message), reason }
                }
            }
        })
    }
}

/// Scan for the first `{...}` substring and decode it.
fn parse_extracted_intent(text: &str) -> Result<ExtractedIntent, ExtractionError> {
    let start = text.find('{').ok_or(ExtractionError::NoJsonFound)?;
    let end = text.rfind('}').ok_or(ExtractionError::NoJsonFound)?;
    if end < start {
        return Err(ExtractionError::NoJsonFound);
    }
    let candidate = &text[start..=end];
    serde_json::from_str(candidate).map_err(|e| ExtractionError::SchemaMismatch(e.to_string()))
}
