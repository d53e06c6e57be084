//! Vision-model interaction: the [`VisionModel`] seam, the edgequake-llm
//! adapter, and [`AiClient`], the governed call wrapper every phase uses.
//!
//! ## Call lifecycle
//!
//! ```text
//! reserve quota ──▶ rate gate ──▶ generate (with timeout) ──ok──▶ keep slot
//!      │                                │
//!      └─ exhausted: fail, no retry     └─ err ──▶ release slot ──▶ RetryPolicy ──▶ backoff / give up
//! ```
//!
//! Every attempt, retries included, takes its own quota slot before it waits
//! at the rate gate, so concurrent workers can never overrun the daily limit.

use crate::config::{ModelRole, Settings};
use crate::error::{ForgeError, ModelError};
use crate::governor::{QuotaTracker, RateGovernor};
use crate::pipeline::encode;
use crate::retry::{CallState, RetryPolicy};
use async_trait::async_trait;
use edgequake_llm::{
    AnthropicProvider, ChatMessage, CompletionOptions, GeminiProvider, LLMProvider,
    OpenAIProvider, OpenRouterProvider, ProviderFactory, ProviderType,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// One request to the vision service.
#[derive(Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    /// Credential from the settings at the time the request was built.
    pub api_key: String,
    pub prompt: String,
    /// PNG bytes attached after the prompt.
    pub image_png: Option<Vec<u8>>,
    /// Ask for a raw JSON reply.
    pub expect_json: bool,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl std::fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRequest")
            .field("model", &self.model)
            .field("prompt_len", &self.prompt.len())
            .field("image_bytes", &self.image_png.as_ref().map(Vec::len))
            .field("expect_json", &self.expect_json)
            .finish_non_exhaustive()
    }
}

/// A successful reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// The external generative service as a black box.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelReply, ModelError>;
}

// ── edgequake-llm adapter ────────────────────────────────────────────────

/// A 4xx/5xx code in status position: `HTTP 503`, `status: 429`,
/// `API error (500)`, `returned 400`, or a leading `429 Too Many Requests`.
static RE_HTTP_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\b(?:http|status|error|code|returned)\b[\s:=(]*|^\s*)([45]\d{2})\b")
        .expect("static regex")
});

/// [`VisionModel`] over an edgequake-llm provider.
///
/// Providers are created lazily per (model, credential) pair. The key
/// travels with each [`ModelRequest`], so a credential saved at runtime is
/// used by the next call. Providers without a key-taking constructor, or
/// requests without a key, go through [`ProviderFactory::create_llm_provider`],
/// which reads the environment.
pub struct EdgequakeModel {
    provider_name: String,
    providers: Mutex<HashMap<(String, String), Arc<dyn LLMProvider>>>,
}

impl EdgequakeModel {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            providers: Mutex::new(HashMap::new()),
        }
    }

    fn provider(&self, model: &str, api_key: &str) -> Result<Arc<dyn LLMProvider>, ModelError> {
        let key = (model.to_string(), api_key.trim().to_string());
        let mut cache = self.providers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(p) = cache.get(&key) {
            return Ok(Arc::clone(p));
        }
        let provider = build_provider(&self.provider_name, model, &key.1)
            .map_err(|e| ModelError::configuration(e.to_string()))?;
        cache.insert(key, Arc::clone(&provider));
        Ok(provider)
    }
}

fn build_provider(
    provider_name: &str,
    model: &str,
    api_key: &str,
) -> edgequake_llm::Result<Arc<dyn LLMProvider>> {
    if api_key.is_empty() {
        return ProviderFactory::create_llm_provider(provider_name, model);
    }
    let provider: Arc<dyn LLMProvider> = match ProviderType::from_str(provider_name) {
        Some(ProviderType::Gemini) if !model.starts_with("vertexai:") => {
            Arc::new(GeminiProvider::new(api_key).with_model(model))
        }
        Some(ProviderType::OpenAI) => Arc::new(OpenAIProvider::new(api_key).with_model(model)),
        Some(ProviderType::Anthropic) => {
            Arc::new(AnthropicProvider::new(api_key).with_model(model))
        }
        Some(ProviderType::OpenRouter) => {
            Arc::new(OpenRouterProvider::new(api_key).with_model(model))
        }
        _ => return ProviderFactory::create_llm_provider(provider_name, model),
    };
    Ok(provider)
}

/// Map a provider error to a [`ModelError`], recovering the HTTP status from
/// its message when present.
fn map_provider_error(message: String) -> ModelError {
    let status = RE_HTTP_STATUS
        .captures(&message)
        .and_then(|c| c[1].parse::<u16>().ok());
    ModelError::new(status, message)
}

#[async_trait]
impl VisionModel for EdgequakeModel {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelReply, ModelError> {
        let provider = self.provider(&request.model, &request.api_key)?;

        let images = request
            .image_png
            .as_deref()
            .map(encode::image_data)
            .into_iter()
            .collect::<Vec<_>>();
        let message = ChatMessage::user_with_images(request.prompt.as_str(), images);
        let mut messages = Vec::with_capacity(2);
        if request.expect_json {
            messages.push(ChatMessage::system(
                "Reply with a single raw JSON object and nothing else.",
            ));
        }
        messages.push(message);

        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| map_provider_error(e.to_string()))?;

        Ok(ModelReply {
            text: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

// ── Governed client ──────────────────────────────────────────────────────

/// Token and call counters for one document.
#[derive(Debug, Default)]
pub struct Usage {
    pub calls: AtomicU64,
    pub input_tokens: AtomicU64,
    pub output_tokens: AtomicU64,
}

/// Limits captured from the settings when a document starts.
#[derive(Debug, Clone)]
pub struct CallLimits {
    pub rpm: u32,
    pub max_requests_per_day: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl CallLimits {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            rpm: s.rpm,
            max_requests_per_day: s.max_requests_per_day,
            timeout: Duration::from_secs(s.api_timeout_secs.max(1)),
            retry: RetryPolicy::new(s.max_retries, Duration::from_millis(s.retry_base_ms)),
            temperature: s.temperature,
            max_tokens: s.max_tokens,
        }
    }
}

/// Governed, retrying wrapper around a [`VisionModel`].
#[derive(Clone)]
pub struct AiClient {
    model: Arc<dyn VisionModel>,
    governor: Arc<RateGovernor>,
    quota: Arc<QuotaTracker>,
    limits: CallLimits,
    models: Arc<Settings>,
    usage: Arc<Usage>,
}

impl AiClient {
    pub fn new(
        model: Arc<dyn VisionModel>,
        governor: Arc<RateGovernor>,
        quota: Arc<QuotaTracker>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            model,
            governor,
            quota,
            limits: CallLimits::from_settings(&settings),
            models: settings,
            usage: Arc::new(Usage::default()),
        }
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Build a request for a phase using the configured model and sampling.
    pub fn request(&self, role: ModelRole, prompt: String, image_png: Option<Vec<u8>>) -> ModelRequest {
        ModelRequest {
            model: self.models.model_for(role).to_string(),
            api_key: self.models.api_key.trim().to_string(),
            prompt,
            image_png,
            expect_json: role == ModelRole::Excalidraw,
            temperature: self.limits.temperature,
            max_tokens: self.limits.max_tokens,
        }
    }

    /// Run one logical call through quota, rate gate, timeout and retry.
    pub async fn call(&self, request: &ModelRequest) -> Result<ModelReply, ForgeError> {
        let policy = self.limits.retry;
        let mut state = CallState::Attempting(1);
        let mut last_error: Option<ModelError> = None;

        loop {
            match state {
                CallState::Attempting(attempt) => {
                    let slot = self.quota.reserve(self.limits.max_requests_per_day)?;
                    self.governor.acquire(self.limits.rpm).await;

                    let outcome = match timeout(self.limits.timeout, self.model.generate(request)).await {
                        Ok(r) => r,
                        Err(_) => Err(ModelError::network(format!(
                            "request timed out after {}s",
                            self.limits.timeout.as_secs()
                        ))),
                    };

                    match outcome {
                        Ok(reply) => {
                            self.usage.calls.fetch_add(1, Ordering::Relaxed);
                            self.usage
                                .input_tokens
                                .fetch_add(reply.input_tokens as u64, Ordering::Relaxed);
                            self.usage
                                .output_tokens
                                .fetch_add(reply.output_tokens as u64, Ordering::Relaxed);
                            debug!(
                                "{}: {} input tokens, {} output tokens",
                                request.model, reply.input_tokens, reply.output_tokens
                            );
                            return Ok(reply);
                        }
                        Err(e) => {
                            self.quota.release(slot);
                            state = policy.on_failure(attempt, e.classify(), rand::random::<f64>());
                            if let CallState::Backoff { delay, .. } = state {
                                warn!(
                                    "API error {} on attempt {attempt}. Retrying in {:.1}s...",
                                    e.status.map_or_else(|| "Network".to_string(), |s| s.to_string()),
                                    delay.as_secs_f64()
                                );
                            }
                            last_error = Some(e);
                        }
                    }
                }
                CallState::Backoff { delay, .. } => {
                    sleep(delay).await;
                    state = policy.after_backoff(state);
                }
                CallState::GaveUp { attempts } => {
                    let source = last_error
                        .take()
                        .unwrap_or_else(|| ModelError::network("no attempt was made"));
                    if source.configuration {
                        return Err(ForgeError::ProviderNotConfigured {
                            provider: self.models.provider_name.clone(),
                            hint: source.message,
                        });
                    }
                    return Err(ForgeError::ModelCallFailed { attempts, source });
                }
                CallState::Succeeded => {
                    return Err(ForgeError::Internal("retry loop left in success state".into()))
                }
            }
        }
    }
}
