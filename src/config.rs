//! Runtime settings for the queue, governor and pipeline.
//!
//! Every knob lives in one [`Settings`] struct so the control surface can
//! hand out a snapshot, accept a partial JSON patch, and persist the result
//! as `server_config.json` without knowing which component reads which field.
//!
//! Settings are built either from disk (serde, camelCase keys, missing keys
//! take their defaults) or in code through [`SettingsBuilder`], which clamps
//! out-of-range values and validates the result.

use crate::error::ForgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default model used for every phase unless overridden in [`ModelOverrides`].
pub const DEFAULT_MODEL: &str = "gemini-3-pro-preview";

/// Complete runtime configuration.
///
/// # Example
/// ```rust
/// use noteforge::Settings;
///
/// let settings = Settings::builder()
///     .rpm(5)
///     .max_workers(2)
///     .refine_markdown(true)
///     .build()
///     .unwrap();
/// assert_eq!(settings.rpm, 5);
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Credential for the vision service. Empty means "not configured".
    pub api_key: String,

    /// edgequake-llm provider name ("gemini", "openai", "anthropic", ...).
    pub provider_name: String,

    /// Model used for any phase without an override.
    pub model_name: String,

    /// Per-phase model overrides.
    pub models: ModelOverrides,

    /// Requests per minute admitted by the rate governor. Default: 10.
    pub rpm: u32,

    /// Bounded worker-pool size for the analysis, preparation and resolution
    /// phases. Default: 3.
    pub max_workers: usize,

    /// Daily request quota, counted in the provider's timezone. Default: 1000.
    pub max_requests_per_day: u32,

    /// Output root used when `use_same_folder_for_output` is off.
    pub output_folder: PathBuf,

    /// Watch roots. The first path segment below a root is the subject.
    pub watched_folders: Vec<PathBuf>,

    /// Write each bundle next to its source document.
    pub use_same_folder_for_output: bool,

    /// Page rasterisation DPI. Range: 72–400. Default: 300.
    ///
    /// Higher than a plain OCR pass needs, because the same render is cropped
    /// for diagram images and those should stay legible when zoomed.
    pub render_dpi: u32,

    /// Cap on either rendered dimension in pixels. Default: 4000.
    pub max_rendered_pixels: u32,

    /// Start the batch automatically when a document is enqueued.
    pub auto_process: bool,

    /// Attempt Excalidraw synthesis for non-table diagrams. Default: true.
    pub generate_excalidraw: bool,

    /// Minimum self-reported confidence for an Excalidraw drawing to be kept.
    pub excalidraw_threshold: f32,

    /// Run the whole-document refinement call. Default: false.
    pub refine_markdown: bool,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum output tokens per call. Default: 8192.
    ///
    /// The combined analysis call returns both the transcription and the
    /// diagram JSON, so dense pages need more room than a plain OCR call.
    pub max_tokens: usize,

    /// Retries after the first attempt on a retryable failure. Default: 5.
    pub max_retries: u32,

    /// Backoff base in milliseconds. Default: 2000.
    pub retry_base_ms: u64,

    /// Per-call timeout in seconds. Default: 180.
    pub api_timeout_secs: u64,

    /// Minimum IoU for two diagrams on consecutive pages to be duplicates.
    pub iou_threshold: f32,

    /// Minimum summary token similarity for duplicates (when both have one).
    pub summary_similarity: f32,

    /// Separator appended after every page in the assembled document.
    pub page_separator: PageSeparator,

    /// Watch-root rescan interval used by the `serve` binary. Default: 10.
    pub scan_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            provider_name: "gemini".to_string(),
            model_name: DEFAULT_MODEL.to_string(),
            models: ModelOverrides::default(),
            rpm: 10,
            max_workers: 3,
            max_requests_per_day: 1000,
            output_folder: PathBuf::from("./output_pdfs"),
            watched_folders: vec![PathBuf::from("./input_pdfs")],
            use_same_folder_for_output: false,
            render_dpi: 300,
            max_rendered_pixels: 4000,
            auto_process: false,
            generate_excalidraw: true,
            excalidraw_threshold: 0.6,
            refine_markdown: false,
            temperature: 0.1,
            max_tokens: 8192,
            max_retries: 5,
            retry_base_ms: 2000,
            api_timeout_secs: 180,
            iou_threshold: 0.6,
            summary_similarity: 0.3,
            page_separator: PageSeparator::default(),
            scan_interval_secs: 10,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("provider_name", &self.provider_name)
            .field("model_name", &self.model_name)
            .field("models", &self.models)
            .field("rpm", &self.rpm)
            .field("max_workers", &self.max_workers)
            .field("max_requests_per_day", &self.max_requests_per_day)
            .field("output_folder", &self.output_folder)
            .field("watched_folders", &self.watched_folders)
            .field("use_same_folder_for_output", &self.use_same_folder_for_output)
            .field("render_dpi", &self.render_dpi)
            .field("auto_process", &self.auto_process)
            .field("generate_excalidraw", &self.generate_excalidraw)
            .field("excalidraw_threshold", &self.excalidraw_threshold)
            .field("refine_markdown", &self.refine_markdown)
            .finish()
    }
}

impl Settings {
    /// Create a new builder for `Settings`.
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder {
            settings: Self::default(),
        }
    }

    /// Model to use for the given phase.
    pub fn model_for(&self, role: ModelRole) -> &str {
        let over = match role {
            ModelRole::Transcription => &self.models.transcription,
            ModelRole::Excalidraw => &self.models.excalidraw,
            ModelRole::Refinement => &self.models.refinement,
        };
        over.as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.model_name)
    }

    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Environment variable the configured provider reads its key from,
    /// e.g. `GEMINI_API_KEY`.
    pub fn credential_env_var(&self) -> String {
        let name = self.provider_name.trim().to_ascii_uppercase().replace('-', "_");
        if name.is_empty() {
            "GEMINI_API_KEY".to_string()
        } else {
            format!("{name}_API_KEY")
        }
    }

    /// Apply a partial JSON object over these settings.
    ///
    /// Top-level keys in `patch` replace the current values; keys not present
    /// are kept; unknown keys are ignored. The result is validated.
    pub fn merged(&self, patch: &serde_json::Value) -> Result<Settings, ForgeError> {
        let patch = patch
            .as_object()
            .ok_or_else(|| ForgeError::InvalidConfig("settings patch must be a JSON object".into()))?;
        let mut current = serde_json::to_value(self)
            .map_err(|e| ForgeError::Internal(format!("settings serialise: {e}")))?;
        if let Some(obj) = current.as_object_mut() {
            for (k, v) in patch {
                if obj.contains_key(k) {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        let next: Settings = serde_json::from_value(current)
            .map_err(|e| ForgeError::InvalidConfig(e.to_string()))?;
        next.validate()?;
        Ok(next)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ForgeError> {
        if self.rpm == 0 {
            return Err(ForgeError::InvalidConfig("rpm must be ≥ 1".into()));
        }
        if self.max_workers == 0 {
            return Err(ForgeError::InvalidConfig("maxWorkers must be ≥ 1".into()));
        }
        if !(72..=400).contains(&self.render_dpi) {
            return Err(ForgeError::InvalidConfig(format!(
                "renderDpi must be 72–400, got {}",
                self.render_dpi
            )));
        }
        for (name, v) in [
            ("excalidrawThreshold", self.excalidraw_threshold),
            ("iouThreshold", self.iou_threshold),
            ("summarySimilarity", self.summary_similarity),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ForgeError::InvalidConfig(format!(
                    "{name} must be within 0–1, got {v}"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`Settings`].
#[derive(Debug)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.settings.api_key = key.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.settings.provider_name = name.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.settings.model_name = model.into();
        self
    }

    pub fn rpm(mut self, rpm: u32) -> Self {
        self.settings.rpm = rpm.max(1);
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.settings.max_workers = n.max(1);
        self
    }

    pub fn max_requests_per_day(mut self, n: u32) -> Self {
        self.settings.max_requests_per_day = n;
        self
    }

    pub fn output_folder(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.output_folder = dir.into();
        self
    }

    pub fn watched_folders(mut self, roots: Vec<PathBuf>) -> Self {
        self.settings.watched_folders = roots;
        self
    }

    pub fn use_same_folder_for_output(mut self, v: bool) -> Self {
        self.settings.use_same_folder_for_output = v;
        self
    }

    pub fn render_dpi(mut self, dpi: u32) -> Self {
        self.settings.render_dpi = dpi.clamp(72, 400);
        self
    }

    pub fn auto_process(mut self, v: bool) -> Self {
        self.settings.auto_process = v;
        self
    }

    pub fn generate_excalidraw(mut self, v: bool) -> Self {
        self.settings.generate_excalidraw = v;
        self
    }

    pub fn excalidraw_threshold(mut self, t: f32) -> Self {
        self.settings.excalidraw_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn refine_markdown(mut self, v: bool) -> Self {
        self.settings.refine_markdown = v;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.settings.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.settings.max_retries = n;
        self
    }

    pub fn retry_base_ms(mut self, ms: u64) -> Self {
        self.settings.retry_base_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.settings.api_timeout_secs = secs.max(1);
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.settings.page_separator = sep;
        self
    }

    /// Build the settings, validating constraints.
    pub fn build(self) -> Result<Settings, ForgeError> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which phase a call belongs to; selects the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Transcription,
    Excalidraw,
    Refinement,
}

/// Per-phase model overrides. `None` or blank falls back to `modelName`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOverrides {
    pub transcription: Option<String>,
    pub excalidraw: Option<String>,
    pub refinement: Option<String>,
}

/// How pages are separated in the assembled document.
///
/// The separator is appended after every page, including the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PageSeparator {
    /// Pages joined with a blank line.
    None,
    /// Horizontal rule: "\n\n---\n\n". (default)
    #[default]
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator string for the given page number (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credential_env_var_follows_provider() {
        let mut s = Settings::default();
        assert_eq!(s.credential_env_var(), "GEMINI_API_KEY");
        s.provider_name = "openai".into();
        assert_eq!(s.credential_env_var(), "OPENAI_API_KEY");
        s.provider_name = String::new();
        assert_eq!(s.credential_env_var(), "GEMINI_API_KEY");
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.rpm, 10);
        assert_eq!(s.max_workers, 3);
        assert_eq!(s.max_requests_per_day, 1000);
        assert_eq!(s.render_dpi, 300);
        assert!(s.generate_excalidraw);
        assert!(!s.refine_markdown);
        assert!((s.excalidraw_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(s.page_separator, PageSeparator::HorizontalRule);
    }

    #[test]
    fn missing_keys_take_defaults() {
        let s: Settings = serde_json::from_value(json!({ "rpm": 4, "apiKey": "k" })).unwrap();
        assert_eq!(s.rpm, 4);
        assert_eq!(s.api_key, "k");
        assert_eq!(s.max_workers, 3);
        assert_eq!(s.model_name, DEFAULT_MODEL);
    }

    #[test]
    fn merged_replaces_only_given_keys() {
        let base = Settings::builder().rpm(7).build().unwrap();
        let next = base
            .merged(&json!({ "maxWorkers": 5, "bogusKey": true }))
            .unwrap();
        assert_eq!(next.max_workers, 5);
        assert_eq!(next.rpm, 7);
    }

    #[test]
    fn merged_rejects_invalid_values() {
        let base = Settings::default();
        assert!(base.merged(&json!({ "rpm": 0 })).is_err());
        assert!(base.merged(&json!({ "excalidrawThreshold": 1.5 })).is_err());
        assert!(base.merged(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn model_overrides_fall_back_to_model_name() {
        let mut s = Settings::builder().model("base-model").build().unwrap();
        s.models.excalidraw = Some("draw-model".into());
        s.models.refinement = Some("  ".into());
        assert_eq!(s.model_for(ModelRole::Transcription), "base-model");
        assert_eq!(s.model_for(ModelRole::Excalidraw), "draw-model");
        assert_eq!(s.model_for(ModelRole::Refinement), "base-model");
    }

    #[test]
    fn builder_clamps_dpi() {
        let s = Settings::builder().render_dpi(1200).build().unwrap();
        assert_eq!(s.render_dpi, 400);
    }

    #[test]
    fn debug_redacts_api_key() {
        let s = Settings::builder().api_key("secret-123").build().unwrap();
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("secret-123"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn page_separator_render() {
        assert_eq!(PageSeparator::HorizontalRule.render(1), "\n\n---\n\n");
        assert_eq!(PageSeparator::Comment.render(3), "\n\n<!-- page 3 -->\n\n");
    }
}
