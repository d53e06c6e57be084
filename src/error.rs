//! Error types for the noteforge library.
//!
//! Two error types reflect two distinct failure scopes:
//!
//! * [`ForgeError`] — **document-fatal or control-surface**: the document
//!   cannot be converted (bad input, missing credential, quota exhausted,
//!   archive write failed) or a control operation was rejected (unknown task,
//!   task already running). A document-fatal error moves its task to the
//!   history with status `error`.
//!
//! * [`ModelError`] — **one failed call** to the vision service. The retry
//!   loop in [`crate::pipeline::llm`] classifies it with
//!   [`ModelError::classify`] and either backs off or gives up, at which point
//!   it is wrapped into [`ForgeError::ModelCallFailed`].
//!
//! Page-level and asset-level problems never surface as errors at all: the
//! pipeline degrades them into inline callouts or raster fallbacks.

use std::path::PathBuf;
use thiserror::Error;

/// Document-fatal and control-surface errors.
#[derive(Debug, Error)]
pub enum ForgeError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium, or install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Configuration errors ──────────────────────────────────────────────
    /// No API credential is configured.
    #[error("API key missing\nSet it in the settings or via NOTEFORGE_API_KEY.")]
    MissingCredential,

    /// A required prompt resolved to empty text for this subject.
    #[error("{which} prompt missing for subject '{subject}'")]
    MissingPrompt { which: &'static str, subject: String },

    /// The configured provider could not be constructed.
    #[error("Vision provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder or settings validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Upstream errors ───────────────────────────────────────────────────
    /// The daily request quota is used up; never retried.
    #[error("Daily request limit reached ({count}/{max}). Try again tomorrow.")]
    QuotaExhausted { count: u32, max: u32 },

    /// A call failed fatally or ran out of retries.
    #[error("Model call failed after {attempts} attempt(s): {source}")]
    ModelCallFailed {
        attempts: u32,
        #[source]
        source: ModelError,
    },

    // ── Output errors ─────────────────────────────────────────────────────
    /// A cropped diagram or page could not be PNG-encoded.
    #[error("Image encoding failed: {0}")]
    ImageEncode(String),

    /// Building the zip archive failed.
    #[error("Failed to build archive '{path}': {detail}")]
    Archive { path: PathBuf, detail: String },

    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing a persisted state file failed.
    #[error("Persistence error on '{path}': {detail}")]
    Persistence { path: PathBuf, detail: String },

    // ── Control-surface errors ────────────────────────────────────────────
    /// No queued task carries this id.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The task is already being processed.
    #[error("Task '{0}' is already processing")]
    TaskBusy(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// True when the batch loop must stop after this error rather than
    /// advance to the next document.
    pub fn halts_batch(&self) -> bool {
        matches!(self, ForgeError::QuotaExhausted { .. })
    }

    /// True when a failed page call must abort the whole document instead
    /// of degrading to a callout: the quota is gone or the provider cannot
    /// be used at all.
    pub fn aborts_document(&self) -> bool {
        self.halts_batch()
            || matches!(
                self,
                ForgeError::MissingCredential | ForgeError::ProviderNotConfigured { .. }
            )
    }
}

/// How a failed call should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 503 or "overloaded": back off and retry.
    Overloaded,
    /// 429 or a provider quota message: back off and retry.
    RateLimited,
    /// Any other 5xx: back off and retry.
    ServerError,
    /// Connection reset, fetch failure, timeout: back off and retry.
    Network,
    /// The provider could not be built (unknown name, no credential).
    Configuration,
    /// Everything else: give up immediately.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Fatal | ErrorClass::Configuration)
    }
}

/// One failed call to the vision service.
#[derive(Debug, Clone, Error)]
#[error("{}{}", .status.map(|s| format!("HTTP {s}: ")).unwrap_or_default(), .message)]
pub struct ModelError {
    /// HTTP status when the transport reported one.
    pub status: Option<u16>,
    pub message: String,
    /// Raised before any request was sent because the provider is unusable.
    pub configuration: bool,
}

impl ModelError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            configuration: false,
        }
    }

    /// The provider could not be constructed for this request.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            configuration: true,
            ..Self::new(None, message)
        }
    }

    /// A transport-level failure with no HTTP status.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    /// Classify for the retry loop.
    ///
    /// Order matters: a 503 that also mentions "quota" is still overloaded.
    pub fn classify(&self) -> ErrorClass {
        let msg = self.message.to_lowercase();
        let status = self.status.unwrap_or(0);
        if self.configuration {
            ErrorClass::Configuration
        } else if status == 503 || msg.contains("overloaded") {
            ErrorClass::Overloaded
        } else if status == 429 || msg.contains("quota") {
            ErrorClass::RateLimited
        } else if status >= 500 {
            ErrorClass::ServerError
        } else if msg.contains("fetch failed")
            || msg.contains("socket hang up")
            || msg.contains("connection reset")
            || msg.contains("timed out")
        {
            ErrorClass::Network
        } else {
            ErrorClass::Fatal
        }
    }
}
