//! # noteforge
//!
//! Turn scanned lecture PDFs into note-app import bundles using a vision
//! model: page transcription to Markdown, diagram extraction, and Excalidraw
//! synthesis for diagrams that can be redrawn as vectors.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Analyze  render each page, one combined call: Markdown + diagram boxes
//!  ├─ 2. Dedup    skip build-up duplicates on consecutive pages
//!  ├─ 3. Prepare  crop surviving diagrams, swap placeholders for pending markers
//!  ├─ 4. Refine   optional whole-document pass
//!  ├─ 5. Resolve  Excalidraw drawing (confidence-gated) or PNG crop per diagram
//!  └─ 6. Bundle   note Markdown + assets + manifest → <title>.zip
//! ```
//!
//! Every call goes through [`AiClient`]: a daily quota slot is reserved first,
//! the [`RateGovernor`] spaces calls at `60 / rpm` seconds, and retryable
//! failures back off exponentially with jitter.
//!
//! ## Service
//!
//! [`Controller`] owns the task queue, history, activity log and settings,
//! and runs the batch loop one document at a time. The `cli` feature adds
//! the `noteforge` binary with an HTTP control surface ([`server`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use noteforge::{Controller, EdgequakeModel, PdfiumRenderer, StateStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = StateStore::open("./data")?;
//!     let model = Arc::new(EdgequakeModel::new("gemini"));
//!     let controller = Controller::new(store, model, Arc::new(PdfiumRenderer::new()));
//!     controller.rescan();
//!     controller.start();
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | `noteforge` binary and HTTP server (clap, axum, indicatif, tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod controller;
pub mod convert;
pub mod error;
pub mod governor;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod queue;
pub mod retry;
#[cfg(feature = "cli")]
pub mod server;
pub mod store;
pub mod watch;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ModelOverrides, ModelRole, PageSeparator, Settings, SettingsBuilder};
pub use controller::{ConfigSnapshot, Controller, EnqueueOutcome, StatusSnapshot};
pub use convert::{convert_document, ConversionContext, ConversionReport, DocumentJob};
pub use error::{ErrorClass, ForgeError, ModelError};
pub use governor::{QuotaSlot, QuotaState, QuotaTracker, RateGovernor};
pub use pipeline::llm::{AiClient, EdgequakeModel, ModelReply, ModelRequest, VisionModel};
pub use pipeline::render::{PageRenderer, PdfiumRenderer, RenderOptions};
pub use progress::{NoopProgress, ProgressSink, SharedProgress};
pub use prompts::PromptParts;
pub use queue::{Task, TaskStatus};
pub use store::{ResolvedSubject, StateStore, SubjectConfig, STATE_FILE};
pub use watch::{attribute_subject, detect_subjects, discover_documents, Attribution};
