//! Queue and batch controller.
//!
//! [`Controller`] is the single owner of the mutable service state: task
//! queue and history, activity log, settings, subject configurations and
//! the daily quota. Every mutation is one short critical section; readers
//! get consistent snapshots through [`Controller::status`].
//!
//! ## Batch loop
//!
//! ```text
//! start ─▶ [credential? quota?] ─▶ loop {
//!              credential, quota and stop flag checked
//!              claim first pending task ─▶ convert_document ─▶ history
//!          } ─▶ idle
//! ```
//!
//! Stop is cooperative: it is observed between documents, never inside one.
//! A document that runs out of daily quota is not failed: it goes back to
//! pending in place and the loop halts until the quota is available again.
//! Only one loop runs at a time; a loop started while a previous one is still
//! finishing its document waits for it.

use crate::config::Settings;
use crate::convert::{
    convert_document, output_dir_for, ConversionContext, ConversionReport, DocumentJob,
};
use crate::error::ForgeError;
use crate::governor::{QuotaTracker, RateGovernor};
use crate::pipeline::bundle::output_exists;
use crate::pipeline::input::is_candidate_pdf;
use crate::pipeline::llm::{AiClient, VisionModel};
use crate::pipeline::render::PageRenderer;
use crate::progress::ProgressSink;
use crate::prompts::PromptParts;
use crate::queue::{QueueState, Task};
use crate::store::{sanitize_filename, StateStore, SubjectConfig, STATE_FILE, SYSTEM_ID};
use crate::watch::{attribute_subject, detect_subjects, discover_documents};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tracing::info;

/// Result of [`Controller::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Added to the queue with this task id.
    Queued(String),
    /// A bundle for this document already exists.
    AlreadyConverted,
    /// The same source is already queued or in history.
    AlreadyKnown,
    /// Not a `.pdf` file, or hidden.
    Ignored,
}

/// Status snapshot for the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub is_processing: bool,
    pub queue: Vec<Task>,
    pub completed: Vec<Task>,
    pub logs: Vec<String>,
    /// Seconds since the controller was created.
    pub uptime: f64,
    pub detected_subjects: Vec<String>,
    pub daily_request_count: u32,
    pub max_requests_per_day: u32,
    pub daily_reset_date: String,
}

/// Settings plus subject list, as served by the config endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub settings: Settings,
    pub subjects: Vec<SubjectConfig>,
}

struct Inner {
    queue: Mutex<QueueState>,
    settings: RwLock<Arc<Settings>>,
    /// Process-only credential used while the settings carry none.
    fallback_key: RwLock<String>,
    subjects: RwLock<Vec<SubjectConfig>>,
    store: StateStore,
    quota: Arc<QuotaTracker>,
    governor: Arc<RateGovernor>,
    model: Arc<dyn VisionModel>,
    renderer: Arc<dyn PageRenderer>,
    running: AtomicBool,
    batch_gate: tokio::sync::Mutex<()>,
    started_at: Instant,
}

/// Cloneable handle to the service state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Load settings, subjects and quota state from `store`.
    pub fn new(
        store: StateStore,
        model: Arc<dyn VisionModel>,
        renderer: Arc<dyn PageRenderer>,
    ) -> Self {
        let quota = QuotaTracker::load(store.path(STATE_FILE));
        Self::with_quota(store, model, renderer, quota)
    }

    /// Like [`Controller::new`] with a caller-supplied quota tracker.
    pub fn with_quota(
        store: StateStore,
        model: Arc<dyn VisionModel>,
        renderer: Arc<dyn PageRenderer>,
        quota: QuotaTracker,
    ) -> Self {
        let settings = store.load_settings();
        let subjects = store.load_subjects();
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(QueueState::new()),
                settings: RwLock::new(Arc::new(settings)),
                fallback_key: RwLock::new(String::new()),
                subjects: RwLock::new(subjects),
                store,
                quota: Arc::new(quota),
                governor: Arc::new(RateGovernor::new()),
                model,
                renderer,
                running: AtomicBool::new(false),
                batch_gate: tokio::sync::Mutex::new(()),
                started_at: Instant::now(),
            }),
        }
    }

    fn queue(&self) -> MutexGuard<'_, QueueState> {
        self.inner.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current settings.
    pub fn settings(&self) -> Arc<Settings> {
        let guard = self.inner.settings.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    /// Use `key` as the credential for this process when the settings carry
    /// none. Not persisted.
    pub fn use_fallback_credential(&self, key: &str) {
        let key = key.trim();
        if key.is_empty() {
            return;
        }
        {
            let mut fallback = self.inner.fallback_key.write().unwrap_or_else(|p| p.into_inner());
            if !fallback.is_empty() {
                return;
            }
            *fallback = key.to_string();
        }
        let mut guard = self.inner.settings.write().unwrap_or_else(|p| p.into_inner());
        if !guard.has_credential() {
            let mut next = guard.as_ref().clone();
            next.api_key = key.to_string();
            *guard = Arc::new(next);
        }
    }

    fn fallback_key(&self) -> String {
        self.inner
            .fallback_key
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn subjects(&self) -> Vec<SubjectConfig> {
        self.inner
            .subjects
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Append a line to the activity log.
    pub fn log(&self, msg: impl AsRef<str>) {
        info!("{}", msg.as_ref());
        self.queue().log(msg);
    }

    // ── Ingestion ────────────────────────────────────────────────────────

    /// Queue a document for conversion.
    ///
    /// Skips documents whose bundle already exists (in the target folder or
    /// one level below) and sources that are already queued or in history.
    /// Starts the batch when auto-process is on.
    pub fn enqueue(&self, path: &Path) -> EnqueueOutcome {
        if !is_candidate_pdf(path) {
            return EnqueueOutcome::Ignored;
        }
        let settings = self.settings();
        let attribution = attribute_subject(path, &settings.watched_folders);
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let job = DocumentJob {
            source: path.to_path_buf(),
            relative_folder: attribution.relative_folder,
            subject: attribution.subject,
        };

        let archive = format!("{}.zip", sanitize_filename(&job.title()));
        if output_exists(&output_dir_for(&settings, &job), &archive) {
            self.log(format!("Skipping {display_name} - already converted"));
            return EnqueueOutcome::AlreadyConverted;
        }

        let task = Task::new(display_name, job.subject, job.source, job.relative_folder);
        let id = task.id.clone();
        {
            let mut q = self.queue();
            if q.knows_source(path) {
                return EnqueueOutcome::AlreadyKnown;
            }
            let line = format!(
                "Detected new file: {} (Subject: {})",
                task.display_name, task.subject
            );
            q.push(task);
            info!("{line}");
            q.log(line);
        }

        if settings.auto_process && !self.is_running() {
            self.start();
        }
        EnqueueOutcome::Queued(id)
    }

    /// Enqueue every document found under the watch roots. Returns how many
    /// were newly queued.
    pub fn rescan(&self) -> usize {
        let roots = self.settings().watched_folders.clone();
        discover_documents(&roots)
            .iter()
            .filter(|p| matches!(self.enqueue(p), EnqueueOutcome::Queued(_)))
            .count()
    }

    // ── Batch control ────────────────────────────────────────────────────

    /// Check the credential and today's quota, logging the reason on failure.
    fn may_process(&self, settings: &Settings) -> bool {
        if !settings.has_credential() {
            self.log("API Key missing");
            return false;
        }
        if self.inner.quota.check(settings.max_requests_per_day).is_err() {
            self.log("Daily limit reached");
            return false;
        }
        true
    }

    /// Start the batch loop in the background. Returns `false` (and does
    /// nothing) when already running or when the credential or quota check
    /// fails. Must be called inside a tokio runtime.
    pub fn start(&self) -> bool {
        if self.is_running() || !self.may_process(&self.settings()) {
            return false;
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let this = self.clone();
        tokio::spawn(async move { this.run_batch().await });
        true
    }

    /// Request the loop to stop after the current document.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.log("Stop requested; finishing the current document.");
        }
    }

    /// Run the batch loop until the queue has no pending task, the stop flag
    /// is cleared, or a precondition fails.
    pub async fn run_batch(&self) {
        let _gate = self.inner.batch_gate.lock().await;
        self.log("Batch started.");
        loop {
            if !self.is_running() {
                break;
            }
            if !self.may_process(&self.settings()) {
                break;
            }
            let next = self.queue().claim_next();
            let Some(task) = next else {
                break;
            };
            if let Err(e) = self.run_claimed(task).await {
                if e.halts_batch() {
                    break;
                }
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
        self.log("Batch finished.");
    }

    /// Process one queued task outside the batch loop, in the background.
    pub fn process_single(&self, id: &str) -> Result<(), ForgeError> {
        let task = self.queue().claim(id)?;
        let this = self.clone();
        tokio::spawn(async move {
            let display_name = task.display_name.clone();
            this.log(format!("Single file processing started: {display_name}"));
            let _ = this.run_claimed(task).await;
            this.log(format!("Single file processing finished: {display_name}"));
        });
        Ok(())
    }

    /// Claim one queued task, convert it and move it to history.
    pub async fn process_task(&self, id: &str) -> Result<ConversionReport, ForgeError> {
        let task = self.queue().claim(id)?;
        self.run_claimed(task).await
    }

    /// Convert a task this caller has claimed.
    ///
    /// Success or a document-fatal error moves the task to history. Running
    /// out of daily quota puts it back to pending instead.
    async fn run_claimed(&self, task: Task) -> Result<ConversionReport, ForgeError> {
        let id = task.id.as_str();
        let display_name = task.display_name.clone();
        let job = DocumentJob {
            source: task.source_path.clone(),
            relative_folder: task.relative_folder.clone(),
            subject: task.subject.clone(),
        };
        self.log(format!("Processing {display_name}..."));

        let result = self.convert(id, &job).await;
        match &result {
            Ok(report) => {
                self.log(format!(
                    "Finished {display_name}: {} pages, {} drawings, {} images, {} calls, {} input / {} output tokens",
                    report.pages,
                    report.drawings,
                    report.rasters,
                    report.calls,
                    report.input_tokens,
                    report.output_tokens
                ));
                self.queue().finish(id, Ok(()));
            }
            Err(e) if e.halts_batch() => {
                self.log(format!("Daily limit reached; {display_name} stays queued."));
                self.queue().release(id);
            }
            Err(e) => {
                self.log(format!("Error processing {display_name}: {e}"));
                self.queue().finish(id, Err(e.to_string()));
            }
        }
        result
    }

    async fn convert(&self, id: &str, job: &DocumentJob) -> Result<ConversionReport, ForgeError> {
        let settings = self.settings();
        if !settings.has_credential() {
            return Err(ForgeError::MissingCredential);
        }
        let subject =
            self.inner
                .store
                .resolve_subject(&job.subject, &self.subjects(), &settings);
        let ctx = ConversionContext {
            client: AiClient::new(
                Arc::clone(&self.inner.model),
                Arc::clone(&self.inner.governor),
                Arc::clone(&self.inner.quota),
                Arc::clone(&settings),
            ),
            settings,
            subject,
            renderer: Arc::clone(&self.inner.renderer),
            progress: Arc::new(TaskProgress {
                controller: self.clone(),
                task_id: id.to_string(),
            }),
        };
        convert_document(&ctx, job).await
    }

    // ── Queue operations ─────────────────────────────────────────────────

    pub fn reorder(&self, ordered_ids: &[String]) {
        self.queue().reorder(ordered_ids);
        self.log(format!("Queue reordered: {} items", ordered_ids.len()));
    }

    /// Move a finished task back to the end of the queue.
    pub fn redo(&self, id: &str) -> Result<(), ForgeError> {
        let name = {
            let mut q = self.queue();
            if !q.redo(id) {
                return Err(ForgeError::TaskNotFound(id.to_string()));
            }
            q.get(id).map(|t| t.display_name.clone()).unwrap_or_default()
        };
        self.log(format!("Re-queued for processing: {name}"));
        Ok(())
    }

    pub fn clear_history(&self) {
        self.queue().clear_history();
    }

    pub fn reset_quota(&self) {
        self.inner.quota.reset();
        self.log("Daily request counter reset manually by user.");
    }

    // ── Configuration ────────────────────────────────────────────────────

    pub fn config(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            settings: self.settings().as_ref().clone(),
            subjects: self.subjects(),
        }
    }

    /// Merge a partial settings object, persist it, and start the batch when
    /// auto-process is on.
    ///
    /// The fallback credential stays in memory: it is never written to disk
    /// and fills in again when the saved key is empty.
    pub fn update_settings(&self, patch: &serde_json::Value) -> Result<Arc<Settings>, ForgeError> {
        let fallback = self.fallback_key();
        let mut to_save = self.settings().merged(patch)?;
        if !fallback.is_empty() && patch.get("apiKey").is_none() && to_save.api_key == fallback {
            to_save.api_key.clear();
        }
        self.inner.store.save_settings(&to_save)?;
        let mut next = to_save;
        if !next.has_credential() && !fallback.is_empty() {
            next.api_key = fallback;
        }
        let next = Arc::new(next);
        {
            let mut guard = self.inner.settings.write().unwrap_or_else(|p| p.into_inner());
            *guard = Arc::clone(&next);
        }
        self.log("Settings updated.");
        if next.auto_process && next.has_credential() && !self.is_running() {
            self.start();
        }
        Ok(next)
    }

    /// Replace all subject configurations.
    pub fn replace_subjects(&self, incoming: Vec<SubjectConfig>) -> Result<(), ForgeError> {
        let normalised = self.inner.store.replace_subjects(incoming)?;
        let mut guard = self.inner.subjects.write().unwrap_or_else(|p| p.into_inner());
        *guard = normalised;
        Ok(())
    }

    /// The system default prompts on disk.
    pub fn default_prompts(&self) -> PromptParts {
        self.inner.store.load_prompts(SYSTEM_ID)
    }

    pub fn status(&self) -> StatusSnapshot {
        let settings = self.settings();
        let snapshot = self.queue().snapshot();
        let quota = self.inner.quota.snapshot();
        StatusSnapshot {
            is_processing: self.is_running(),
            queue: snapshot.queue,
            completed: snapshot.completed,
            logs: snapshot.logs,
            uptime: self.inner.started_at.elapsed().as_secs_f64(),
            detected_subjects: detect_subjects(&settings.watched_folders),
            daily_request_count: quota.daily_request_count,
            max_requests_per_day: settings.max_requests_per_day,
            daily_reset_date: quota.daily_reset_date,
        }
    }
}

/// Forwards pipeline progress into the task record and activity log.
struct TaskProgress {
    controller: Controller,
    task_id: String,
}

impl ProgressSink for TaskProgress {
    fn on_progress(&self, percent: u8) {
        let mut q = self.controller.queue();
        if let Some(task) = q.get_mut(&self.task_id) {
            task.progress = task.progress.max(percent.min(100));
        }
    }

    fn on_message(&self, message: &str) {
        self.controller.log(message);
    }
}
