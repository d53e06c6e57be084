//! Task queue, bounded history and activity log.
//!
//! [`QueueState`] is plain data with synchronous methods. The controller owns
//! exactly one instance behind a mutex, so every mutation is one short,
//! atomic step and readers always get a consistent [`QueueSnapshot`].

use crate::error::ForgeError;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;

/// History keeps at most this many finished tasks (newest first).
pub const HISTORY_CAP: usize = 50;
/// Activity log keeps at most this many lines.
pub const LOG_CAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// One document to convert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// File name of the source, e.g. `Lecture 03.pdf`.
    pub display_name: String,
    /// Subject label used to resolve prompts.
    pub subject: String,
    pub source_path: PathBuf,
    /// Folder of the source relative to its watch root ("" at the root).
    pub relative_folder: PathBuf,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        display_name: impl Into<String>,
        subject: impl Into<String>,
        source_path: PathBuf,
        relative_folder: PathBuf,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            display_name: display_name.into(),
            subject: subject.into(),
            source_path,
            relative_folder,
            status: TaskStatus::Pending,
            progress: 0,
            error: None,
        }
    }
}

/// Read-only copy handed to the control surface.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub queue: Vec<Task>,
    pub completed: Vec<Task>,
    pub logs: Vec<String>,
}

#[derive(Debug, Default)]
pub struct QueueState {
    queue: Vec<Task>,
    completed: VecDeque<Task>,
    logs: VecDeque<String>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a timestamped line to the activity log.
    pub fn log(&mut self, msg: impl AsRef<str>) {
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), msg.as_ref());
        self.logs.push_back(line);
        while self.logs.len() > LOG_CAP {
            self.logs.pop_front();
        }
    }

    /// True when a task for this source is queued or in history.
    pub fn knows_source(&self, path: &std::path::Path) -> bool {
        self.queue.iter().any(|t| t.source_path == path)
            || self.completed.iter().any(|t| t.source_path == path)
    }

    pub fn push(&mut self, task: Task) {
        self.queue.push(task);
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.queue.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.queue.iter_mut().find(|t| t.id == id)
    }

    /// Mark a queued task as processing and return a copy of it. A task
    /// that is already processing is refused.
    pub fn claim(&mut self, id: &str) -> Result<Task, ForgeError> {
        let task = self
            .get_mut(id)
            .ok_or_else(|| ForgeError::TaskNotFound(id.to_string()))?;
        if task.status == TaskStatus::Processing {
            return Err(ForgeError::TaskBusy(task.display_name.clone()));
        }
        task.status = TaskStatus::Processing;
        task.progress = 1;
        task.error = None;
        Ok(task.clone())
    }

    /// Claim the first pending task in queue order.
    pub fn claim_next(&mut self) -> Option<Task> {
        let id = self
            .queue
            .iter()
            .find(|t| t.status == TaskStatus::Pending)?
            .id
            .clone();
        self.claim(&id).ok()
    }

    /// Put a claimed task back to pending at its current queue position.
    pub fn release(&mut self, id: &str) {
        if let Some(task) = self.get_mut(id) {
            task.status = TaskStatus::Pending;
            task.progress = 0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Reorder by id list: listed ids first in the given order (unknown and
    /// repeated ids ignored), then every unlisted task in its original order.
    pub fn reorder(&mut self, ordered_ids: &[String]) {
        let mut rest = std::mem::take(&mut self.queue);
        let mut next = Vec::with_capacity(rest.len());
        for id in ordered_ids {
            if let Some(pos) = rest.iter().position(|t| &t.id == id) {
                next.push(rest.remove(pos));
            }
        }
        next.extend(rest);
        self.queue = next;
    }

    /// Move a finished task from history back to the end of the queue,
    /// reset to pending. Returns false when the id is not in history.
    pub fn redo(&mut self, id: &str) -> bool {
        let Some(pos) = self.completed.iter().position(|t| t.id == id) else {
            return false;
        };
        let Some(mut task) = self.completed.remove(pos) else {
            return false;
        };
        task.status = TaskStatus::Pending;
        task.progress = 0;
        task.error = None;
        self.queue.push(task);
        true
    }

    /// Remove a task from the queue and prepend it to history with its final
    /// status. The oldest history entry is evicted past [`HISTORY_CAP`].
    pub fn finish(&mut self, id: &str, outcome: Result<(), String>) -> Option<Task> {
        let pos = self.queue.iter().position(|t| t.id == id)?;
        let mut task = self.queue.remove(pos);
        match outcome {
            Ok(()) => {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.error = None;
            }
            Err(msg) => {
                task.status = TaskStatus::Error;
                task.error = Some(msg);
            }
        }
        self.completed.push_front(task.clone());
        self.completed.truncate(HISTORY_CAP);
        Some(task)
    }

    pub fn clear_history(&mut self) {
        self.completed.clear();
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queue: self.queue.clone(),
            completed: self.completed.iter().cloned().collect(),
            logs: self.logs.iter().cloned().collect(),
        }
    }
}
