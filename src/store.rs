//! Durable state: settings, subject metadata and per-subject prompt files.
//!
//! Everything lives under one data directory:
//!
//! ```text
//! <data_dir>/
//!   server_config.json       settings
//!   server_subjects.json     subject metadata (no prompt text)
//!   server_state.json        daily quota, see crate::governor
//!   prompts/
//!     defaults/              system defaults ("system" subject)
//!     <Sanitized_Name>/      one folder per subject
//!       styleGuide.md  transcription.md  diagramDetection.md
//!       excalidraw.md  refinement.md
//! ```
//!
//! JSON files are written atomically (temp file + rename) so a crash in the
//! middle of a save never leaves a truncated config behind.

use crate::config::Settings;
use crate::error::ForgeError;
use crate::prompts::{PromptPart, PromptParts};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "server_config.json";
pub const SUBJECTS_FILE: &str = "server_subjects.json";
pub const STATE_FILE: &str = "server_state.json";
const PROMPTS_DIR: &str = "prompts";
const DEFAULTS_DIR: &str = "defaults";

/// Id of the subject whose prompts are the fallback for every other subject.
pub const GLOBAL_DEFAULTS_ID: &str = "GLOBAL_DEFAULTS";
pub const GLOBAL_DEFAULTS_NAME: &str = "Global Defaults";
/// Id that addresses the on-disk system defaults.
pub const SYSTEM_ID: &str = "system";

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
///
/// Used for prompt folders, note names, archive names and resource names so
/// that every name the crate derives is filesystem-safe and deterministic.
pub fn sanitize_filename(name: &str) -> String {
    if name.is_empty() {
        return "Untitled".to_string();
    }
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One subject's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectConfig {
    pub id: String,
    pub subject_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_excalidraw: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excalidraw_threshold: Option<f32>,
    #[serde(default)]
    pub prompts: PromptParts,
}

impl SubjectConfig {
    fn is_global_defaults(&self) -> bool {
        self.id == GLOBAL_DEFAULTS_ID || self.subject_name == GLOBAL_DEFAULTS_NAME
    }
}

/// Effective configuration for one document's subject.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSubject {
    pub prompts: PromptParts,
    pub generate_excalidraw: bool,
    pub excalidraw_threshold: f32,
}

/// Filesystem-backed store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (and create) the data directory, seeding the system default
    /// prompts if `prompts/defaults` does not exist yet.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ForgeError> {
        let store = Self { root: root.into() };
        let defaults = store.prompts_root().join(DEFAULTS_DIR);
        if !defaults.exists() {
            store.save_prompts(SYSTEM_ID, &PromptParts::builtin())?;
            info!("Seeded default prompts in {}", defaults.display());
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    fn prompts_root(&self) -> PathBuf {
        self.root.join(PROMPTS_DIR)
    }

    /// Folder under `prompts/` for an id. Ids that are not a single plain
    /// path component are sanitized so they cannot leave `prompts/`.
    fn prompt_dir(&self, id: &str) -> PathBuf {
        if id == SYSTEM_ID {
            return self.prompts_root().join(DEFAULTS_DIR);
        }
        let mut parts = Path::new(id).components();
        let plain = matches!(
            (parts.next(), parts.next()),
            (Some(Component::Normal(_)), None)
        ) && !id.contains([':', '\\']);
        if plain {
            self.prompts_root().join(id)
        } else {
            self.prompts_root().join(sanitize_filename(id))
        }
    }

    // ── Settings ─────────────────────────────────────────────────────────

    /// Load settings; a missing file yields defaults, a broken one is
    /// reported and replaced by defaults.
    pub fn load_settings(&self) -> Settings {
        match read_json::<Settings>(&self.path(CONFIG_FILE)) {
            Ok(Some(s)) => s,
            Ok(None) => Settings::default(),
            Err(e) => {
                warn!("{e}; falling back to default settings");
                Settings::default()
            }
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), ForgeError> {
        write_json_atomic(&self.path(CONFIG_FILE), settings)
    }

    // ── Prompts ──────────────────────────────────────────────────────────

    /// Read the five prompt files of a folder; missing files read as empty.
    pub fn load_prompts(&self, id: &str) -> PromptParts {
        let dir = self.prompt_dir(id);
        let mut parts = PromptParts::default();
        for part in PromptPart::ALL {
            let text = fs::read_to_string(dir.join(part.file_name())).unwrap_or_default();
            parts.set(part, text);
        }
        parts
    }

    pub fn save_prompts(&self, id: &str, parts: &PromptParts) -> Result<(), ForgeError> {
        let dir = self.prompt_dir(id);
        fs::create_dir_all(&dir).map_err(|e| ForgeError::OutputWriteFailed {
            path: dir.clone(),
            source: e,
        })?;
        for part in PromptPart::ALL {
            let path = dir.join(part.file_name());
            fs::write(&path, parts.get(part))
                .map_err(|e| ForgeError::OutputWriteFailed { path, source: e })?;
        }
        Ok(())
    }

    /// Deterministic folder id for a subject: its sanitized name.
    /// The global-defaults and system subjects keep their fixed ids.
    pub fn preferred_folder_id(subject: &SubjectConfig) -> String {
        if subject.id == GLOBAL_DEFAULTS_ID || subject.id == SYSTEM_ID {
            return subject.id.clone();
        }
        let basis = if !subject.subject_name.is_empty() {
            subject.subject_name.as_str()
        } else if !subject.id.is_empty() {
            subject.id.as_str()
        } else {
            "subject"
        };
        sanitize_filename(basis)
    }

    /// Folder a subject's prompts are read from: the preferred folder when
    /// it exists, else the legacy id folder when that exists.
    pub fn subject_folder_id(&self, subject: &SubjectConfig) -> String {
        let preferred = Self::preferred_folder_id(subject);
        if self.prompt_dir(&preferred).exists() {
            return preferred;
        }
        if !subject.id.is_empty() && self.prompt_dir(&subject.id).exists() {
            return subject.id.clone();
        }
        preferred
    }

    /// Copy a legacy prompt folder to its new location when the new one does
    /// not exist yet.
    fn migrate_prompt_folder(&self, legacy_id: &str, target_id: &str) -> Result<(), ForgeError> {
        if legacy_id.is_empty() || legacy_id == target_id {
            return Ok(());
        }
        let from = self.prompt_dir(legacy_id);
        let to = self.prompt_dir(target_id);
        if from.is_dir() && !to.exists() {
            copy_dir(&from, &to)?;
            info!("Migrated prompts from {legacy_id} to {target_id}");
        }
        Ok(())
    }

    // ── Subjects ─────────────────────────────────────────────────────────

    /// Load subject metadata and attach each subject's prompt files.
    pub fn load_subjects(&self) -> Vec<SubjectConfig> {
        let metas = match read_json::<Vec<SubjectConfig>>(&self.path(SUBJECTS_FILE)) {
            Ok(Some(v)) => v,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("{e}; starting without subjects");
                Vec::new()
            }
        };
        metas
            .into_iter()
            .map(|mut s| {
                let from_disk = self.load_prompts(&self.subject_folder_id(&s));
                // Older metadata files embedded prompt text; move it to disk once.
                if from_disk.transcription_goal.is_empty()
                    && !s.prompts.transcription_goal.is_empty()
                {
                    if let Err(e) = self.save_prompts(&Self::preferred_folder_id(&s), &s.prompts) {
                        warn!("Prompt migration for {} failed: {e}", s.id);
                    }
                } else {
                    s.prompts = from_disk;
                }
                s
            })
            .collect()
    }

    /// Replace the whole subject list.
    ///
    /// Each subject is re-keyed to its deterministic folder id, legacy
    /// folders are migrated, prompts are written, and metadata (without
    /// prompt text) is persisted. Returns the normalised list.
    pub fn replace_subjects(
        &self,
        incoming: Vec<SubjectConfig>,
    ) -> Result<Vec<SubjectConfig>, ForgeError> {
        let mut normalised = Vec::with_capacity(incoming.len());
        for mut sub in incoming {
            let target = Self::preferred_folder_id(&sub);
            self.migrate_prompt_folder(&sub.id, &target)?;
            self.save_prompts(&target, &sub.prompts)?;
            sub.id = target;
            normalised.push(sub);
        }

        let metas: Vec<serde_json::Value> = normalised
            .iter()
            .map(|s| {
                let mut v = serde_json::to_value(s).unwrap_or_default();
                if let Some(obj) = v.as_object_mut() {
                    obj.remove("prompts");
                }
                v
            })
            .collect();
        write_json_atomic(&self.path(SUBJECTS_FILE), &metas)?;
        Ok(normalised)
    }

    /// Resolve the effective prompts and flags for a subject name.
    ///
    /// Prompts fall back per part: subject → global defaults subject →
    /// system defaults on disk. Flags fall back to the settings.
    pub fn resolve_subject(
        &self,
        subject_name: &str,
        subjects: &[SubjectConfig],
        settings: &Settings,
    ) -> ResolvedSubject {
        let system = self.load_prompts(SYSTEM_ID);
        let subject = subjects.iter().find(|s| s.subject_name == subject_name);
        let global = subjects
            .iter()
            .find(|s| s.is_global_defaults())
            .map(|g| &g.prompts)
            .unwrap_or(&system);
        let empty = PromptParts::default();
        let own = subject.map(|s| &s.prompts).unwrap_or(&empty);

        ResolvedSubject {
            prompts: PromptParts::layered(&[own, global, &system]),
            generate_excalidraw: subject
                .and_then(|s| s.generate_excalidraw)
                .unwrap_or(settings.generate_excalidraw),
            excalidraw_threshold: subject
                .and_then(|s| s.excalidraw_threshold)
                .unwrap_or(settings.excalidraw_threshold),
        }
    }
}

// ── File helpers ─────────────────────────────────────────────────────────

/// Read a JSON file. `Ok(None)` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ForgeError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ForgeError::Persistence {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| ForgeError::Persistence {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

/// Pretty-print `value` to `path` via a temp file and rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ForgeError> {
    let body = serde_json::to_vec_pretty(value).map_err(|e| ForgeError::Persistence {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    write_atomic(path, &body)
}

/// Write bytes via a sibling temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ForgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ForgeError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, bytes).map_err(|e| ForgeError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    fs::rename(&tmp_path, path).map_err(|e| ForgeError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), ForgeError> {
    let io_err = |e: std::io::Error| ForgeError::OutputWriteFailed {
        path: to.to_path_buf(),
        source: e,
    };
    fs::create_dir_all(to).map_err(io_err)?;
    for entry in fs::read_dir(from).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let target = to.join(entry.file_name());
        if entry.file_type().map_err(io_err)?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(io_err)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(id: &str, name: &str) -> SubjectConfig {
        SubjectConfig {
            id: id.into(),
            subject_name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("Lineare Algebra 1"), "Lineare_Algebra_1");
        assert_eq!(sanitize_filename("a/b\\c.pdf"), "a_b_c_pdf");
        assert_eq!(sanitize_filename("ok-name_1"), "ok-name_1");
        assert_eq!(sanitize_filename("Übung"), "_bung");
        assert_eq!(sanitize_filename(""), "Untitled");
    }

    #[test]
    fn open_seeds_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let seeded = store.load_prompts(SYSTEM_ID);
        assert_eq!(seeded, PromptParts::builtin());

        // User edits survive a restart.
        let mut edited = seeded.clone();
        edited.style_guide = "mine".into();
        store.save_prompts(SYSTEM_ID, &edited).unwrap();
        let reopened = StateStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_prompts(SYSTEM_ID).style_guide, "mine");
    }

    #[test]
    fn settings_roundtrip_and_broken_file_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.load_settings().rpm, 10);

        let s = Settings::builder().rpm(3).build().unwrap();
        store.save_settings(&s).unwrap();
        assert_eq!(store.load_settings().rpm, 3);

        fs::write(store.path(CONFIG_FILE), "{ not json").unwrap();
        assert_eq!(store.load_settings().rpm, 10);
    }

    #[test]
    fn replace_subjects_uses_sanitized_name_and_migrates_legacy_folder() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        // Legacy folder keyed by an opaque id.
        let legacy = PromptParts {
            style_guide: "legacy style".into(),
            ..Default::default()
        };
        store.save_prompts("abc123", &legacy).unwrap();
        fs::write(store.prompt_dir("abc123").join("notes.txt"), "extra").unwrap();

        let mut incoming = subject("abc123", "Signals & Systems");
        incoming.prompts.style_guide = "new style".into();
        let out = store.replace_subjects(vec![incoming]).unwrap();

        assert_eq!(out[0].id, "Signals___Systems");
        let target = store.prompt_dir("Signals___Systems");
        assert!(target.join("notes.txt").exists(), "legacy folder copied");
        assert_eq!(store.load_prompts("Signals___Systems").style_guide, "new style");

        // A fresh subject without a legacy folder also gets its sanitized name.
        let out = store
            .replace_subjects(vec![subject("zzz", "Signals & Systems 2")])
            .unwrap();
        assert_eq!(out[0].id, "Signals___Systems_2");
        assert!(store.prompt_dir("Signals___Systems_2").join("styleGuide.md").exists());
    }

    #[test]
    fn reads_fall_back_to_legacy_folder() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.save_prompts("legacy-id", &PromptParts::default()).unwrap();
        let s = subject("legacy-id", "Chemistry");
        assert_eq!(store.subject_folder_id(&s), "legacy-id");
        store.save_prompts("Chemistry", &PromptParts::default()).unwrap();
        assert_eq!(store.subject_folder_id(&s), "Chemistry");
    }

    #[test]
    fn migration_copies_legacy_when_preferred_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store
            .save_prompts("old", &PromptParts::default())
            .unwrap();
        fs::write(store.prompt_dir("old").join("notes.txt"), "extra").unwrap();

        store.migrate_prompt_folder("old", "Physics").unwrap();
        assert!(store.prompt_dir("Physics").join("notes.txt").exists());
        // Existing target is never overwritten.
        fs::write(store.prompt_dir("old").join("notes.txt"), "changed").unwrap();
        store.migrate_prompt_folder("old", "Physics").unwrap();
        let kept = fs::read_to_string(store.prompt_dir("Physics").join("notes.txt")).unwrap();
        assert_eq!(kept, "extra");
    }

    #[test]
    fn legacy_ids_cannot_escape_the_prompts_folder() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("data")).unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), "do not copy").unwrap();

        for id in ["../../outside", "../outside", "/tmp", "a/b", "..", "C:\\x"] {
            let d = store.prompt_dir(id);
            assert_eq!(d.parent(), Some(store.prompts_root().as_path()), "id {id:?}");
        }

        let out = store
            .replace_subjects(vec![subject("../../outside", "Math")])
            .unwrap();
        assert_eq!(out[0].id, "Math");
        assert!(!store.prompt_dir("Math").join("secret.txt").exists());
        assert!(outside.join("secret.txt").exists());
    }

    #[test]
    fn subjects_metadata_excludes_prompt_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let mut s = subject("x", "Math");
        s.prompts.transcription_goal = "secret prompt body".into();
        s.generate_excalidraw = Some(false);
        store.replace_subjects(vec![s]).unwrap();

        let raw = fs::read_to_string(store.path(SUBJECTS_FILE)).unwrap();
        assert!(!raw.contains("secret prompt body"));

        let loaded = store.load_subjects();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "Math");
        assert_eq!(loaded[0].generate_excalidraw, Some(false));
        assert_eq!(loaded[0].prompts.transcription_goal, "secret prompt body");
    }

    #[test]
    fn resolve_subject_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let settings = Settings::default();

        let mut global = subject(GLOBAL_DEFAULTS_ID, GLOBAL_DEFAULTS_NAME);
        global.prompts.style_guide = "global style".into();
        let mut math = subject("Math", "Math");
        math.prompts.refinement_goal = "math refine".into();
        math.excalidraw_threshold = Some(0.9);
        let subjects = vec![global, math];

        let r = store.resolve_subject("Math", &subjects, &settings);
        assert_eq!(r.prompts.refinement_goal, "math refine");
        assert_eq!(r.prompts.style_guide, "global style");
        assert_eq!(
            r.prompts.transcription_goal,
            crate::prompts::DEFAULT_TRANSCRIPTION_GOAL
        );
        assert!((r.excalidraw_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(r.generate_excalidraw, settings.generate_excalidraw);

        let unknown = store.resolve_subject("Nope", &subjects, &settings);
        assert_eq!(unknown.prompts.style_guide, "global style");
        assert!((unknown.excalidraw_threshold - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("state.json");
        write_json_atomic(&target, &serde_json::json!({ "a": 1 })).unwrap();
        assert!(target.exists());
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
        let back: Option<serde_json::Value> = read_json(&target).unwrap();
        assert_eq!(back.unwrap()["a"], 1);
    }
}
