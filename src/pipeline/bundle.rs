//! Phase 6: note-app bundle.
//!
//! Archive layout:
//!
//! ```text
//! <note>.zip
//! ├── !!!meta.json            manifest (root text note → children, attachments)
//! ├── <note>.md               the document
//! ├── <label>_<rand>.png      raster fallbacks, top level
//! └── <note>/
//!     └── <label>_<rand>.excalidraw
//! ```

use crate::error::ForgeError;
use crate::store::{sanitize_filename, write_atomic};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MANIFEST_NAME: &str = "!!!meta.json";
pub const FORMAT_VERSION: u32 = 2;
pub const APP_VERSION: &str = "0.100.0";

/// Random alphanumeric id of length `n`.
pub fn random_id(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

/// One file inside the archive, path relative to the archive root.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Image attachment of the root note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub attachment_id: String,
    pub title: String,
    pub role: String,
    pub mime: String,
    pub position: u32,
    pub data_file_name: String,
}

impl Attachment {
    pub fn image(title: &str, data_file_name: &str) -> Self {
        Self {
            attachment_id: random_id(12),
            title: title.to_string(),
            role: "image".into(),
            mime: "image/png".into(),
            position: 0,
            data_file_name: data_file_name.to_string(),
        }
    }
}

/// A note in the manifest tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteEntry {
    pub is_clone: bool,
    pub note_id: String,
    pub note_path: Vec<String>,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub note_position: u32,
    pub prefix: Option<String>,
    pub is_expanded: bool,
    pub data_file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_file_name: Option<String>,
    pub attributes: Vec<serde_json::Value>,
    pub children: Vec<NoteEntry>,
    pub attachments: Vec<Attachment>,
}

impl NoteEntry {
    /// Canvas child note for an Excalidraw drawing stored at
    /// `<parent dir>/<data_file_name>`.
    pub fn canvas(parent_id: &str, title: &str, data_file_name: &str) -> Self {
        let note_id = random_id(12);
        Self {
            is_clone: false,
            note_path: vec![parent_id.to_string(), note_id.clone()],
            note_id,
            title: title.to_string(),
            kind: "canvas".into(),
            mime: "application/json".into(),
            format: None,
            note_position: 10,
            prefix: None,
            is_expanded: false,
            data_file_name: data_file_name.to_string(),
            dir_file_name: None,
            attributes: Vec::new(),
            children: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// Root Markdown note.
    pub fn root(
        note_id: &str,
        title: &str,
        safe_name: &str,
        children: Vec<NoteEntry>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            is_clone: false,
            note_id: note_id.to_string(),
            note_path: vec![note_id.to_string()],
            title: title.to_string(),
            kind: "text".into(),
            mime: "text/html".into(),
            format: Some("markdown".into()),
            note_position: 10,
            prefix: None,
            is_expanded: true,
            data_file_name: format!("{safe_name}.md"),
            dir_file_name: Some(safe_name.to_string()),
            attributes: Vec::new(),
            children,
            attachments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub format_version: u32,
    pub app_version: String,
    pub files: Vec<NoteEntry>,
}

impl Manifest {
    pub fn new(root: NoteEntry) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            app_version: APP_VERSION.to_string(),
            files: vec![root],
        }
    }
}

/// Everything that goes into one archive.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Original document title (file stem).
    pub title: String,
    /// Sanitized stem used for file and folder names.
    pub safe_name: String,
    pub root_note_id: String,
    pub markdown: String,
    pub files: Vec<BundleFile>,
    pub children: Vec<NoteEntry>,
    pub attachments: Vec<Attachment>,
}

impl Bundle {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            safe_name: sanitize_filename(title),
            root_note_id: random_id(12),
            markdown: String::new(),
            files: Vec::new(),
            children: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn archive_name(&self) -> String {
        format!("{}.zip", self.safe_name)
    }

    pub fn manifest(&self) -> Manifest {
        Manifest::new(NoteEntry::root(
            &self.root_note_id,
            &self.title,
            &self.safe_name,
            self.children.clone(),
            self.attachments.clone(),
        ))
    }

    /// Build the zip archive in memory.
    pub fn to_zip(&self) -> Result<Vec<u8>, ForgeError> {
        let archive_err = |detail: String| ForgeError::Archive {
            path: PathBuf::from(self.archive_name()),
            detail,
        };
        let manifest = serde_json::to_vec_pretty(&self.manifest())
            .map_err(|e| archive_err(e.to_string()))?;

        let mut buf = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buf));
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

            let mut add = |name: &str, bytes: &[u8]| -> Result<(), ForgeError> {
                zip.start_file(name, options)
                    .map_err(|e| archive_err(e.to_string()))?;
                zip.write_all(bytes).map_err(|e| archive_err(e.to_string()))
            };
            add(&format!("{}.md", self.safe_name), self.markdown.as_bytes())?;
            for f in &self.files {
                add(&f.path, &f.bytes)?;
            }
            add(MANIFEST_NAME, &manifest)?;

            zip.finish().map_err(|e| archive_err(e.to_string()))?;
        }
        Ok(buf)
    }

    /// Write the archive into `dir` (created if missing) and return its path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ForgeError> {
        std::fs::create_dir_all(dir).map_err(|e| ForgeError::OutputWriteFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = dir.join(self.archive_name());
        write_atomic(&path, &self.to_zip()?)?;
        Ok(path)
    }
}

/// Directory the archive for `source` is written to.
pub fn target_dir(
    source: &Path,
    relative_folder: &Path,
    output_folder: &Path,
    same_folder: bool,
) -> PathBuf {
    let source_dir = source.parent().map(Path::to_path_buf).unwrap_or_default();
    if same_folder || output_folder.as_os_str().is_empty() {
        source_dir
    } else {
        output_folder.join(relative_folder)
    }
}

/// True when `archive_name` exists in `dir` or one subdirectory below it.
pub fn output_exists(dir: &Path, archive_name: &str) -> bool {
    if dir.join(archive_name).is_file() {
        return true;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .any(|e| e.path().join(archive_name).is_file())
}
