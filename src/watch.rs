//! Watch roots: subject attribution, document discovery, detected subjects.
//!
//! A watch root holds one folder per subject:
//!
//! ```text
//! input_pdfs/               ← watch root
//! ├── Math/                 ← subject "Math"
//! │   └── Week1/L1.pdf      ← relative folder "Math/Week1"
//! └── intro.pdf             ← subject "input_pdfs", relative folder ""
//! ```

use crate::pipeline::input::is_candidate_pdf;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a document sits relative to the watch roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub subject: String,
    /// Folder of the document below its root; empty at the root itself or
    /// when no root contains it.
    pub relative_folder: PathBuf,
}

fn absolute(p: &Path) -> PathBuf {
    std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())
}

fn file_name_string(p: &Path) -> String {
    p.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Attribute `path` to a subject.
///
/// Under a root: the first path segment below the root, or the root's own
/// name for files directly inside it. Outside every root: the name of the
/// containing folder.
pub fn attribute_subject(path: &Path, roots: &[PathBuf]) -> Attribution {
    let abs = absolute(path);
    let dir = abs.parent().map(Path::to_path_buf).unwrap_or_default();

    for root in roots {
        let abs_root = absolute(root);
        let Ok(rel) = dir.strip_prefix(&abs_root) else {
            continue;
        };
        let subject = rel
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name_string(&abs_root));
        return Attribution {
            subject,
            relative_folder: rel.to_path_buf(),
        };
    }

    Attribution {
        subject: file_name_string(&dir),
        relative_folder: PathBuf::new(),
    }
}

/// Every candidate PDF below the roots, sorted. Missing roots are skipped;
/// hidden files and folders are not descended into.
pub fn discover_documents(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for root in roots {
        walk(root, &mut found);
    }
    found.sort();
    found.dedup();
    found
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!("Skipping unreadable folder {}", dir.display());
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        match entry.file_type() {
            Ok(t) if t.is_dir() => walk(&path, out),
            Ok(t) if t.is_file() && is_candidate_pdf(&path) => out.push(path),
            _ => {}
        }
    }
}

/// Names of the immediate, non-hidden subfolders of all roots, sorted and
/// unique.
pub fn detect_subjects(roots: &[PathBuf]) -> Vec<String> {
    let mut names: Vec<String> = roots
        .iter()
        .filter_map(|r| std::fs::read_dir(r).ok())
        .flat_map(|entries| entries.flatten())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names.dedup();
    names
}
