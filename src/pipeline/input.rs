//! Input validation: make sure a queued path is a readable PDF before any
//! rendering or model call is spent on it.
//!
//! pdfium reports a non-PDF as a generic load failure; checking the `%PDF`
//! magic bytes up front gives the task a precise error message instead.

use crate::error::ForgeError;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Validate that `path` exists, is readable and starts with `%PDF`.
pub fn validate_pdf(path: &Path) -> Result<(), ForgeError> {
    let mut f = std::fs::File::open(path).map_err(|_| ForgeError::FileNotFound {
        path: path.to_path_buf(),
    })?;
    let mut magic = [0u8; 4];
    if f.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
        return Err(ForgeError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    debug!("Validated PDF: {}", path.display());
    Ok(())
}

/// True for paths the queue should accept: `.pdf` extension (any case) and
/// not a hidden file. Hidden folders are pruned by the directory walk.
pub fn is_candidate_pdf(path: &Path) -> bool {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    is_pdf && !hidden
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_file() {
        let err = validate_pdf(Path::new("/definitely/not/here.pdf")).unwrap_err();
        assert!(matches!(err, ForgeError::FileNotFound { .. }));
    }

    #[test]
    fn wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("fake.pdf");
        std::fs::write(&p, b"PK\x03\x04rest").unwrap();
        let err = validate_pdf(&p).unwrap_err();
        assert!(matches!(err, ForgeError::NotAPdf { magic, .. } if &magic == b"PK\x03\x04"));
    }

    #[test]
    fn accepts_pdf_magic() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("ok.pdf");
        std::fs::write(&p, b"%PDF-1.7\n").unwrap();
        validate_pdf(&p).unwrap();
    }

    #[test]
    fn candidate_filter() {
        assert!(is_candidate_pdf(&PathBuf::from("/in/Math/L1.PDF")));
        assert!(!is_candidate_pdf(&PathBuf::from("/in/Math/L1.txt")));
        assert!(!is_candidate_pdf(&PathBuf::from("/in/Math/.L1.pdf")));
        assert!(is_candidate_pdf(&PathBuf::from("./in/L1.pdf")));
    }
}
