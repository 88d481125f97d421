//! Text acquisition boundary.
//!
//! The scanner never opens document formats itself: it hands a path to a
//! `TextSource` and gets plain text back. Keeping the boundary a trait means
//! the extraction pipeline can be driven from captured text in tests.

use std::path::Path;

use crate::error::ScanError;

pub trait TextSource {
    /// Text content of the document at `path`.
    fn read_text(&self, path: &Path) -> Result<String, ScanError>;
}

/// Reads PDF reports through the pdf-extract converter.
pub struct PdfTextSource;

impl TextSource for PdfTextSource {
    fn read_text(&self, path: &Path) -> Result<String, ScanError> {
        if !path.is_file() {
            return Err(ScanError::SourceUnavailable {
                path: path.display().to_string(),
                reason: "no such file".into(),
            });
        }
        pdf_extract::extract_text(path).map_err(|e| ScanError::SourceUnavailable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file() {
        let err = PdfTextSource
            .read_text(Path::new("tests/fixtures/does_not_exist.pdf"))
            .unwrap_err();
        assert!(matches!(err, ScanError::SourceUnavailable { .. }));
        let msg = err.to_string();
        assert!(msg.contains("does_not_exist.pdf") && msg.contains("no such file"));
    }

    #[test]
    fn not_a_pdf() {
        // A text fixture is a real file but not a readable PDF.
        let err = PdfTextSource
            .read_text(Path::new("tests/fixtures/full_panel.txt"))
            .unwrap_err();
        assert!(matches!(err, ScanError::SourceUnavailable { .. }));
    }
}
