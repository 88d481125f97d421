use thiserror::Error;

/// Failures that can stop a single document, or the whole scan.
///
/// `SourceUnavailable` and `MissingIdentityAnchor` are scoped to one
/// document: the scanner records them and moves on. `Db` means the store
/// itself failed and the batch stops.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The document could not be read or converted to text.
    #[error("source unavailable for {path}: {reason}")]
    SourceUnavailable { path: String, reason: String },

    /// No patient identifier in the extracted record; nothing may be persisted.
    #[error("no patient identifier extracted from {0}")]
    MissingIdentityAnchor(String),

    /// The requested report family has no extraction table.
    #[error("unrecognised report type '{0}' (expected: full-pft)")]
    UnrecognizedVariant(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}
