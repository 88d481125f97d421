//! Report parsing: a `ReportKind` picks an extraction table, the engine
//! applies it, `ParsedReport` carries whatever came out plus the status.

pub mod engine;
pub mod fullpft;

use engine::{extract, ExtractedRecord, ExtractionStatus, FieldSpec};

/// Report families this tool has an extraction table for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Full lung-function panel: spirometry plus gas transfer and volumes.
    FullPft,
}

impl ReportKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "full-pft" | "full_pft" | "fullpft" => Some(ReportKind::FullPft),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReportKind::FullPft => "full-pft",
        }
    }

    /// Extraction table for this family. Built once per batch and shared
    /// across every document.
    pub fn field_specs(self) -> Vec<FieldSpec> {
        match self {
            ReportKind::FullPft => fullpft::field_specs(),
        }
    }
}

/// Outcome of one parse attempt. The record is best-effort: it holds
/// whatever was extracted even when the status is not `Ok`.
pub struct ParsedReport {
    record: ExtractedRecord,
    status: ExtractionStatus,
    source_id: String,
}

impl ParsedReport {
    pub fn from_text(text: &str, specs: &[FieldSpec], source_id: impl Into<String>) -> Self {
        let source_id = source_id.into();
        let (record, status) = extract(text, specs, &source_id);
        Self {
            record,
            status,
            source_id,
        }
    }

    /// A document whose text could not be obtained; extraction never ran.
    pub fn no_source(source_id: impl Into<String>) -> Self {
        Self {
            record: ExtractedRecord::new(),
            status: ExtractionStatus::NoSource,
            source_id: source_id.into(),
        }
    }

    /// True when every required field of the family was extracted.
    pub fn is_ok(&self) -> bool {
        self.status == ExtractionStatus::Ok
    }

    pub fn status(&self) -> ExtractionStatus {
        self.status
    }

    pub fn record(&self) -> &ExtractedRecord {
        &self.record
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

// ── Tests ──
