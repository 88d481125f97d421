//! Field extraction engine.
//!
//! A report family is described by an ordered table of `FieldSpec`s, each
//! binding a destination key to a regex and a capture group. `extract` runs
//! the whole table against the document text and never short-circuits: a
//! missing required field downgrades the status and is logged, but every
//! remaining spec still runs so the record recovers as much as it can.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

/// Destination of an extracted value: a top-level scalar, or one sub-field
/// of a named measurement group ("fev1.measured_pre").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldKey {
    pub group: Option<&'static str>,
    pub name: &'static str,
}

impl FieldKey {
    pub const fn scalar(name: &'static str) -> Self {
        Self { group: None, name }
    }

    pub const fn grouped(group: &'static str, name: &'static str) -> Self {
        Self {
            group: Some(group),
            name,
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.group {
            Some(g) => write!(f, "{}.{}", g, self.name),
            None => f.write_str(self.name),
        }
    }
}

/// One row of a report family's extraction table.
pub struct FieldSpec {
    pub key: FieldKey,
    pub pattern: Regex,
    /// Capture group index holding the value. Several specs can share one
    /// pattern and pull different groups out of it.
    pub capture: usize,
    pub required: bool,
}

/// Extraction state for one parse attempt, in the order it progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractionStatus {
    #[default]
    NotStarted,
    /// The document text could not be obtained; extraction never ran.
    NoSource,
    /// At least one required field failed to match.
    Incomplete,
    /// Every required field matched.
    Ok,
}

impl ExtractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionStatus::NotStarted => "not_started",
            ExtractionStatus::NoSource => "no_source",
            ExtractionStatus::Incomplete => "incomplete",
            ExtractionStatus::Ok => "ok",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(String),
    Group(BTreeMap<String, String>),
}

/// Key/value record built up by extraction. Possibly partial: an absent key
/// means the field was not found in the source text.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ExtractedRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl ExtractedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Top-level scalar by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Scalar(s)) => Some(s),
            _ => None,
        }
    }

    /// Sub-field of a measurement group.
    pub fn get_in(&self, group: &str, name: &str) -> Option<&str> {
        match self.fields.get(group) {
            Some(FieldValue::Group(g)) => g.get(name).map(String::as_str),
            _ => None,
        }
    }

    pub fn has_group(&self, group: &str) -> bool {
        matches!(self.fields.get(group), Some(FieldValue::Group(_)))
    }

    pub fn insert(&mut self, key: FieldKey, value: &str) {
        let value = value.trim().to_string();
        match key.group {
            None => {
                self.fields
                    .insert(key.name.to_string(), FieldValue::Scalar(value));
            }
            Some(group) => {
                let entry = self
                    .fields
                    .entry(group.to_string())
                    .or_insert_with(|| FieldValue::Group(BTreeMap::new()));
                if let FieldValue::Group(g) = entry {
                    g.insert(key.name.to_string(), value);
                }
            }
        }
    }
}

/// Apply a spec table to document text. First match in the text wins for
/// each spec. Specs are independent: one miss never stops the rest.
pub fn extract(
    text: &str,
    specs: &[FieldSpec],
    source_id: &str,
) -> (ExtractedRecord, ExtractionStatus) {
    let mut record = ExtractedRecord::new();
    let mut status = ExtractionStatus::NotStarted;

    for spec in specs {
        // A pattern can match while an optional capture group sits out; for
        // the spec addressing that group this counts as no value.
        let value = spec
            .pattern
            .captures(text)
            .and_then(|caps| caps.get(spec.capture))
            .map(|m| m.as_str());

        match value {
            Some(v) => record.insert(spec.key, v),
            None if spec.required => {
                warn!(key = %spec.key, source = source_id, "required field not found");
                status = ExtractionStatus::Incomplete;
            }
            None => {}
        }
    }

    if status == ExtractionStatus::NotStarted {
        status = ExtractionStatus::Ok;
    }
    (record, status)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(key: FieldKey, pattern: &str, capture: usize, required: bool) -> FieldSpec {
        FieldSpec {
            key,
            pattern: Regex::new(pattern).unwrap(),
            capture,
            required,
        }
    }

    #[test]
    fn scalar_and_grouped_keys() {
        let specs = vec![
            spec(FieldKey::scalar("rxr"), r"RXR: (\w+)", 1, true),
            spec(FieldKey::grouped("fev1", "measured"), r"FEV1 ([\d.]+)", 1, true),
        ];
        let (rec, status) = extract("RXR: AB1234\nFEV1 3.10", &specs, "t");
        assert_eq!(status, ExtractionStatus::Ok);
        assert_eq!(rec.get("rxr"), Some("AB1234"));
        assert_eq!(rec.get_in("fev1", "measured"), Some("3.10"));
        assert!(rec.has_group("fev1"));
        assert!(!rec.has_group("fvc"));
    }

    #[test]
    fn required_miss_does_not_stop_later_specs() {
        let specs = vec![
            spec(FieldKey::scalar("rxr"), r"RXR: (\w+)", 1, true),
            spec(FieldKey::scalar("sex"), r"Sex: (\w+)", 1, true),
        ];
        let (rec, status) = extract("Sex: Female", &specs, "t");
        assert_eq!(status, ExtractionStatus::Incomplete);
        assert_eq!(rec.get("rxr"), None);
        assert_eq!(rec.get("sex"), Some("Female"));
    }

    #[test]
    fn optional_miss_keeps_status_ok() {
        let specs = vec![spec(FieldKey::scalar("nhs"), r"NHS: (\d+)", 1, false)];
        let (rec, status) = extract("no numbers here", &specs, "t");
        assert_eq!(status, ExtractionStatus::Ok);
        assert!(rec.is_empty());
    }

    #[test]
    fn empty_text_fails_every_required_spec() {
        let specs = vec![
            spec(FieldKey::scalar("a"), r"a(\d)", 1, true),
            spec(FieldKey::scalar("b"), r"b(\d)", 1, true),
        ];
        let (rec, status) = extract("", &specs, "t");
        assert_eq!(status, ExtractionStatus::Incomplete);
        assert!(rec.is_empty());
    }

    #[test]
    fn non_participating_group_is_a_miss() {
        // Pattern matches but the optional second number is absent.
        let specs = vec![
            spec(FieldKey::scalar("first"), r"x (\d+)(?: (\d+))?", 1, true),
            spec(FieldKey::scalar("second"), r"x (\d+)(?: (\d+))?", 2, false),
        ];
        let (rec, status) = extract("x 42", &specs, "t");
        assert_eq!(status, ExtractionStatus::Ok);
        assert_eq!(rec.get("first"), Some("42"));
        assert_eq!(rec.get("second"), None);
    }

    #[test]
    fn first_match_in_text_wins() {
        let specs = vec![spec(FieldKey::scalar("v"), r"v=(\d+)", 1, true)];
        let (rec, _) = extract("v=1 v=2 v=3", &specs, "t");
        assert_eq!(rec.get("v"), Some("1"));
    }

    #[test]
    fn values_are_trimmed() {
        let specs = vec![spec(FieldKey::scalar("name"), r"Name:(.*)", 1, true)];
        let (rec, _) = extract("Name:  Smith  ", &specs, "t");
        assert_eq!(rec.get("name"), Some("Smith"));
    }
}
