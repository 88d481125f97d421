//! Small shared helpers for normalizing values lifted out of report text.

use chrono::NaiveDate;

/// Date layouts seen across the lab's report templates, tried in order.
/// Day-first layouts come first: these are UK reports.
const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y", "%Y-%m-%d"];

/// Parse a date as printed on a report. Returns `None` for anything that
/// fits no known layout; callers keep the column NULL rather than guess.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Normalize a name as printed on reports (usually all caps) to title case.
/// Word boundaries are any non-alphabetic character, so hyphenated and
/// apostrophe names keep their inner capitals.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.trim().chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

/// Strip everything but digits. NHS numbers are printed as "943 476 5919".
pub fn digits_only(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

// ── Tests ──
