//! Extraction table for the full lung-function report family.
//!
//! Covers the lab's standard print layout: a demographics header, a
//! spirometry table with pre/post bronchodilator columns, then gas transfer
//! and lung volume rows. The patterns are data: a new report family means a
//! new table, not new engine code.
//!
//! Row shape is `Label (unit)  measured  predicted  %pred  [SR]`. Several
//! labels are prefixes of other labels (TLC/TLCO, RV/"RV/TLC", VC/FVC), so
//! every row pattern anchors at line start and requires whitespace before
//! the first number. Spirometry rows carry four more columns when a post
//! bronchodilator test was done.

use regex::Regex;

use super::engine::{FieldKey, FieldSpec};

/// Numeric column atom: "3.50", "-1.2", "88".
const NUM: &str = r"(-?\d+(?:\.\d+)?)";

pub fn field_specs() -> Vec<FieldSpec> {
    let mut specs = Vec::with_capacity(64);

    // Demographics. Surname and forename come out of one
    // "Name: SURNAME, Forename" pattern via two capture groups.
    let name = Regex::new(r"(?i)\bName\s*:?\s*([A-Za-z'\-]+)\s*,\s*([A-Za-z'\-]+)").unwrap();
    scalar(&mut specs, "lname", &name, 1, true);
    scalar(&mut specs, "fname", &name, 2, true);

    let date = r"(\d{1,2}[./-]\d{1,2}[./-]\d{4}|\d{4}-\d{2}-\d{2})";
    scalar(
        &mut specs,
        "rxr",
        &Regex::new(r"(?i)\bRXR\s*(?:No\.?)?\s*:?\s*([A-Za-z]{2}\s?\d{3,6})").unwrap(),
        1,
        true,
    );
    scalar(
        &mut specs,
        "dob",
        &Regex::new(&format!(r"(?i)\b(?:DOB|Date\s+of\s+Birth)\s*:?\s*{date}")).unwrap(),
        1,
        true,
    );
    scalar(
        &mut specs,
        "date",
        &Regex::new(&format!(r"(?i)\b(?:Test|Study|Visit)?\s*Date\s*:?\s*{date}")).unwrap(),
        1,
        true,
    );
    scalar(
        &mut specs,
        "nhs",
        &Regex::new(r"(?i)\bNHS\s*(?:No\.?)?\s*:?\s*(\d[\d ]{8,14}\d)").unwrap(),
        1,
        false,
    );
    scalar(
        &mut specs,
        "sex",
        &Regex::new(r"(?i)\bSex\s*:?\s*(Male|Female)").unwrap(),
        1,
        false,
    );
    scalar(
        &mut specs,
        "height",
        &Regex::new(r"(?i)\bHeight\s*:?\s*(\d+(?:\.\d+)?)\s*cm").unwrap(),
        1,
        false,
    );
    scalar(
        &mut specs,
        "weight",
        &Regex::new(r"(?i)\bWeight\s*:?\s*(\d+(?:\.\d+)?)\s*kg").unwrap(),
        1,
        false,
    );

    // Spirometry. The "FEV1/FVC" ratio row never matches here: after the
    // label these patterns demand an optional "(unit)" then whitespace.
    spiro_row(&mut specs, "fev1", "FEV1");
    spiro_row(&mut specs, "fvc", "FVC");

    // Gas transfer. VA(SB) and KCO are printed without an SR column.
    panel_row(&mut specs, "tlco", "TLCO", true);
    panel_row(&mut specs, "vasb", r"VA\(SB\)", false);
    panel_row(&mut specs, "kco", "KCO", false);

    // Lung volumes.
    panel_row(&mut specs, "frc", "FRC", true);
    panel_row(&mut specs, "vc", "VC", true);
    panel_row(&mut specs, "tlc", "TLC", true);
    panel_row(&mut specs, "rv", "RV", true);
    panel_row(&mut specs, "tlcrv", "RV/TLC", true);

    specs
}

fn scalar(
    specs: &mut Vec<FieldSpec>,
    name: &'static str,
    re: &Regex,
    capture: usize,
    required: bool,
) {
    specs.push(FieldSpec {
        key: FieldKey::scalar(name),
        pattern: re.clone(),
        capture,
        required,
    });
}

fn grouped(
    specs: &mut Vec<FieldSpec>,
    group: &'static str,
    name: &'static str,
    re: &Regex,
    capture: usize,
    required: bool,
) {
    specs.push(FieldSpec {
        key: FieldKey::grouped(group, name),
        pattern: re.clone(),
        capture,
        required,
    });
}

/// Pre columns are required, post columns match as an all-or-nothing block.
/// Separators are horizontal whitespace only, so a row never bleeds into
/// the next line.
fn spiro_row(specs: &mut Vec<FieldSpec>, group: &'static str, label: &str) {
    let re = Regex::new(&format!(
        r"(?m)^\s*{label}(?:[ \t]*\([^)]*\))?[ \t]+{N}[ \t]+{N}[ \t]+{N}[ \t]+{N}(?:[ \t]+{N}[ \t]+{N}[ \t]+{N}[ \t]+{N})?",
        N = NUM,
    ))
    .unwrap();
    grouped(specs, group, "measured_pre", &re, 1, true);
    grouped(specs, group, "predicted", &re, 2, true);
    grouped(specs, group, "percent_pred_pre", &re, 3, true);
    grouped(specs, group, "sr_pre", &re, 4, true);
    grouped(specs, group, "measured_post", &re, 5, false);
    grouped(specs, group, "percent_change", &re, 6, false);
    grouped(specs, group, "percent_pred_post", &re, 7, false);
    grouped(specs, group, "sr_post", &re, 8, false);
}

/// Extended-panel row: measured, predicted, %pred, and SR when the template
/// prints one. All optional; a spirometry-only report has none of them.
fn panel_row(specs: &mut Vec<FieldSpec>, group: &'static str, label: &str, with_sr: bool) {
    let re = Regex::new(&format!(
        r"(?m)^\s*{label}(?:[ \t]*\([^)]*\))?[ \t]+{N}[ \t]+{N}[ \t]+{N}(?:[ \t]+{N})?",
        N = NUM,
    ))
    .unwrap();
    grouped(specs, group, "measured", &re, 1, false);
    grouped(specs, group, "predicted", &re, 2, false);
    grouped(specs, group, "percent_pred", &re, 3, false);
    if with_sr {
        grouped(specs, group, "sr", &re, 4, false);
    }
}

// ── Tests ──
