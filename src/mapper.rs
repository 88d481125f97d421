//! From extracted records to relational rows.
//!
//! Two jobs live here: resolving the patient identity anchor against the
//! store, and fanning one record out into the visit's entity rows. Mapping
//! is pure; all persistence happens in `db::save_visit`.

use chrono::NaiveDate;
use rusqlite::Connection;
use tracing::warn;

use crate::db::{
    self, LungfuncRow, NewPatient, PanelGroup, PatientHandle, PhysiologyRow, SpiroGroup,
    SpirometryRow, VisitEntities,
};
use crate::error::ScanError;
use crate::parser::engine::ExtractedRecord;
use crate::util::{digits_only, parse_date, title_case};

const PANEL_GROUPS: [&str; 8] = ["tlco", "vasb", "kco", "frc", "vc", "tlc", "rv", "tlcrv"];

/// Find-or-create resolution on the hospital identifier.
///
/// Never mutates a stored patient: a re-sighting with different details is
/// logged for manual reconciliation and the stored row wins.
pub fn resolve_patient(
    conn: &Connection,
    record: &ExtractedRecord,
    source_id: &str,
) -> Result<PatientHandle, ScanError> {
    let rxr = record
        .get("rxr")
        .ok_or_else(|| ScanError::MissingIdentityAnchor(source_id.to_string()))?;
    let rxr = canonical_rxr(rxr);

    if let Some(existing) = db::find_patient(conn, &rxr)? {
        flag_mismatches(&existing, record, source_id);
        return Ok(PatientHandle::Existing(existing.id));
    }

    Ok(PatientHandle::New(NewPatient {
        rxr,
        fname: record.get("fname").map(title_case),
        lname: record.get("lname").map(title_case),
        nhs: record.get("nhs").map(digits_only),
        dob: record.get("dob").and_then(parse_date),
        sex: record.get("sex").map(str::to_string),
    }))
}

/// Identifiers are compared upper-cased with internal whitespace removed,
/// so "ab 1234" and "AB1234" land on the same patient.
fn canonical_rxr(raw: &str) -> String {
    raw.split_whitespace().collect::<String>().to_uppercase()
}

fn flag_mismatches(stored: &db::PatientRow, record: &ExtractedRecord, source_id: &str) {
    if let Some(dob) = record.get("dob").and_then(parse_date) {
        if stored.dob.is_some() && stored.dob != Some(dob) {
            warn!(rxr = %stored.rxr, source = source_id, "date of birth differs from stored patient");
        }
    }
    if let Some(lname) = record.get("lname").map(title_case) {
        if stored.lname.as_deref().is_some_and(|s| s != lname) {
            warn!(rxr = %stored.rxr, source = source_id, "surname differs from stored patient");
        }
    }
    if let Some(fname) = record.get("fname").map(title_case) {
        if stored.fname.as_deref().is_some_and(|s| s != fname) {
            warn!(rxr = %stored.rxr, source = source_id, "forename differs from stored patient");
        }
    }
}

/// Study date as printed on the report, when present and well formed.
pub fn study_date(record: &ExtractedRecord) -> Option<NaiveDate> {
    record.get("date").and_then(parse_date)
}

/// Fan one record out into the visit's entity rows.
///
/// The spirometry row is always produced, however sparse. The lungfunc row
/// exists only when some extended-panel group was extracted, physiology only
/// when height was (weight rides along, independently nullable). Absent or
/// unparseable numbers become NULL columns, never zeros.
pub fn map_record(record: &ExtractedRecord, study_date: Option<NaiveDate>) -> VisitEntities {
    let height = num(record.get("height"));
    let weight = num(record.get("weight"));
    let physiology = height.is_some().then(|| PhysiologyRow {
        study_date,
        height,
        weight,
    });

    let spirometry = SpirometryRow {
        study_date,
        fev1: spiro_group(record, "fev1"),
        fvc: spiro_group(record, "fvc"),
    };

    let has_panel = PANEL_GROUPS.iter().any(|g| record.has_group(g));
    let lungfunc = has_panel.then(|| LungfuncRow {
        study_date,
        tlco: panel_group(record, "tlco"),
        vasb: panel_group(record, "vasb"),
        kco: panel_group(record, "kco"),
        frc: panel_group(record, "frc"),
        vc: panel_group(record, "vc"),
        tlc: panel_group(record, "tlc"),
        rv: panel_group(record, "rv"),
        tlcrv: panel_group(record, "tlcrv"),
    });

    VisitEntities {
        physiology,
        spirometry,
        lungfunc,
    }
}

/// Fixed eight-field unpacking rule for a spirometry quantity.
fn spiro_group(record: &ExtractedRecord, group: &str) -> SpiroGroup {
    SpiroGroup {
        pre: num_in(record, group, "measured_pre"),
        pred: num_in(record, group, "predicted"),
        pre_percent_pred: num_in(record, group, "percent_pred_pre"),
        pre_sr: num_in(record, group, "sr_pre"),
        post: num_in(record, group, "measured_post"),
        percent_change: num_in(record, group, "percent_change"),
        post_percent_pred: num_in(record, group, "percent_pred_post"),
        post_sr: num_in(record, group, "sr_post"),
    }
}

/// Fixed four-field unpacking rule for an extended-panel quantity.
fn panel_group(record: &ExtractedRecord, group: &str) -> PanelGroup {
    PanelGroup {
        measured: num_in(record, group, "measured"),
        predicted: num_in(record, group, "predicted"),
        percent_pred: num_in(record, group, "percent_pred"),
        sr: num_in(record, group, "sr"),
    }
}

fn num(value: Option<&str>) -> Option<f64> {
    value.and_then(|v| v.parse().ok())
}

fn num_in(record: &ExtractedRecord, group: &str, name: &str) -> Option<f64> {
    num(record.get_in(group, name))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DocumentAudit;
    use crate::parser::engine::FieldKey;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn spiro_record() -> ExtractedRecord {
        let mut r = ExtractedRecord::new();
        r.insert(FieldKey::scalar("rxr"), "ab1234");
        r.insert(FieldKey::scalar("lname"), "SMITH");
        r.insert(FieldKey::scalar("fname"), "John");
        r.insert(FieldKey::scalar("dob"), "2000-01-01");
        r.insert(FieldKey::scalar("date"), "2021-06-01");
        r.insert(FieldKey::grouped("fev1", "measured_pre"), "3.10");
        r.insert(FieldKey::grouped("fev1", "predicted"), "3.50");
        r.insert(FieldKey::grouped("fev1", "percent_pred_pre"), "88.6");
        r.insert(FieldKey::grouped("fev1", "sr_pre"), "-0.9");
        r.insert(FieldKey::grouped("fvc", "measured_pre"), "4.02");
        r
    }

    fn test_conn() -> Connection {
        let conn = db::connect_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn maps_spirometry_only_record() {
        let record = spiro_record();
        let visit = map_record(&record, study_date(&record));
        assert_eq!(visit.spirometry.study_date, Some(date("2021-06-01")));
        assert_eq!(visit.spirometry.fev1.pre, Some(3.10));
        assert_eq!(visit.spirometry.fev1.post, None);
        assert_eq!(visit.spirometry.fvc.pre, Some(4.02));
        assert_eq!(visit.spirometry.fvc.pred, None);
        assert!(visit.lungfunc.is_none());
        assert!(visit.physiology.is_none());
    }

    #[test]
    fn maps_panel_and_physiology() {
        let mut record = spiro_record();
        record.insert(FieldKey::scalar("height"), "161");
        record.insert(FieldKey::scalar("weight"), "64.5");
        record.insert(FieldKey::grouped("tlco", "measured"), "3.90");
        record.insert(FieldKey::grouped("tlco", "sr"), "-2.2");
        record.insert(FieldKey::grouped("vasb", "measured"), "3.40");
        record.insert(FieldKey::grouped("tlcrv", "measured"), "53.4");

        let visit = map_record(&record, study_date(&record));
        let lf = visit.lungfunc.unwrap();
        assert_eq!(lf.tlco.measured, Some(3.90));
        assert_eq!(lf.tlco.sr, Some(-2.2));
        assert_eq!(lf.vasb.measured, Some(3.40));
        assert_eq!(lf.vasb.sr, None);
        assert_eq!(lf.tlcrv.measured, Some(53.4));
        assert_eq!(lf.frc, PanelGroup::default());

        let ph = visit.physiology.unwrap();
        assert_eq!(ph.height, Some(161.0));
        assert_eq!(ph.weight, Some(64.5));
    }

    #[test]
    fn weight_alone_maps_no_physiology() {
        let mut record = spiro_record();
        record.insert(FieldKey::scalar("weight"), "64.5");
        assert!(map_record(&record, None).physiology.is_none());

        record.insert(FieldKey::scalar("height"), "161");
        let ph = map_record(&record, None).physiology.unwrap();
        assert_eq!(ph.height, Some(161.0));
        assert_eq!(ph.weight, Some(64.5));
    }

    #[test]
    fn absent_values_stay_null_not_zero() {
        let visit = map_record(&ExtractedRecord::new(), None);
        assert_eq!(visit.spirometry.fev1, SpiroGroup::default());
        assert_eq!(visit.spirometry.study_date, None);
        assert!(visit.lungfunc.is_none());
        assert!(visit.physiology.is_none());
    }

    #[test]
    fn unparseable_number_becomes_none() {
        let mut record = spiro_record();
        record.insert(FieldKey::grouped("fev1", "measured_post"), "n/a");
        let visit = map_record(&record, None);
        assert_eq!(visit.spirometry.fev1.post, None);
    }

    #[test]
    fn resolves_new_patient_with_canonical_fields() {
        let conn = test_conn();
        let handle = resolve_patient(&conn, &spiro_record(), "t.pdf").unwrap();
        match handle {
            PatientHandle::New(p) => {
                assert_eq!(p.rxr, "AB1234");
                assert_eq!(p.lname.as_deref(), Some("Smith"));
                assert_eq!(p.fname.as_deref(), Some("John"));
                assert_eq!(p.dob, Some(date("2000-01-01")));
            }
            PatientHandle::Existing(_) => panic!("expected a new patient"),
        }
    }

    #[test]
    fn second_sighting_resolves_existing() {
        let conn = test_conn();
        let record = spiro_record();
        let handle = resolve_patient(&conn, &record, "t.pdf").unwrap();
        let saved = db::save_visit(
            &conn,
            handle,
            &map_record(&record, study_date(&record)),
            &DocumentAudit {
                path: "t.pdf".into(),
                report_kind: "full-pft",
                status: "ok",
                error: None,
                record_json: None,
            },
        )
        .unwrap();

        // Spacing or case changes in the identifier still find the patient.
        let mut again = spiro_record();
        again.insert(FieldKey::scalar("rxr"), "AB 1234");
        match resolve_patient(&conn, &again, "t2.pdf").unwrap() {
            PatientHandle::Existing(id) => assert_eq!(id, saved.patient_id),
            PatientHandle::New(_) => panic!("expected the stored patient"),
        }
    }

    #[test]
    fn mismatched_details_never_overwrite() {
        let conn = test_conn();
        let record = spiro_record();
        let handle = resolve_patient(&conn, &record, "t.pdf").unwrap();
        db::save_visit(
            &conn,
            handle,
            &map_record(&record, None),
            &DocumentAudit {
                path: "t.pdf".into(),
                report_kind: "full-pft",
                status: "ok",
                error: None,
                record_json: None,
            },
        )
        .unwrap();

        let mut conflicting = spiro_record();
        conflicting.insert(FieldKey::scalar("dob"), "1999-12-31");
        conflicting.insert(FieldKey::scalar("lname"), "SMYTHE");
        resolve_patient(&conn, &conflicting, "t2.pdf").unwrap();

        let stored = db::find_patient(&conn, "AB1234").unwrap().unwrap();
        assert_eq!(stored.dob, Some(date("2000-01-01")));
        assert_eq!(stored.lname.as_deref(), Some("Smith"));
    }

    #[test]
    fn missing_rxr_is_identity_error() {
        let conn = test_conn();
        let mut record = ExtractedRecord::new();
        record.insert(FieldKey::scalar("lname"), "DOE");
        let err = resolve_patient(&conn, &record, "no_rxr.pdf").unwrap_err();
        assert!(matches!(err, ScanError::MissingIdentityAnchor(s) if s == "no_rxr.pdf"));
    }
}
