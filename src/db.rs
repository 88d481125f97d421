use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Result};

const DB_PATH: &str = "data/lungdb.sqlite";

pub fn path() -> &'static str {
    DB_PATH
}

pub fn connect() -> Result<Connection> {
    let conn = Connection::open(DB_PATH)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

#[cfg(test)]
pub fn connect_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS patient (
            id    INTEGER PRIMARY KEY,
            rxr   TEXT UNIQUE NOT NULL,
            fname TEXT,
            lname TEXT,
            nhs   TEXT,
            dob   DATE,
            sex   TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS spirometry (
            id         INTEGER PRIMARY KEY,
            subject_id INTEGER NOT NULL REFERENCES patient(id),
            study_date DATE,
            fev1_pre               REAL,
            fev1_pred              REAL,
            fev1_pre_percent_pred  REAL,
            fev1_pre_sr            REAL,
            fev1_post              REAL,
            fev1_percent_change    REAL,
            fev1_post_percent_pred REAL,
            fev1_post_sr           REAL,
            fvc_pre                REAL,
            fvc_pred               REAL,
            fvc_pre_percent_pred   REAL,
            fvc_pre_sr             REAL,
            fvc_post               REAL,
            fvc_percent_change     REAL,
            fvc_post_percent_pred  REAL,
            fvc_post_sr            REAL
        );
        CREATE INDEX IF NOT EXISTS idx_spirometry_subject ON spirometry(subject_id);

        -- Extended panel. One row per visit, keyed back to the spirometry
        -- row recorded in the same document. VA(SB) and KCO have no SR
        -- column on the printed report.
        CREATE TABLE IF NOT EXISTS lungfunc (
            id         INTEGER PRIMARY KEY,
            subject_id INTEGER NOT NULL REFERENCES patient(id),
            spiro_id   INTEGER NOT NULL REFERENCES spirometry(id),
            study_date DATE,
            tlco               REAL,
            tlco_pred          REAL,
            tlco_percent_pred  REAL,
            tlco_sr            REAL,
            vasb               REAL,
            vasb_pred          REAL,
            vasb_percent_pred  REAL,
            kco                REAL,
            kco_pred           REAL,
            kco_percent_pred   REAL,
            frc                REAL,
            frc_pred           REAL,
            frc_percent_pred   REAL,
            frc_sr             REAL,
            vc                 REAL,
            vc_pred            REAL,
            vc_percent_pred    REAL,
            vc_sr              REAL,
            tlc                REAL,
            tlc_pred           REAL,
            tlc_percent_pred   REAL,
            tlc_sr             REAL,
            rv                 REAL,
            rv_pred            REAL,
            rv_percent_pred    REAL,
            rv_sr              REAL,
            tlcrv              REAL,
            tlcrv_pred         REAL,
            tlcrv_percent_pred REAL,
            tlcrv_sr           REAL
        );
        CREATE INDEX IF NOT EXISTS idx_lungfunc_subject ON lungfunc(subject_id);
        CREATE INDEX IF NOT EXISTS idx_lungfunc_spiro ON lungfunc(spiro_id);

        CREATE TABLE IF NOT EXISTS physiology (
            id         INTEGER PRIMARY KEY,
            subject_id INTEGER NOT NULL REFERENCES patient(id),
            study_date DATE,
            height REAL,
            weight REAL
        );
        CREATE INDEX IF NOT EXISTS idx_physiology_subject ON physiology(subject_id);

        -- Scan audit trail: one row per document path, replaced on rescan.
        CREATE TABLE IF NOT EXISTS documents (
            id          INTEGER PRIMARY KEY,
            path        TEXT UNIQUE NOT NULL,
            report_kind TEXT NOT NULL,
            status      TEXT NOT NULL,
            error       TEXT,
            record_json TEXT,
            subject_id  INTEGER REFERENCES patient(id),
            scanned_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
        ",
    )?;
    Ok(())
}

// ── Rows ──

#[derive(Debug, Clone)]
pub struct NewPatient {
    pub rxr: String,
    pub fname: Option<String>,
    pub lname: Option<String>,
    pub nhs: Option<String>,
    pub dob: Option<NaiveDate>,
    pub sex: Option<String>,
}

/// Stored patient fields the resolver compares against on a re-sighting.
#[derive(Debug, Clone)]
pub struct PatientRow {
    pub id: i64,
    pub rxr: String,
    pub fname: Option<String>,
    pub lname: Option<String>,
    pub dob: Option<NaiveDate>,
}

/// Resolved identity for a visit: either a patient already in the store or
/// one to be created inside the same transaction as the visit rows.
#[derive(Debug, Clone)]
pub enum PatientHandle {
    Existing(i64),
    New(NewPatient),
}

/// Eight-column spirometry quantity: pre bronchodilator block plus an
/// optional post block.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpiroGroup {
    pub pre: Option<f64>,
    pub pred: Option<f64>,
    pub pre_percent_pred: Option<f64>,
    pub pre_sr: Option<f64>,
    pub post: Option<f64>,
    pub percent_change: Option<f64>,
    pub post_percent_pred: Option<f64>,
    pub post_sr: Option<f64>,
}

/// Four-column panel quantity. `sr` stays `None` for quantities the report
/// prints without one.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PanelGroup {
    pub measured: Option<f64>,
    pub predicted: Option<f64>,
    pub percent_pred: Option<f64>,
    pub sr: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct SpirometryRow {
    pub study_date: Option<NaiveDate>,
    pub fev1: SpiroGroup,
    pub fvc: SpiroGroup,
}

#[derive(Debug, Clone, Default)]
pub struct LungfuncRow {
    pub study_date: Option<NaiveDate>,
    pub tlco: PanelGroup,
    pub vasb: PanelGroup,
    pub kco: PanelGroup,
    pub frc: PanelGroup,
    pub vc: PanelGroup,
    pub tlc: PanelGroup,
    pub rv: PanelGroup,
    pub tlcrv: PanelGroup,
}

#[derive(Debug, Clone, Default)]
pub struct PhysiologyRow {
    pub study_date: Option<NaiveDate>,
    pub height: Option<f64>,
    pub weight: Option<f64>,
}

/// Everything one document contributes to the store, minus the patient.
#[derive(Debug, Clone)]
pub struct VisitEntities {
    pub physiology: Option<PhysiologyRow>,
    pub spirometry: SpirometryRow,
    pub lungfunc: Option<LungfuncRow>,
}

/// Audit fields for the documents table.
#[derive(Debug, Clone)]
pub struct DocumentAudit {
    pub path: String,
    pub report_kind: &'static str,
    pub status: &'static str,
    pub error: Option<String>,
    pub record_json: Option<String>,
}

pub struct SavedVisit {
    pub patient_id: i64,
    pub spiro_id: i64,
    pub created_patient: bool,
}

// ── Identity ──

pub fn find_patient(conn: &Connection, rxr: &str) -> Result<Option<PatientRow>> {
    conn.query_row(
        "SELECT id, rxr, fname, lname, dob FROM patient WHERE rxr = ?1",
        params![rxr],
        |row| {
            Ok(PatientRow {
                id: row.get(0)?,
                rxr: row.get(1)?,
                fname: row.get(2)?,
                lname: row.get(3)?,
                dob: row.get(4)?,
            })
        },
    )
    .optional()
}

// ── Visits ──

/// True when this patient already has a spirometry row for the same study
/// date. `IS` instead of `=` so two undated visits also collide.
pub fn visit_exists(conn: &Connection, patient_id: i64, study_date: Option<NaiveDate>) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM spirometry WHERE subject_id = ?1 AND study_date IS ?2",
        params![patient_id, study_date],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

/// Persist one document's yield in a single transaction: the patient when
/// new, the spirometry row, the optional lungfunc and physiology rows, and
/// the audit entry. Nothing lands if any step fails.
pub fn save_visit(
    conn: &Connection,
    patient: PatientHandle,
    visit: &VisitEntities,
    doc: &DocumentAudit,
) -> Result<SavedVisit> {
    let tx = conn.unchecked_transaction()?;

    let (patient_id, created_patient) = match patient {
        PatientHandle::Existing(id) => (id, false),
        PatientHandle::New(p) => (insert_patient(&tx, &p)?, true),
    };

    let spiro_id = insert_spirometry(&tx, patient_id, &visit.spirometry)?;
    if let Some(lf) = &visit.lungfunc {
        insert_lungfunc(&tx, patient_id, spiro_id, lf)?;
    }
    if let Some(ph) = &visit.physiology {
        insert_physiology(&tx, patient_id, ph)?;
    }
    record_document(&tx, doc, Some(patient_id))?;

    tx.commit()?;
    Ok(SavedVisit {
        patient_id,
        spiro_id,
        created_patient,
    })
}

fn insert_patient(conn: &Connection, p: &NewPatient) -> Result<i64> {
    conn.execute(
        "INSERT INTO patient (rxr, fname, lname, nhs, dob, sex)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![p.rxr, p.fname, p.lname, p.nhs, p.dob, p.sex],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_spirometry(conn: &Connection, subject_id: i64, s: &SpirometryRow) -> Result<i64> {
    conn.execute(
        "INSERT INTO spirometry
         (subject_id, study_date,
          fev1_pre, fev1_pred, fev1_pre_percent_pred, fev1_pre_sr,
          fev1_post, fev1_percent_change, fev1_post_percent_pred, fev1_post_sr,
          fvc_pre, fvc_pred, fvc_pre_percent_pred, fvc_pre_sr,
          fvc_post, fvc_percent_change, fvc_post_percent_pred, fvc_post_sr)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
        params![
            subject_id,
            s.study_date,
            s.fev1.pre,
            s.fev1.pred,
            s.fev1.pre_percent_pred,
            s.fev1.pre_sr,
            s.fev1.post,
            s.fev1.percent_change,
            s.fev1.post_percent_pred,
            s.fev1.post_sr,
            s.fvc.pre,
            s.fvc.pred,
            s.fvc.pre_percent_pred,
            s.fvc.pre_sr,
            s.fvc.post,
            s.fvc.percent_change,
            s.fvc.post_percent_pred,
            s.fvc.post_sr,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_lungfunc(conn: &Connection, subject_id: i64, spiro_id: i64, l: &LungfuncRow) -> Result<()> {
    conn.execute(
        "INSERT INTO lungfunc
         (subject_id, spiro_id, study_date,
          tlco, tlco_pred, tlco_percent_pred, tlco_sr,
          vasb, vasb_pred, vasb_percent_pred,
          kco, kco_pred, kco_percent_pred,
          frc, frc_pred, frc_percent_pred, frc_sr,
          vc, vc_pred, vc_percent_pred, vc_sr,
          tlc, tlc_pred, tlc_percent_pred, tlc_sr,
          rv, rv_pred, rv_percent_pred, rv_sr,
          tlcrv, tlcrv_pred, tlcrv_percent_pred, tlcrv_sr)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,
                 ?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33)",
        params![
            subject_id,
            spiro_id,
            l.study_date,
            l.tlco.measured,
            l.tlco.predicted,
            l.tlco.percent_pred,
            l.tlco.sr,
            l.vasb.measured,
            l.vasb.predicted,
            l.vasb.percent_pred,
            l.kco.measured,
            l.kco.predicted,
            l.kco.percent_pred,
            l.frc.measured,
            l.frc.predicted,
            l.frc.percent_pred,
            l.frc.sr,
            l.vc.measured,
            l.vc.predicted,
            l.vc.percent_pred,
            l.vc.sr,
            l.tlc.measured,
            l.tlc.predicted,
            l.tlc.percent_pred,
            l.tlc.sr,
            l.rv.measured,
            l.rv.predicted,
            l.rv.percent_pred,
            l.rv.sr,
            l.tlcrv.measured,
            l.tlcrv.predicted,
            l.tlcrv.percent_pred,
            l.tlcrv.sr,
        ],
    )?;
    Ok(())
}

fn insert_physiology(conn: &Connection, subject_id: i64, p: &PhysiologyRow) -> Result<()> {
    conn.execute(
        "INSERT INTO physiology (subject_id, study_date, height, weight)
         VALUES (?1, ?2, ?3, ?4)",
        params![subject_id, p.study_date, p.height, p.weight],
    )?;
    Ok(())
}

// ── Documents ──

/// Write (or overwrite) the audit row for a document path.
pub fn record_document(conn: &Connection, doc: &DocumentAudit, subject_id: Option<i64>) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO documents (path, report_kind, status, error, record_json, subject_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![doc.path, doc.report_kind, doc.status, doc.error, doc.record_json, subject_id],
    )?;
    Ok(())
}

/// True when the path already reached a terminal state. Failed reads stay
/// non-terminal so a fixed file is picked up on the next scan.
pub fn document_done(conn: &Connection, path: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM documents
         WHERE path = ?1 AND status IN ('ok', 'incomplete', 'duplicate_visit')",
        params![path],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

// ── Overview ──

pub struct OverviewRow {
    pub rxr: String,
    pub lname: String,
    pub fname: String,
    pub dob: Option<NaiveDate>,
    pub sex: String,
    pub visits: i64,
    pub latest: Option<NaiveDate>,
    pub panels: i64,
}

pub fn fetch_overview(conn: &Connection, sex: Option<&str>, limit: usize) -> Result<Vec<OverviewRow>> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(s) = sex {
        conditions.push(format!("p.sex = ?{} COLLATE NOCASE", params.len() + 1));
        params.push(Box::new(s.to_string()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT p.rxr, COALESCE(p.lname,''), COALESCE(p.fname,''), p.dob, COALESCE(p.sex,''),
                COUNT(s.id), MAX(s.study_date),
                (SELECT COUNT(*) FROM lungfunc lf WHERE lf.subject_id = p.id)
         FROM patient p
         LEFT JOIN spirometry s ON s.subject_id = p.id{}
         GROUP BY p.id
         ORDER BY p.lname, p.fname, p.rxr
         LIMIT {}",
        where_clause, limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(OverviewRow {
                rxr: row.get(0)?,
                lname: row.get(1)?,
                fname: row.get(2)?,
                dob: row.get(3)?,
                sex: row.get(4)?,
                visits: row.get(5)?,
                latest: row.get(6)?,
                panels: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub patients: usize,
    pub spirometry: usize,
    pub lungfunc: usize,
    pub physiology: usize,
    pub documents: usize,
    pub failures: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { conn.query_row(sql, [], |r| r.get(0)) };
    Ok(Stats {
        patients: count("SELECT COUNT(*) FROM patient")?,
        spirometry: count("SELECT COUNT(*) FROM spirometry")?,
        lungfunc: count("SELECT COUNT(*) FROM lungfunc")?,
        physiology: count("SELECT COUNT(*) FROM physiology")?,
        documents: count("SELECT COUNT(*) FROM documents")?,
        failures: count(
            "SELECT COUNT(*) FROM documents WHERE status IN ('no_source', 'no_identifier')",
        )?,
    })
}

// ── Tests ──
