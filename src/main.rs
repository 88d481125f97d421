mod db;
mod error;
mod mapper;
mod parser;
mod source;
mod util;

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::db::{DocumentAudit, PatientHandle};
use crate::error::ScanError;
use crate::parser::engine::FieldSpec;
use crate::parser::{ParsedReport, ReportKind};
use crate::source::{PdfTextSource, TextSource};

#[derive(Parser)]
#[command(name = "lungdb", about = "Lung function report scanner: PDF reports to SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema
    Init,
    /// Scan a directory tree of PDF reports into the database
    Scan {
        /// Directory searched recursively for reports
        dir: PathBuf,
        /// Report family to parse
        #[arg(short = 't', long, default_value = "full-pft")]
        report_type: String,
        /// Max documents to scan (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show store statistics
    Stats,
    /// Patients overview table
    Overview {
        /// Filter by sex (Male, Female)
        #[arg(short, long)]
        sex: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init => {
            open_db()?;
            println!("Database ready at {}", db::path());
            Ok(())
        }
        Commands::Scan {
            dir,
            report_type,
            limit,
        } => {
            let conn = open_db()?;
            let kind = match ReportKind::from_name(&report_type) {
                Some(k) => k,
                None => return Err(ScanError::UnrecognizedVariant(report_type).into()),
            };
            let files = discover_reports(&dir, limit);
            if files.is_empty() {
                println!("No PDF reports found under {}", dir.display());
                return Ok(());
            }
            println!("Scanning {} reports as {}...", files.len(), kind.name());
            let counts = scan_documents(&conn, kind, &files)?;
            counts.print();
            Ok(())
        }
        Commands::Stats => {
            let conn = open_db()?;
            let s = db::get_stats(&conn)?;
            println!("Patients:   {}", s.patients);
            println!("Spirometry: {}", s.spirometry);
            println!("Lung func:  {}", s.lungfunc);
            println!("Physiology: {}", s.physiology);
            println!("Documents:  {}", s.documents);
            println!("Failures:   {}", s.failures);
            Ok(())
        }
        Commands::Overview { sex, limit } => {
            let conn = open_db()?;
            let rows = db::fetch_overview(&conn, sex.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No patients found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<8} | {:<22} | {:<10} | {:<6} | {:>6} | {:>6} | {:<10}",
                "#", "RXR", "Patient", "DOB", "Sex", "Visits", "Panels", "Latest"
            );
            println!("{}", "-".repeat(90));

            for (i, r) in rows.iter().enumerate() {
                let name = truncate(&format!("{}, {}", r.lname, r.fname), 22);
                let dob = r.dob.map(|d| d.to_string()).unwrap_or_else(|| "-".into());
                let latest = r.latest.map(|d| d.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "{:>3} | {:<8} | {:<22} | {:<10} | {:<6} | {:>6} | {:>6} | {:<10}",
                    i + 1,
                    r.rxr,
                    name,
                    dob,
                    r.sex,
                    r.visits,
                    r.panels,
                    latest
                );
            }

            println!("\n{} patients", rows.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_db() -> anyhow::Result<rusqlite::Connection> {
    if let Some(dir) = Path::new(db::path()).parent() {
        std::fs::create_dir_all(dir)?;
    }
    let conn = db::connect()?;
    db::init_schema(&conn)?;
    Ok(conn)
}

/// Recursively collect PDF paths, sorted for a stable scan order.
fn discover_reports(dir: &Path, limit: Option<usize>) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .map(|x| x.eq_ignore_ascii_case("pdf"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    if let Some(n) = limit {
        files.truncate(n);
    }
    files
}

enum ScanOutcome {
    Saved {
        new_patient: bool,
        full_panel: bool,
        with_physiology: bool,
        incomplete: bool,
    },
    AlreadyScanned,
    DuplicateVisit,
    NoSource,
    NoIdentifier,
}

#[derive(Default)]
struct ScanCounts {
    saved: usize,
    new_patients: usize,
    panels: usize,
    physiology: usize,
    incomplete: usize,
    already_scanned: usize,
    duplicates: usize,
    unreadable: usize,
    no_identifier: usize,
}

impl ScanCounts {
    fn tally(&mut self, outcome: ScanOutcome) {
        match outcome {
            ScanOutcome::Saved {
                new_patient,
                full_panel,
                with_physiology,
                incomplete,
            } => {
                self.saved += 1;
                if new_patient {
                    self.new_patients += 1;
                }
                if full_panel {
                    self.panels += 1;
                }
                if with_physiology {
                    self.physiology += 1;
                }
                if incomplete {
                    self.incomplete += 1;
                }
            }
            ScanOutcome::AlreadyScanned => self.already_scanned += 1,
            ScanOutcome::DuplicateVisit => self.duplicates += 1,
            ScanOutcome::NoSource => self.unreadable += 1,
            ScanOutcome::NoIdentifier => self.no_identifier += 1,
        }
    }

    fn print(&self) {
        println!(
            "Saved {} visits ({} new patients, {} full panels, {} with physiology).",
            self.saved, self.new_patients, self.panels, self.physiology
        );
        if self.incomplete > 0 {
            println!(
                "{} saved visits were missing required fields (see log).",
                self.incomplete
            );
        }
        let skipped = self.already_scanned + self.duplicates + self.unreadable + self.no_identifier;
        if skipped > 0 {
            println!(
                "Skipped {}: {} already scanned, {} duplicate visits, {} unreadable, {} without identifier.",
                skipped, self.already_scanned, self.duplicates, self.unreadable, self.no_identifier
            );
        }
    }
}

fn scan_documents(
    conn: &rusqlite::Connection,
    kind: ReportKind,
    files: &[PathBuf],
) -> anyhow::Result<ScanCounts> {
    use indicatif::{ProgressBar, ProgressStyle};

    let specs = kind.field_specs();
    let source = PdfTextSource;

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let mut counts = ScanCounts::default();
    for path in files {
        // Unreadable documents and identity failures fold into the outcome;
        // an error here means the store failed and the batch stops.
        let outcome = scan_one(conn, kind, &specs, &source, path)?;
        counts.tally(outcome);
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(counts)
}

fn scan_one(
    conn: &rusqlite::Connection,
    kind: ReportKind,
    specs: &[FieldSpec],
    source: &impl TextSource,
    path: &Path,
) -> Result<ScanOutcome, ScanError> {
    let source_id = path.display().to_string();

    if db::document_done(conn, &source_id)? {
        return Ok(ScanOutcome::AlreadyScanned);
    }

    let text = match source.read_text(path) {
        Ok(t) => t,
        Err(err) => {
            warn!("{}", err);
            let parsed = ParsedReport::no_source(source_id.as_str());
            let audit = DocumentAudit {
                path: source_id,
                report_kind: kind.name(),
                status: parsed.status().as_str(),
                error: Some(err.to_string()),
                record_json: None,
            };
            db::record_document(conn, &audit, None)?;
            return Ok(ScanOutcome::NoSource);
        }
    };

    let parsed = ParsedReport::from_text(&text, specs, source_id.as_str());
    if parsed.record().is_empty() {
        warn!(
            source = parsed.source_id(),
            "no fields extracted; text may not match the report family"
        );
    }
    let record_json = serde_json::to_string(parsed.record()).ok();

    let handle = match mapper::resolve_patient(conn, parsed.record(), parsed.source_id()) {
        Ok(h) => h,
        Err(err @ ScanError::MissingIdentityAnchor(_)) => {
            warn!("{}", err);
            let audit = DocumentAudit {
                path: source_id,
                report_kind: kind.name(),
                status: "no_identifier",
                error: Some(err.to_string()),
                record_json,
            };
            db::record_document(conn, &audit, None)?;
            return Ok(ScanOutcome::NoIdentifier);
        }
        Err(err) => return Err(err),
    };

    let study_date = mapper::study_date(parsed.record());

    if let PatientHandle::Existing(id) = &handle {
        if db::visit_exists(conn, *id, study_date)? {
            warn!(
                source = parsed.source_id(),
                "visit already recorded for this patient and study date"
            );
            let audit = DocumentAudit {
                path: source_id,
                report_kind: kind.name(),
                status: "duplicate_visit",
                error: None,
                record_json,
            };
            db::record_document(conn, &audit, Some(*id))?;
            return Ok(ScanOutcome::DuplicateVisit);
        }
    }

    let entities = mapper::map_record(parsed.record(), study_date);
    let full_panel = entities.lungfunc.is_some();
    let with_physiology = entities.physiology.is_some();
    let audit = DocumentAudit {
        path: source_id,
        report_kind: kind.name(),
        status: parsed.status().as_str(),
        error: None,
        record_json,
    };
    let saved = db::save_visit(conn, handle, &entities, &audit)?;
    debug!(
        source = parsed.source_id(),
        patient_id = saved.patient_id,
        spiro_id = saved.spiro_id,
        "visit saved"
    );

    Ok(ScanOutcome::Saved {
        new_patient: saved.created_patient,
        full_panel,
        with_physiology,
        incomplete: !parsed.is_ok(),
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    /// Serves fixture text by file stem, so the pipeline can be driven
    /// without real PDFs.
    struct FixtureSource;

    impl TextSource for FixtureSource {
        fn read_text(&self, path: &Path) -> Result<String, ScanError> {
            let stem = path.file_stem().unwrap().to_string_lossy();
            std::fs::read_to_string(format!("tests/fixtures/{}.txt", stem)).map_err(|e| {
                ScanError::SourceUnavailable {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }
            })
        }
    }

    fn scan(conn: &Connection, path: &str) -> ScanOutcome {
        let specs = ReportKind::FullPft.field_specs();
        scan_one(conn, ReportKind::FullPft, &specs, &FixtureSource, Path::new(path)).unwrap()
    }

    fn test_conn() -> Connection {
        let conn = db::connect_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn full_panel_end_to_end() {
        let conn = test_conn();
        let outcome = scan(&conn, "archive/full_panel.pdf");
        assert!(matches!(
            outcome,
            ScanOutcome::Saved {
                new_patient: true,
                full_panel: true,
                with_physiology: true,
                incomplete: false,
            }
        ));

        let (fev1_pre, tlco, height): (f64, f64, f64) = conn
            .query_row(
                "SELECT s.fev1_pre, l.tlco, ph.height
                 FROM spirometry s, lungfunc l, physiology ph",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(fev1_pre, 1.02);
        assert_eq!(tlco, 3.90);
        assert_eq!(height, 161.0);

        let patient = db::find_patient(&conn, "RX4421").unwrap().unwrap();
        assert_eq!(patient.lname.as_deref(), Some("O'Brien"));
    }

    #[test]
    fn rescan_and_duplicate_visit_are_skipped() {
        let conn = test_conn();
        assert!(matches!(
            scan(&conn, "archive/spiro_only.pdf"),
            ScanOutcome::Saved { full_panel: false, .. }
        ));

        // Same path again: terminal audit row short-circuits the rescan.
        assert!(matches!(
            scan(&conn, "archive/spiro_only.pdf"),
            ScanOutcome::AlreadyScanned
        ));

        // Same visit under another path: caught by patient and study date.
        assert!(matches!(
            scan(&conn, "copies/spiro_only.pdf"),
            ScanOutcome::DuplicateVisit
        ));

        let s = db::get_stats(&conn).unwrap();
        assert_eq!(s.patients, 1);
        assert_eq!(s.spirometry, 1);
        assert_eq!(s.documents, 2);
    }

    #[test]
    fn missing_identifier_is_recorded_not_saved() {
        let conn = test_conn();
        assert!(matches!(
            scan(&conn, "archive/no_rxr.pdf"),
            ScanOutcome::NoIdentifier
        ));
        let s = db::get_stats(&conn).unwrap();
        assert_eq!(s.patients, 0);
        assert_eq!(s.spirometry, 0);
        assert_eq!(s.documents, 1);
        assert_eq!(s.failures, 1);

        // The partial record is still kept for audit.
        let json: Option<String> = conn
            .query_row("SELECT record_json FROM documents", [], |r| r.get(0))
            .unwrap();
        assert!(json.unwrap().contains("DOE"));
    }

    #[test]
    fn unreadable_document_is_retried_next_scan() {
        let conn = test_conn();
        assert!(matches!(
            scan(&conn, "archive/missing_fixture.pdf"),
            ScanOutcome::NoSource
        ));
        // A read failure is not terminal: the next scan tries again.
        assert!(matches!(
            scan(&conn, "archive/missing_fixture.pdf"),
            ScanOutcome::NoSource
        ));
        assert_eq!(db::get_stats(&conn).unwrap().documents, 1);
    }
}
