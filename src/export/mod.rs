//! CSV export writer.
//!
//! Renders accumulated [`ResultRow`]s as a 9-column CSV document — fixed
//! header, every field double-quote wrapped with internal quotes doubled,
//! control characters stripped, embedded newlines flattened to spaces, and a
//! UTF-8 byte-order mark so the file opens cleanly in common spreadsheet
//! tools. Delivery runs through three independent strategies because no
//! single write path is reliable across the environments this tool lands in;
//! when all three fail the caller gets one aggregated error naming each
//! failure, and the rows stay in the registry for a later manual attempt.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::config::ExportSection;
use crate::core::types::ResultRow;

pub const CSV_HEADER: [&str; 9] = [
    "question",
    "answer",
    "conversation",
    "sequence",
    "source_title",
    "source_content",
    "source_site",
    "source_url",
    "source_time",
];

const UTF8_BOM: &str = "\u{FEFF}";

/// Which operation produced the export; determines the filename label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportLabel {
    /// Normal completion of a batch run.
    Auto,
    /// Partial export triggered by a user stop.
    StopExport,
    /// Out-of-band "export what we have" request.
    Manual,
}

impl ExportLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportLabel::Auto => "qa_batch",
            ExportLabel::StopExport => "qa_batch_stopped",
            ExportLabel::Manual => "qa_manual_export",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(
        "every delivery strategy failed — atomic: {atomic}; direct: {direct}; \
         plain-text fallback: {fallback}. Check that the output directory is \
         writable, then retry the export manually."
    )]
    AllStrategiesFailed {
        atomic: String,
        direct: String,
        fallback: String,
    },
}

/// Sanitize one field for CSV embedding: strip control characters, double
/// internal quotes, flatten newline runs to a single space, trim.
pub fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_space = false;
    for c in value.chars() {
        match c {
            '\r' | '\n' => pending_space = true,
            '\u{0000}'..='\u{001F}' | '\u{007F}'..='\u{009F}' => {}
            '"' => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push_str("\"\"");
            }
            _ => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(c);
            }
        }
    }
    out.trim().to_string()
}

fn sequence_field(row: &ResultRow) -> String {
    row.sequence_index.map(|n| n.to_string()).unwrap_or_default()
}

/// Render the full CSV document (header + rows, all fields quoted).
/// An empty row set yields the header line only.
pub fn render_csv(rows: &[ResultRow]) -> String {
    let mut csv = String::new();
    csv.push_str(&CSV_HEADER.join(","));
    csv.push('\n');

    for row in rows {
        let fields = [
            escape_field(&row.question),
            escape_field(&row.answer),
            escape_field(&row.conversation_label),
            sequence_field(row),
            escape_field(&row.source_title),
            escape_field(&row.source_content),
            escape_field(&row.source_site),
            escape_field(&row.source_url),
            escape_field(&row.source_time),
        ];
        let line: Vec<String> = fields.iter().map(|f| format!("\"{f}\"")).collect();
        csv.push_str(&line.join(","));
        csv.push('\n');
    }
    csv
}

/// ISO-like timestamp slug safe for filenames: colons and sub-second dots
/// become hyphens, truncated to second precision.
pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S").to_string()
}

pub fn export_filename(label: ExportLabel, at: DateTime<Utc>) -> String {
    format!("{}_{}.csv", label.as_str(), timestamp_slug(at))
}

#[derive(Debug, Clone)]
pub struct ExportedFile {
    pub path: PathBuf,
    pub filename: String,
    pub row_count: usize,
}

/// Delivers rendered CSV documents to disk.
pub struct CsvExporter {
    output_dir: PathBuf,
    fallback_dir: PathBuf,
}

impl CsvExporter {
    pub fn new(output_dir: impl Into<PathBuf>, fallback_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            fallback_dir: fallback_dir.into(),
        }
    }

    pub fn from_config(section: &ExportSection) -> Self {
        Self::new(section.resolve_output_dir(), section.resolve_fallback_dir())
    }

    /// Render and deliver `rows` under the given label, stamped with `at`.
    pub fn export_rows(
        &self,
        rows: &[ResultRow],
        label: ExportLabel,
        at: DateTime<Utc>,
    ) -> Result<ExportedFile, ExportError> {
        let filename = export_filename(label, at);
        let csv = render_csv(rows);
        let path = self.deliver(&csv, &filename)?;
        info!(
            "export: wrote {} rows to {} ({} bytes)",
            rows.len(),
            path.display(),
            csv.len()
        );
        Ok(ExportedFile {
            path,
            filename,
            row_count: rows.len(),
        })
    }

    /// Write `csv` (BOM prepended) under `filename`, trying each delivery
    /// strategy in order: atomic temp-file persist, direct write, plain-text
    /// fallback in the fallback directory.
    pub fn deliver(&self, csv: &str, filename: &str) -> Result<PathBuf, ExportError> {
        let payload = format!("{UTF8_BOM}{csv}");

        let atomic_err = match self.deliver_atomic(&payload, filename) {
            Ok(path) => return Ok(path),
            Err(e) => {
                warn!("export: atomic delivery failed: {e}");
                e.to_string()
            }
        };

        let direct_err = match self.deliver_direct(&payload, filename) {
            Ok(path) => {
                info!("export: direct write fallback succeeded for {filename}");
                return Ok(path);
            }
            Err(e) => {
                warn!("export: direct delivery failed: {e}");
                e.to_string()
            }
        };

        let fallback_err = match self.deliver_plain_text(&payload, filename) {
            Ok(path) => {
                info!(
                    "export: plain-text fallback succeeded: {}",
                    path.display()
                );
                return Ok(path);
            }
            Err(e) => {
                warn!("export: plain-text delivery failed: {e}");
                e.to_string()
            }
        };

        Err(ExportError::AllStrategiesFailed {
            atomic: atomic_err,
            direct: direct_err,
            fallback: fallback_err,
        })
    }

    fn deliver_atomic(&self, payload: &str, filename: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let target = unique_target(&self.output_dir, filename);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.output_dir)?;
        tmp.write_all(payload.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(target)
    }

    fn deliver_direct(&self, payload: &str, filename: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let target = unique_target(&self.output_dir, filename);
        std::fs::write(&target, payload.as_bytes())?;
        Ok(target)
    }

    fn deliver_plain_text(&self, payload: &str, filename: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.fallback_dir)?;
        let txt_name = match filename.strip_suffix(".csv") {
            Some(stem) => format!("{stem}.txt"),
            None => format!("{filename}.txt"),
        };
        let target = unique_target(&self.fallback_dir, &txt_name);
        std::fs::write(&target, payload.as_bytes())?;
        Ok(target)
    }
}

/// Uniquify a target path the way browser download managers do:
/// `name.csv`, `name (1).csv`, `name (2).csv`, …
fn unique_target(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((s, e)) => (s.to_string(), format!(".{e}")),
        None => (filename.to_string(), String::new()),
    };
    for n in 1u32.. {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 uniquifier space exhausted")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn escape_doubles_quotes_and_flattens_newlines() {
        assert_eq!(escape_field("say \"hi\""), "say \"\"hi\"\"");
        assert_eq!(escape_field("line one\r\nline two"), "line one line two");
        assert_eq!(escape_field("  padded  "), "padded");
        assert_eq!(escape_field("bell\u{0007}s"), "bells");
    }

    #[test]
    fn header_only_for_empty_rows() {
        let csv = render_csv(&[]);
        assert_eq!(csv.lines().count(), 1);
        assert!(csv.starts_with("question,answer,conversation,sequence,"));
    }

    #[test]
    fn sequence_renders_empty_when_absent() {
        let row = ResultRow::bare("q", "a", "t");
        let csv = render_csv(&[row]);
        let data_line = csv.lines().nth(1).unwrap();
        assert_eq!(data_line, r#""q","a","t","","","","","","""#);

        let mut cited = ResultRow::bare("q", "a", "t");
        cited.sequence_index = Some(2);
        let csv = render_csv(&[cited]);
        assert!(csv.lines().nth(1).unwrap().contains(r#""t","2""#));
    }

    #[test]
    fn filename_slug_has_no_colons_or_dots() {
        let at = DateTime::parse_from_rfc3339("2026-02-03T04:05:06.789Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(timestamp_slug(at), "2026-02-03T04-05-06");
        assert_eq!(
            export_filename(ExportLabel::StopExport, at),
            "qa_batch_stopped_2026-02-03T04-05-06.csv"
        );
    }

    #[test]
    fn delivery_prepends_bom_and_uniquifies() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(dir.path(), dir.path().join("fallback"));
        let first = exporter.deliver("question\n", "out.csv").unwrap();
        let second = exporter.deliver("question\n", "out.csv").unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().contains("out (1)"));

        let bytes = std::fs::read(&first).unwrap();
        assert_eq!(&bytes[..3], [0xEF, 0xBB, 0xBF]);
    }

    #[test]
    fn unwritable_output_falls_back_to_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("missing").join("\u{0}bad");
        let exporter = CsvExporter::new(bogus, dir.path().join("fallback"));
        let delivered = exporter.deliver("question\n", "out.csv").unwrap();
        assert!(delivered.to_string_lossy().ends_with("out.txt"));
    }
}
