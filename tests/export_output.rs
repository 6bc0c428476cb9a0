//! CSV output scenarios: exact line counts, quote-doubling round trips, and
//! export idempotence.

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;

use colloquy::export::{render_csv, CsvExporter, ExportLabel, CSV_HEADER};
use colloquy::types::{ResultRow, SourceCitation};

/// Minimal reader for the writer's own dialect: every field double-quoted,
/// internal quotes doubled, one record per line.
fn parse_csv(content: &str) -> Vec<Vec<String>> {
    let content = content.strip_prefix('\u{FEFF}').unwrap_or(content);
    let mut records = Vec::new();
    for line in content.lines().skip(1) {
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut chars = line.chars().peekable();
        let mut in_quotes = false;
        while let Some(c) = chars.next() {
            match c {
                '"' if in_quotes => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                '"' => in_quotes = true,
                ',' if !in_quotes => {
                    fields.push(std::mem::take(&mut field));
                }
                c => field.push(c),
            }
        }
        fields.push(field);
        records.push(fields);
    }
    records
}

fn cited_row(question: &str, answer: &str, rank: u32, url: &str) -> ResultRow {
    ResultRow::bare(question, answer, "thread").with_source(
        rank,
        &SourceCitation {
            index: rank,
            title: format!("title {rank}"),
            content: format!("content {rank}"),
            site: "site.example".into(),
            url: url.into(),
            time: "2026-03-04".into(),
        },
    )
}

fn fixed_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-08-07T10:20:30Z")
        .unwrap()
        .with_timezone(&Utc)
}

#[test]
fn three_sourceless_questions_make_exactly_four_lines() {
    let rows = vec![
        ResultRow::bare("q1", "a1", "t"),
        ResultRow::bare("q2", "a2", "t"),
        ResultRow::bare("q3", "a3", "t"),
    ];
    let csv = render_csv(&rows);
    assert_eq!(csv.lines().count(), 4);

    for record in parse_csv(&csv) {
        assert_eq!(record.len(), CSV_HEADER.len());
        // sequence and all five source fields empty
        for field in &record[3..] {
            assert_eq!(field, "");
        }
    }
}

#[test]
fn one_question_citing_two_sources_makes_three_lines() {
    let rows = vec![
        cited_row("q", "a", 1, "https://a.example/1"),
        cited_row("q", "a", 2, "https://b.example/2"),
    ];
    let csv = render_csv(&rows);
    assert_eq!(csv.lines().count(), 3);

    let records = parse_csv(&csv);
    assert_eq!(records[0][0], records[1][0], "same question");
    assert_eq!(records[0][1], records[1][1], "same answer");
    assert_eq!(records[0][3], "1");
    assert_eq!(records[1][3], "2");
}

#[test]
fn stop_after_two_of_five_exports_only_the_prefix() {
    let rows = vec![
        ResultRow::bare("question 1", "a1", "t"),
        ResultRow::bare("question 2", "a2", "t"),
    ];
    let csv = render_csv(&rows);
    assert_eq!(csv.lines().count(), 3, "header plus the two finished questions");
    let records = parse_csv(&csv);
    assert_eq!(records[0][0], "question 1");
    assert_eq!(records[1][0], "question 2");
}

#[test]
fn quoted_fields_round_trip_exactly() {
    let mut row = ResultRow::bare(
        "what does \"idempotent\" mean, exactly?",
        "it means f(f(x)) = f(x), per \"the\" definition",
        "terminology, part 1",
    );
    row.source_title = "标题，带逗号".into();
    row.source_url = "https://example.com/path?a=1,2&b=\"x\"".into();
    let original = row.clone();

    let records = parse_csv(&render_csv(&[row]));
    assert_eq!(records[0][0], original.question);
    assert_eq!(records[0][1], original.answer);
    assert_eq!(records[0][2], original.conversation_label);
    assert_eq!(records[0][4], original.source_title);
    assert_eq!(records[0][7], original.source_url);
}

#[test]
fn embedded_newlines_flatten_to_spaces() {
    let row = ResultRow::bare("q", "line one\nline two\r\nline three", "t");
    let records = parse_csv(&render_csv(&[row]));
    assert_eq!(records[0][1], "line one line two line three");
}

#[test]
fn export_now_twice_produces_identical_row_content() {
    let dir = tempfile::tempdir().unwrap();
    let exporter = CsvExporter::new(dir.path(), dir.path().join("fb"));
    let rows = vec![
        cited_row("q", "a", 1, "https://a.example/1"),
        ResultRow::bare("q2", "a2", "t"),
    ];

    let first = exporter
        .export_rows(&rows, ExportLabel::Manual, fixed_time())
        .unwrap();
    let second = exporter
        .export_rows(&rows, ExportLabel::Manual, fixed_time())
        .unwrap();

    assert_ne!(first.path, second.path, "files are distinct");
    let a = std::fs::read_to_string(&first.path).unwrap();
    let b = std::fs::read_to_string(&second.path).unwrap();
    assert_eq!(a, b, "row content identical across exports");
}

#[test]
fn empty_row_set_exports_header_only() {
    let dir = tempfile::tempdir().unwrap();
    let exporter = CsvExporter::new(dir.path(), dir.path().join("fb"));
    let file = exporter
        .export_rows(&[], ExportLabel::Auto, fixed_time())
        .unwrap();
    assert_eq!(file.row_count, 0);

    let content = std::fs::read_to_string(&file.path).unwrap();
    let stripped = content.strip_prefix('\u{FEFF}').unwrap();
    assert_eq!(stripped.lines().count(), 1);
    assert_eq!(stripped.lines().next().unwrap(), CSV_HEADER.join(","));
}

#[test]
fn filename_carries_label_and_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let exporter = CsvExporter::new(dir.path(), dir.path().join("fb"));
    let file = exporter
        .export_rows(&[], ExportLabel::StopExport, fixed_time())
        .unwrap();
    assert_eq!(file.filename, "qa_batch_stopped_2026-08-07T10-20-30.csv");
}
