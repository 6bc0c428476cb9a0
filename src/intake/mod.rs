//! Question spreadsheet intake.
//!
//! Reads the user-supplied question list from a delimited text file. The
//! delimiter is sniffed per line (tab, then semicolon, then comma) and the
//! question column is identified by a case-insensitive substring match of the
//! header against a small multilingual label set, defaulting to the first
//! column. Intake failures are input errors: reported synchronously, and no
//! task is ever created for them.

use std::path::Path;

use tracing::{debug, info};

/// Header labels that identify the question column, in match priority order.
pub const QUESTION_HEADER_LABELS: &[&str] = &[
    "问题",
    "问题列表",
    "题目",
    "问题内容",
    "提问",
    "question",
    "query",
];

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("cannot read questions file: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "unsupported file format '.{0}' — export the spreadsheet as CSV \
         (UTF-8) and retry"
    )]
    UnsupportedFormat(String),
    #[error("the questions file needs a header line plus at least one data line")]
    TooShort,
    #[error(
        "no usable questions found — make sure the question column contains \
         text and the file is not password-protected"
    )]
    NoQuestions,
}

/// Load and parse the ordered question list from `path`.
pub fn load_questions(path: &Path) -> Result<Vec<String>, IntakeError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if matches!(ext.as_str(), "xls" | "xlsx") {
        return Err(IntakeError::UnsupportedFormat(ext));
    }

    let text = std::fs::read_to_string(path)?;
    let questions = parse_questions(&text)?;
    info!(
        "intake: {} question(s) loaded from {}",
        questions.len(),
        path.display()
    );
    Ok(questions)
}

/// Parse delimited text into the ordered question list.
pub fn parse_questions(text: &str) -> Result<Vec<String>, IntakeError> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 2 {
        return Err(IntakeError::TooShort);
    }

    let headers = split_delimited(lines[0]);
    let column = detect_question_column(&headers);
    debug!(
        "intake: using column {} of {} as the question column",
        column + 1,
        headers.len()
    );

    let mut questions = Vec::new();
    for line in &lines[1..] {
        let cells = split_delimited(line);
        if let Some(cell) = cells.get(column) {
            let question = strip_quotes(cell.trim()).trim();
            if !question.is_empty() && question != "undefined" {
                questions.push(question.to_string());
            }
        }
    }

    if questions.is_empty() {
        return Err(IntakeError::NoQuestions);
    }
    Ok(questions)
}

/// Find the question column by header match; first column when nothing hits.
pub fn detect_question_column(headers: &[String]) -> usize {
    for (i, header) in headers.iter().enumerate() {
        let header = strip_quotes(header.trim()).to_lowercase();
        if header.is_empty() {
            continue;
        }
        for label in QUESTION_HEADER_LABELS {
            if header.contains(&label.to_lowercase()) {
                return i;
            }
        }
    }
    0
}

/// Split one line on its sniffed delimiter: tab beats semicolon beats comma.
fn split_delimited(line: &str) -> Vec<String> {
    let delimiter = if line.contains('\t') {
        '\t'
    } else if line.contains(';') {
        ';'
    } else {
        ','
    };
    line.split(delimiter).map(str::to_string).collect()
}

/// Strip one pair of surrounding single or double quotes.
fn strip_quotes(value: &str) -> &str {
    let value = value.strip_prefix(['"', '\'']).unwrap_or(value);
    value.strip_suffix(['"', '\'']).unwrap_or(value)
}
