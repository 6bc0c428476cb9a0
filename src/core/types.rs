use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One exported CSV record.
///
/// An answer that cites N web sources produces N rows sharing the same
/// `question` / `answer` / `conversation_label` and differing only in the
/// source fields and `sequence_index`. An answer citing nothing produces
/// exactly one row with empty source fields and no sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub question: String,
    pub answer: String,
    /// Best-effort title of the chat thread the answer came from.
    pub conversation_label: String,
    /// 1-based rank among multiple sources for the same answer.
    #[serde(default)]
    pub sequence_index: Option<u32>,
    #[serde(default)]
    pub source_title: String,
    #[serde(default)]
    pub source_content: String,
    #[serde(default)]
    pub source_site: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub source_time: String,
}

impl ResultRow {
    /// Row for an answer with no cited sources.
    pub fn bare(
        question: impl Into<String>,
        answer: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            conversation_label: label.into(),
            sequence_index: None,
            source_title: String::new(),
            source_content: String::new(),
            source_site: String::new(),
            source_url: String::new(),
            source_time: String::new(),
        }
    }

    /// Placeholder row recorded when a question fails; the error text goes in
    /// the answer field so the row count never drops below the question count.
    pub fn error(question: impl Into<String>, message: &str, label: impl Into<String>) -> Self {
        Self::bare(question, format!("processing failed: {message}"), label)
    }

    pub fn with_source(mut self, rank: u32, source: &SourceCitation) -> Self {
        self.sequence_index = Some(if source.index > 0 { source.index } else { rank });
        self.source_title = source.title.clone();
        self.source_content = source.content.clone();
        self.source_site = source.site.clone();
        self.source_url = source.url.clone();
        self.source_time = source.time.clone();
        self
    }
}

/// One cited web source scraped out of an answer's search-results block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCitation {
    pub index: u32,
    pub title: String,
    pub content: String,
    pub site: String,
    pub url: String,
    pub time: String,
}

/// Number of distinct questions represented in a row set.
pub fn distinct_question_count(rows: &[ResultRow]) -> usize {
    let mut seen = std::collections::HashSet::new();
    rows.iter().filter(|r| seen.insert(r.question.as_str())).count()
}

/// Number of rows carrying a non-empty source URL.
pub fn cited_url_count(rows: &[ResultRow]) -> usize {
    rows.iter().filter(|r| !r.source_url.trim().is_empty()).count()
}

// ───────────────────────────────────────────────────────────────────────────
// Task records
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Running,
    Stopping,
    Stopped,
    StoppedWithExport,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Waiting | TaskStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Stopped
                | TaskStatus::StoppedWithExport
                | TaskStatus::Completed
                | TaskStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
}

/// Persisted record of one batch run. The registry is the single writer;
/// everything else sees copies handed over at report boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    /// Identifier of the page context (browser tab) the run is bound to.
    pub context_id: String,
    pub progress: TaskProgress,
    #[serde(default)]
    pub rows: Vec<ResultRow>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Stamped on every save; drives the 24 h expiry sweep.
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Filename of the exported CSV once a terminal export has happened.
    #[serde(default)]
    pub filename: Option<String>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, context_id: impl Into<String>, status: TaskStatus) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status,
            context_id: context_id.into(),
            progress: TaskProgress::default(),
            rows: Vec::new(),
            created_at: now,
            ended_at: None,
            last_updated: now,
            error: None,
            stop_reason: None,
            filename: None,
        }
    }
}

/// Opaque task identifier: millisecond timestamp plus a 9-char random suffix.
pub fn new_task_id() -> String {
    use rand::distr::Alphanumeric;
    use rand::RngExt;

    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(9)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{}_{}", Utc::now().timestamp_millis(), suffix)
}

// ───────────────────────────────────────────────────────────────────────────
// Batch outcomes
// ───────────────────────────────────────────────────────────────────────────

/// How a batch run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum BatchDisposition {
    /// Every question was processed (error rows included).
    Completed,
    /// The user stopped the run; rows are a prefix of the full result.
    Stopped,
    /// A fatal batch error aborted the remaining questions.
    Aborted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub disposition: BatchDisposition,
    pub rows: Vec<ResultRow>,
}

impl BatchOutcome {
    pub fn user_stopped(&self) -> bool {
        self.disposition == BatchDisposition::Stopped
    }
}
