//! Task registry — single source of truth for batch-run state.
//!
//! The page-side driver may be unobservable (front end detached, browser
//! backgrounded), so every status transition, progress update, and the
//! accumulated row set are persisted here as typed records keyed by task ID.
//! Completion and stop notifications for one task ID are processed at most
//! once concurrently; a duplicate arriving mid-processing is rejected with an
//! explicit error instead of interleaving, which is what prevents a double
//! CSV export or a doubled user notification.

pub mod store;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::core::types::{
    cited_url_count, distinct_question_count, ResultRow, TaskRecord, TaskStatus,
};
use crate::export::{CsvExporter, ExportError, ExportLabel, ExportedFile};
use crate::relay::Event;
use store::TaskStore;

/// Records untouched for longer than this are swept.
pub const RECORD_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Cadence of the background expiry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How long a terminal record lingers before cleanup.
pub fn retention_for(status: TaskStatus) -> Duration {
    match status {
        TaskStatus::Completed => Duration::from_secs(5 * 60),
        TaskStatus::StoppedWithExport => Duration::from_secs(3 * 60),
        TaskStatus::Stopped => Duration::from_secs(5),
        _ => Duration::from_secs(60),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a notification for task {0} is already being processed")]
    AlreadyProcessing(String),
    #[error("task {0} is stopping; the notification is void")]
    TaskStopping(String),
    #[error("no record for task {0}")]
    NotFound(String),
    #[error(transparent)]
    Export(#[from] ExportError),
}

pub struct TaskRegistry {
    store: TaskStore,
    /// Task IDs whose completion/stop notification is mid-processing.
    processing: Mutex<HashSet<String>>,
    /// Task IDs marked stopping; further progress/completion for them is void.
    stopping: Mutex<HashSet<String>>,
    events: broadcast::Sender<Event>,
}

/// Holds the at-most-once slot for one task's completion processing;
/// released on drop.
pub struct CompletionTicket {
    registry: Arc<TaskRegistry>,
    id: String,
}

impl Drop for CompletionTicket {
    fn drop(&mut self) {
        self.registry
            .processing
            .lock()
            .expect("processing lock")
            .remove(&self.id);
    }
}

impl TaskRegistry {
    pub fn new(data_dir: Option<PathBuf>, events: broadcast::Sender<Event>) -> Self {
        Self {
            store: TaskStore::open(data_dir),
            processing: Mutex::new(HashSet::new()),
            stopping: Mutex::new(HashSet::new()),
            events,
        }
    }

    // ── Persisted key-value operations ────────────────────────────────────

    /// Persist `record`, stamping `last_updated`.
    pub fn save_state(&self, mut record: TaskRecord) {
        record.last_updated = Utc::now();
        self.store.put(record);
    }

    pub fn get_state(&self, task_id: &str) -> Option<TaskRecord> {
        self.store.get(task_id)
    }

    /// Records whose status is `running` or `waiting`.
    pub fn list_active(&self) -> Vec<TaskRecord> {
        self.store
            .all()
            .into_iter()
            .filter(|r| r.status.is_active())
            .collect()
    }

    /// Records that still carry accumulated rows — the manual-export
    /// fallback when no run is live.
    pub fn list_all_with_rows(&self) -> Vec<TaskRecord> {
        self.store
            .all()
            .into_iter()
            .filter(|r| !r.rows.is_empty())
            .collect()
    }

    pub fn clear(&self, task_id: &str) {
        self.store.remove(task_id);
        self.processing.lock().expect("processing lock").remove(task_id);
        self.stopping.lock().expect("stopping lock").remove(task_id);
        info!("registry: cleared task {task_id}");
    }

    /// Wipe the whole store and all in-flight bookkeeping.
    pub fn force_clear_all(&self) {
        self.store.clear();
        self.processing.lock().expect("processing lock").clear();
        self.stopping.lock().expect("stopping lock").clear();
        self.notify("batch runner", "all task state cleared");
    }

    // ── Stop signalling ───────────────────────────────────────────────────

    pub fn mark_stopping(&self, task_id: &str) {
        self.stopping
            .lock()
            .expect("stopping lock")
            .insert(task_id.to_string());
    }

    pub fn is_stopping(&self, task_id: &str) -> bool {
        self.stopping.lock().expect("stopping lock").contains(task_id)
    }

    /// Record a progress update. Updates for a stopping task are void.
    pub fn record_progress(&self, task_id: &str, current: usize, total: usize) -> bool {
        if self.is_stopping(task_id) {
            warn!("registry: task {task_id} is stopping — progress update ignored");
            return false;
        }
        match self.store.get(task_id) {
            Some(mut record) => {
                record.progress.current = current;
                record.progress.total = total;
                self.save_state(record);
                true
            }
            None => {
                warn!("registry: progress for unknown task {task_id} dropped");
                false
            }
        }
    }

    /// Mark a task stopped by the user. The record lingers briefly so a
    /// detached front end can still observe the terminal state.
    pub fn handle_stop(
        self: &Arc<Self>,
        task_id: &str,
        reason: &str,
    ) -> Result<(), RegistryError> {
        info!("registry: stop requested for {task_id} ({reason})");
        self.mark_stopping(task_id);

        let Some(mut record) = self.store.get(task_id) else {
            self.stopping.lock().expect("stopping lock").remove(task_id);
            warn!("registry: stop for unknown task {task_id}");
            return Err(RegistryError::NotFound(task_id.to_string()));
        };

        record.status = TaskStatus::Stopped;
        record.ended_at = Some(Utc::now());
        record.stop_reason = Some(reason.to_string());
        self.save_state(record);
        self.schedule_cleanup(task_id, retention_for(TaskStatus::Stopped));
        Ok(())
    }

    // ── Completion processing ─────────────────────────────────────────────

    /// Claim the at-most-once completion slot for `task_id`.
    pub fn begin_completion(
        self: &Arc<Self>,
        task_id: &str,
    ) -> Result<CompletionTicket, RegistryError> {
        let mut processing = self.processing.lock().expect("processing lock");
        if !processing.insert(task_id.to_string()) {
            return Err(RegistryError::AlreadyProcessing(task_id.to_string()));
        }
        Ok(CompletionTicket {
            registry: Arc::clone(self),
            id: task_id.to_string(),
        })
    }

    /// Process a completion (or stop-export) notification: export the rows,
    /// stamp the terminal status, notify the user, schedule retention
    /// cleanup.
    ///
    /// Returns `Ok(None)` when no record exists for the task — a warning,
    /// not an error. A notification for a stopping task is void unless it is
    /// the stop-export itself.
    pub fn handle_completion(
        self: &Arc<Self>,
        task_id: &str,
        success: bool,
        rows: Vec<ResultRow>,
        error: Option<String>,
        is_stop_export: bool,
        exporter: &CsvExporter,
    ) -> Result<Option<ExportedFile>, RegistryError> {
        if self.is_stopping(task_id) && !is_stop_export {
            warn!("registry: task {task_id} is stopping — completion ignored");
            return Err(RegistryError::TaskStopping(task_id.to_string()));
        }

        let _ticket = self.begin_completion(task_id)?;

        let Some(mut record) = self.store.get(task_id) else {
            warn!("registry: completion for unknown task {task_id} dropped");
            return Ok(None);
        };

        if !success {
            record.status = TaskStatus::Failed;
            record.ended_at = Some(Utc::now());
            record.error = error.clone();
            record.rows = rows;
            self.save_state(record);

            let reason = error.unwrap_or_else(|| "unknown error".to_string());
            if !reason.contains("stopped by user") {
                self.notify(
                    "batch run failed",
                    &format!(
                        "collection failed: {reason}. Try reloading the chat \
                         page, restarting the tool, or checking connectivity."
                    ),
                );
            }
            self.send_event(Event::BatchFinished {
                task_id: task_id.to_string(),
                success: false,
                rows: 0,
                is_stop_export,
                error: Some(reason),
            });
            self.schedule_cleanup(task_id, retention_for(TaskStatus::Failed));
            return Ok(None);
        }

        let label = if is_stop_export {
            ExportLabel::StopExport
        } else {
            ExportLabel::Auto
        };

        match exporter.export_rows(&rows, label, Utc::now()) {
            Ok(file) => {
                let status = if is_stop_export {
                    TaskStatus::StoppedWithExport
                } else {
                    TaskStatus::Completed
                };
                record.status = status;
                record.ended_at = Some(Utc::now());
                record.filename = Some(file.filename.clone());
                record.rows = rows.clone();
                self.save_state(record);

                let questions = distinct_question_count(&rows);
                let cited = cited_url_count(&rows);
                let (title, lede) = if is_stop_export {
                    ("batch run stopped", "stopped by user; partial results exported")
                } else {
                    ("batch run complete", "all questions processed")
                };
                self.notify(
                    title,
                    &format!(
                        "{lede}: {questions} question(s), {cited} cited URL(s) — saved as {}",
                        file.filename
                    ),
                );
                self.send_event(Event::BatchFinished {
                    task_id: task_id.to_string(),
                    success: true,
                    rows: rows.len(),
                    is_stop_export,
                    error: None,
                });
                self.schedule_cleanup(task_id, retention_for(status));
                Ok(Some(file))
            }
            Err(e) => {
                // Keep the rows: a later manual export can still succeed.
                record.status = TaskStatus::Failed;
                record.ended_at = Some(Utc::now());
                record.error = Some(format!("export failed: {e}"));
                record.rows = rows;
                self.save_state(record);

                self.notify("export failed", &e.to_string());
                self.send_event(Event::BatchFinished {
                    task_id: task_id.to_string(),
                    success: false,
                    rows: 0,
                    is_stop_export,
                    error: Some(e.to_string()),
                });
                self.schedule_cleanup(task_id, retention_for(TaskStatus::Failed));
                Err(RegistryError::Export(e))
            }
        }
    }

    // ── Expiry ────────────────────────────────────────────────────────────

    /// Remove records whose `last_updated` is older than [`RECORD_EXPIRY`].
    /// Returns the number removed.
    pub fn sweep_expired(&self, now: chrono::DateTime<Utc>) -> usize {
        let horizon = now - chrono::Duration::from_std(RECORD_EXPIRY).expect("expiry fits");
        let removed = self.store.remove_where(|r| r.last_updated < horizon);
        for id in &removed {
            self.processing.lock().expect("processing lock").remove(id);
            self.stopping.lock().expect("stopping lock").remove(id);
        }
        if !removed.is_empty() {
            info!("registry: swept {} expired task record(s)", removed.len());
        }
        removed.len()
    }

    /// Hourly background sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                registry.sweep_expired(Utc::now());
            }
        })
    }

    /// Remove records bound to a closed page context.
    pub fn clear_for_context(&self, context_id: &str) -> usize {
        let removed = self.store.remove_where(|r| r.context_id == context_id);
        for id in &removed {
            self.processing.lock().expect("processing lock").remove(id);
            self.stopping.lock().expect("stopping lock").remove(id);
        }
        if !removed.is_empty() {
            info!(
                "registry: cleared {} task(s) for closed context {context_id}",
                removed.len()
            );
        }
        removed.len()
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn schedule_cleanup(self: &Arc<Self>, task_id: &str, after: Duration) {
        let registry = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            registry.clear(&task_id);
        });
    }

    fn notify(&self, title: &str, message: &str) {
        info!("notice: {title} — {message}");
        self.send_event(Event::Notice {
            title: title.to_string(),
            message: message.to_string(),
        });
    }

    fn send_event(&self, event: Event) {
        // Zero subscribers is fine; broadcast errors only mean nobody listens.
        let _ = self.events.send(event);
    }
}
