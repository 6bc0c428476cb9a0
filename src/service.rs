//! Batch service — answers relay commands and owns the active run.
//!
//! This is the privileged side of the old extension split: it creates task
//! records, spawns the driver, relays stop signals, and hands terminal row
//! sets to the registry's completion handler (which exports and notifies).
//! One run per page context: a start while another run is active is
//! rejected, never queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::types::{
    distinct_question_count, BatchDisposition, TaskRecord, TaskStatus,
};
use crate::core::AppState;
use crate::driver::surface::{ChatSurface, InputStatus};
use crate::driver::{BatchDriver, DriverError, Timings};
use crate::export::{CsvExporter, ExportLabel};
use crate::registry::RegistryError;
use crate::relay::{Command, Envelope, Event, Reply};

struct ActiveRun {
    task_id: String,
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

pub struct BatchService<S: ChatSurface + 'static> {
    state: AppState,
    surface: Arc<S>,
    driver: Arc<BatchDriver<S>>,
    exporter: Arc<CsvExporter>,
    context_id: String,
    stop_grace: Duration,
    active: Mutex<Option<ActiveRun>>,
}

impl<S: ChatSurface + 'static> BatchService<S> {
    pub fn new(
        state: AppState,
        surface: Arc<S>,
        timings: Timings,
        exporter: CsvExporter,
        context_id: impl Into<String>,
    ) -> Arc<Self> {
        let driver = Arc::new(BatchDriver::new(
            Arc::clone(&surface),
            timings,
            state.events.clone(),
        ));
        let stop_grace = state.config.automation.resolve_stop_grace();
        Arc::new(Self {
            state,
            surface,
            driver,
            exporter: Arc::new(exporter),
            context_id: context_id.into(),
            stop_grace,
            active: Mutex::new(None),
        })
    }

    /// Consume relay envelopes until the channel closes. Progress events
    /// from the driver are persisted into the registry as they arrive.
    pub async fn serve(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope>) {
        let persister = self.spawn_progress_persister();

        while let Some(Envelope { command, respond }) = rx.recv().await {
            debug!("service: handling {command:?}");
            let reply = self.handle(command).await;
            // The caller may have timed out and dropped the receiver.
            let _ = respond.send(reply);
        }

        persister.abort();
        // The channel closing means the front end is gone; tasks bound to
        // this context have nothing left to report to.
        self.state.registry.clear_for_context(&self.context_id);
    }

    fn spawn_progress_persister(&self) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.state.registry);
        let mut events = self.state.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::Progress { task_id, current, total, .. }) => {
                        registry.record_progress(&task_id, current, total);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("service: progress persister lagged by {n} event(s)");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle(&self, command: Command) -> Reply {
        match command {
            Command::Ping => {
                let ready = matches!(
                    self.surface.input_status().await,
                    Ok(InputStatus::Ready)
                );
                Reply::Pong { ready }
            }
            Command::StartBatch { task_id, questions } => {
                self.start_batch(task_id, questions).await
            }
            Command::StopBatch { task_id } => self.stop_batch(&task_id).await,
            Command::Snapshot => {
                let rows = self.driver.snapshot();
                let questions = distinct_question_count(&rows);
                Reply::Rows { rows, questions }
            }
            Command::ExportNow => self.export_now().await,
            Command::ClearAll => {
                if let Some(run) = self.active.lock().await.take() {
                    run.token.cancel();
                    run.join.abort();
                }
                self.state.registry.force_clear_all();
                Reply::Ack {
                    message: "all task state cleared".into(),
                }
            }
        }
    }

    async fn start_batch(&self, task_id: String, questions: Vec<String>) -> Reply {
        if questions.is_empty() {
            return Reply::failure("no questions to process");
        }

        let mut active = self.active.lock().await;
        if let Some(run) = active.as_ref() {
            if !run.join.is_finished() {
                return Reply::failure(format!(
                    "a batch run ({}) is already active in this page context",
                    run.task_id
                ));
            }
        }

        let mut record = TaskRecord::new(&task_id, &self.context_id, TaskStatus::Running);
        record.progress.total = questions.len();
        self.state.registry.save_state(record);

        let token = CancellationToken::new();
        let run_token = token.clone();
        let driver = Arc::clone(&self.driver);
        let registry = Arc::clone(&self.state.registry);
        let exporter = Arc::clone(&self.exporter);
        let total = questions.len();
        let spawned_id = task_id.clone();

        let join = tokio::spawn(async move {
            match driver.run(&spawned_id, &questions, run_token).await {
                Ok(outcome) => {
                    let rows = outcome.rows;
                    let result = match outcome.disposition {
                        BatchDisposition::Completed => registry.handle_completion(
                            &spawned_id,
                            true,
                            rows,
                            None,
                            false,
                            &exporter,
                        ),
                        BatchDisposition::Stopped => {
                            // The stop handler owns the stop-export; this
                            // completion is void by design.
                            registry.handle_completion(
                                &spawned_id,
                                false,
                                rows,
                                Some("stopped by user".into()),
                                false,
                                &exporter,
                            )
                        }
                        BatchDisposition::Aborted(reason) => registry.handle_completion(
                            &spawned_id,
                            false,
                            rows,
                            Some(reason),
                            false,
                            &exporter,
                        ),
                    };
                    match result {
                        Ok(_) => {}
                        Err(RegistryError::TaskStopping(_))
                        | Err(RegistryError::AlreadyProcessing(_)) => {
                            debug!("service: completion for {spawned_id} superseded");
                        }
                        Err(e) => warn!("service: completion handling failed: {e}"),
                    }
                }
                Err(DriverError::AlreadyRunning) => {
                    warn!("service: driver refused {spawned_id}: already running");
                }
                Err(e) => warn!("service: run {spawned_id} failed to start: {e}"),
            }
        });

        *active = Some(ActiveRun {
            task_id: task_id.clone(),
            token,
            join,
        });

        info!("service: batch {task_id} started ({total} questions)");
        Reply::Ack {
            message: format!("batch started with {total} question(s)"),
        }
    }

    async fn stop_batch(&self, task_id: &str) -> Reply {
        let mut active = self.active.lock().await;
        let Some(run) = active.as_ref() else {
            return Reply::failure("no active batch run to stop");
        };
        if run.join.is_finished() {
            return Reply::failure("the batch run already finished");
        }
        if run.task_id != task_id {
            return Reply::failure(format!(
                "task ID does not match the active run ({})",
                run.task_id
            ));
        }

        info!("service: stopping batch {task_id}");
        // Void any in-flight completion from the driver itself; the stop
        // export below is the one that counts.
        self.state.registry.mark_stopping(task_id);
        run.token.cancel();

        // Cancellation is deliberately lazy: give an in-flight scrape a
        // moment to finish and hand its rows back before we export.
        tokio::time::sleep(self.stop_grace).await;

        let rows = self.driver.snapshot();
        let reply = if rows.is_empty() {
            match self.state.registry.handle_stop(task_id, "user requested stop") {
                Ok(()) => Reply::Ack {
                    message: "stopped; nothing collected yet, no export".into(),
                },
                Err(e) => Reply::failure(e.to_string()),
            }
        } else {
            match self.state.registry.handle_completion(
                task_id,
                true,
                rows,
                None,
                true,
                &self.exporter,
            ) {
                Ok(Some(file)) => Reply::Exported {
                    filename: file.filename,
                    rows: file.row_count,
                },
                Ok(None) => Reply::Ack {
                    message: "stopped; task record was already gone".into(),
                },
                Err(e) => Reply::failure(e.to_string()),
            }
        };

        *active = None;
        reply
    }

    /// Out-of-band export: prefer the live buffer, fall back to the most
    /// recently updated persisted record that still has rows. An empty row
    /// set still exports (header-only file).
    async fn export_now(&self) -> Reply {
        let mut rows = self.driver.snapshot();
        if rows.is_empty() {
            let mut candidates = self.state.registry.list_all_with_rows();
            candidates.sort_by_key(|r| r.last_updated);
            if let Some(record) = candidates.pop() {
                debug!("service: manual export using persisted rows of {}", record.id);
                rows = record.rows;
            }
        }

        match self
            .exporter
            .export_rows(&rows, ExportLabel::Manual, chrono::Utc::now())
        {
            Ok(file) => Reply::Exported {
                filename: file.filename,
                rows: file.row_count,
            },
            Err(e) => Reply::failure(e.to_string()),
        }
    }
}
