//! Batch driver — executes one batch of questions against the chat UI.
//!
//! Per-batch state machine: `Idle → Running → (per question: Sending →
//! Waiting → Collecting → Advancing) → Completed | Stopped | Aborted`.
//! Cancellation is cooperative: the token is re-checked at every step
//! boundary and after every timed wait, because the host page mutates
//! underneath us on its own schedule and a preemptive abort mid-scrape
//! would lose the rows already on screen.

pub mod cdp;
pub mod collect;
pub mod surface;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::types::{BatchDisposition, BatchOutcome, ResultRow};
use crate::relay::Event;
use surface::{ChatSurface, ControlState, InputStatus, SurfaceError};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("a batch run is already active in this page context")]
    AlreadyRunning,
    #[error("chat input region not found — make sure the chat page is open")]
    InputNotFound,
    #[error("chat input region is not visible — check the page state")]
    InputHidden,
    #[error("the send control stayed idle after {attempts} attempts; the input content may not have registered")]
    SendNotAccepted { attempts: u32 },
    #[error("could not confirm the question was accepted within the retry budget")]
    SendVerifyTimeout,
    #[error("new conversation could not be verified by shortcut or click")]
    ThreadResetUnverified,
    #[error("stopped by user")]
    Stopped,
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// Every wait the driver performs, with the production defaults.
/// Tests swap in [`Timings::rapid`] so a full batch runs in milliseconds.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Settle after focusing the input.
    pub focus_settle: Duration,
    /// Settle after the rich-editor fill before verifying content.
    pub content_settle: Duration,
    /// Settle after the simulated-typing fallback.
    pub retype_settle: Duration,
    /// Settle after dispatching Enter before acceptance polling.
    pub post_enter_settle: Duration,
    /// Acceptance polling budget.
    pub verify_attempts: u32,
    /// Attempts during which a still-idle control triggers a direct click.
    pub verify_click_attempts: u32,
    pub verify_waiting_backoff: Duration,
    pub verify_unknown_backoff: Duration,
    pub post_click_backoff: Duration,
    /// Cadence of send-control state checks while waiting for a reply.
    pub state_poll: Duration,
    /// Cadence of stop-token checks during waits.
    pub stop_poll: Duration,
    /// Settle after completion is detected, before scraping.
    pub collect_settle: Duration,
    /// Hard upper bound on one reply; collection is forced afterwards.
    pub reply_timeout: Duration,
    /// Pause between questions, consumed in token-checked slices.
    pub interquestion_pause: Duration,
    pub pause_slice: Duration,
    /// Wait after the shortcut reset before verifying.
    pub shortcut_wait: Duration,
    /// Wait after the click reset before verifying.
    pub click_wait: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            focus_settle: Duration::from_millis(300),
            content_settle: Duration::from_millis(1_500),
            retype_settle: Duration::from_millis(800),
            post_enter_settle: Duration::from_millis(1_000),
            verify_attempts: 10,
            verify_click_attempts: 3,
            verify_waiting_backoff: Duration::from_millis(1_500),
            verify_unknown_backoff: Duration::from_millis(1_000),
            post_click_backoff: Duration::from_millis(1_500),
            state_poll: Duration::from_millis(500),
            stop_poll: Duration::from_millis(300),
            collect_settle: Duration::from_millis(3_000),
            reply_timeout: Duration::from_secs(180),
            interquestion_pause: Duration::from_millis(1_000),
            pause_slice: Duration::from_millis(200),
            shortcut_wait: Duration::from_millis(1_500),
            click_wait: Duration::from_millis(2_000),
        }
    }
}

impl Timings {
    /// Millisecond-scale timings for scripted-surface tests.
    pub fn rapid() -> Self {
        let tick = Duration::from_millis(1);
        Self {
            focus_settle: tick,
            content_settle: tick,
            retype_settle: tick,
            post_enter_settle: tick,
            verify_attempts: 10,
            verify_click_attempts: 3,
            verify_waiting_backoff: tick,
            verify_unknown_backoff: tick,
            post_click_backoff: tick,
            state_poll: tick,
            stop_poll: tick,
            collect_settle: tick,
            reply_timeout: Duration::from_millis(250),
            interquestion_pause: Duration::from_millis(5),
            pause_slice: tick,
            shortcut_wait: tick,
            click_wait: tick,
        }
    }
}

/// Drives one batch at a time over a [`ChatSurface`].
pub struct BatchDriver<S: ChatSurface> {
    surface: Arc<S>,
    timings: Timings,
    events: broadcast::Sender<Event>,
    /// Live accumulation buffer; snapshots are cheap copies.
    rows: Mutex<Vec<ResultRow>>,
    active: AtomicBool,
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S: ChatSurface> BatchDriver<S> {
    pub fn new(surface: Arc<S>, timings: Timings, events: broadcast::Sender<Event>) -> Self {
        Self {
            surface,
            timings,
            events,
            rows: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Shallow copy of the rows accumulated so far, for out-of-band
    /// "export what we have" requests.
    pub fn snapshot(&self) -> Vec<ResultRow> {
        self.rows.lock().expect("rows lock").clone()
    }

    /// Run the whole batch. Rejects a second concurrent run; otherwise the
    /// outcome always carries whatever rows were accumulated, flagged with
    /// how the run ended.
    pub async fn run(
        &self,
        task_id: &str,
        questions: &[String],
        token: CancellationToken,
    ) -> Result<BatchOutcome, DriverError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(DriverError::AlreadyRunning);
        }
        let _guard = ActiveGuard(&self.active);
        self.rows.lock().expect("rows lock").clear();

        let total = questions.len();
        info!("driver: batch {task_id} started with {total} question(s)");

        let mut abort_reason: Option<String> = None;

        for (i, question) in questions.iter().enumerate() {
            if token.is_cancelled() {
                break;
            }
            self.progress(task_id, i + 1, total, "sending question", Some(question));

            match self.process_question(question, &token).await {
                Ok(rows) => {
                    debug!("driver: question {} produced {} row(s)", i + 1, rows.len());
                    self.append_rows(rows);
                }
                Err(DriverError::Stopped) => break,
                Err(e) => {
                    warn!("driver: question {} failed: {e}", i + 1);
                    let label = self.surface.conversation_label().await;
                    self.append_rows(vec![ResultRow::error(question, &e.to_string(), label)]);
                }
            }

            let collected = self.rows.lock().expect("rows lock").len();
            self.progress(
                task_id,
                i + 1,
                total,
                &format!("{collected} row(s) collected"),
                Some(question),
            );

            if token.is_cancelled() || i + 1 == total {
                continue;
            }

            // The next question needs a fresh thread; an unverified reset
            // would contaminate it, which is fatal for the remaining batch.
            match self.start_new_thread(&token).await {
                Ok(()) => {}
                Err(DriverError::Stopped) => break,
                Err(e) => {
                    warn!("driver: thread reset failed, aborting remainder: {e}");
                    abort_reason = Some(e.to_string());
                    break;
                }
            }

            if self.paced_pause(&token).await.is_err() {
                break;
            }
        }

        let rows = self.snapshot();
        let disposition = if token.is_cancelled() {
            info!("driver: batch {task_id} stopped by user with {} row(s)", rows.len());
            BatchDisposition::Stopped
        } else if let Some(reason) = abort_reason {
            BatchDisposition::Aborted(reason)
        } else {
            info!("driver: batch {task_id} completed with {} row(s)", rows.len());
            BatchDisposition::Completed
        };
        Ok(BatchOutcome { disposition, rows })
    }

    // ── Per-question steps ────────────────────────────────────────────────

    async fn process_question(
        &self,
        question: &str,
        token: &CancellationToken,
    ) -> Result<Vec<ResultRow>, DriverError> {
        self.send_question(question, token).await?;
        if token.is_cancelled() {
            return Err(DriverError::Stopped);
        }
        self.wait_for_reply_and_collect(question, token).await
    }

    /// Fill the input, press Enter, and verify the question was accepted.
    async fn send_question(
        &self,
        question: &str,
        token: &CancellationToken,
    ) -> Result<(), DriverError> {
        match self.surface.input_status().await? {
            InputStatus::Missing => return Err(DriverError::InputNotFound),
            InputStatus::Hidden => return Err(DriverError::InputHidden),
            InputStatus::Ready => {}
        }
        self.checked_sleep(self.timings.focus_settle, token).await?;

        let verified = self.surface.fill_input(question).await?;
        self.checked_sleep(self.timings.content_settle, token).await?;

        if !verified {
            debug!("driver: rich-editor fill unverified, falling back to typed input");
            self.surface.type_input(question, token).await?;
            self.checked_sleep(self.timings.retype_settle, token).await?;
        }
        if token.is_cancelled() {
            return Err(DriverError::Stopped);
        }

        self.surface.press_enter().await?;
        self.checked_sleep(self.timings.post_enter_settle, token).await?;

        self.verify_sent(token).await
    }

    /// Poll the send control until it confirms acceptance by going busy.
    async fn verify_sent(&self, token: &CancellationToken) -> Result<(), DriverError> {
        for attempt in 1..=self.timings.verify_attempts {
            if token.is_cancelled() {
                return Err(DriverError::Stopped);
            }
            match self.surface.control_state().await? {
                ControlState::Generating => return Ok(()),
                ControlState::Waiting => {
                    self.checked_sleep(self.timings.verify_waiting_backoff, token).await?;
                }
                ControlState::Ready => {
                    if attempt <= self.timings.verify_click_attempts {
                        // Enter may have been swallowed; drive the control
                        // directly and re-poll.
                        if let Err(e) = self.surface.click_send().await {
                            warn!("driver: direct send click failed: {e}");
                        }
                        self.checked_sleep(self.timings.post_click_backoff, token).await?;
                    } else {
                        return Err(DriverError::SendNotAccepted { attempts: attempt });
                    }
                }
                ControlState::Unknown => {
                    self.checked_sleep(self.timings.verify_unknown_backoff, token).await?;
                }
            }
        }
        Err(DriverError::SendVerifyTimeout)
    }

    /// Wait for the reply to finish streaming, then scrape it.
    ///
    /// The completion signal is the send control flipping from busy back to
    /// idle; DOM-mutation revisions serve as wakeup hints between polls.
    /// After the hard timeout collection is forced regardless of state so a
    /// stuck page cannot wedge the batch.
    async fn wait_for_reply_and_collect(
        &self,
        question: &str,
        token: &CancellationToken,
    ) -> Result<Vec<ResultRow>, DriverError> {
        let deadline = Instant::now() + self.timings.reply_timeout;
        // Acceptance was just confirmed, so the control is busy now; the
        // first idle observation is the completion edge.
        let mut last_state = ControlState::Generating;
        let mut last_revision = self.surface.dom_revision().await;
        let mut last_check = Instant::now();
        let mut completed = false;

        while Instant::now() < deadline {
            if self.checked_sleep(self.timings.stop_poll, token).await.is_err() {
                // Stop mid-wait: hand back nothing for this question; rows
                // already accumulated stay in the buffer.
                return Err(DriverError::Stopped);
            }

            let revision = self.surface.dom_revision().await;
            let due = revision != last_revision || last_check.elapsed() >= self.timings.state_poll;
            if !due {
                continue;
            }
            last_revision = revision;
            last_check = Instant::now();

            let state = self.surface.control_state().await?;
            if last_state == ControlState::Generating
                && matches!(state, ControlState::Waiting | ControlState::Ready)
            {
                completed = true;
                break;
            }
            last_state = state;
        }

        if !completed {
            warn!(
                "driver: reply wait exceeded {:?}; forcing collection",
                self.timings.reply_timeout
            );
        }

        if self.checked_sleep(self.timings.collect_settle, token).await.is_err() {
            return Err(DriverError::Stopped);
        }

        match self.surface.collect_exchange(question).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                warn!("driver: collection failed: {e}");
                let label = self.surface.conversation_label().await;
                Ok(vec![ResultRow::error(question, &e.to_string(), label)])
            }
        }
    }

    /// Reset to a fresh thread: shortcut first, click fallback, and a
    /// two-of-four indicator vote as verification for either path.
    async fn start_new_thread(&self, token: &CancellationToken) -> Result<(), DriverError> {
        if token.is_cancelled() {
            return Err(DriverError::Stopped);
        }

        self.surface.reset_thread_shortcut().await?;
        self.checked_sleep(self.timings.shortcut_wait, token).await?;
        let indicators = self.surface.thread_indicators().await?;
        if indicators.confirmed() {
            debug!("driver: shortcut reset confirmed ({}/4 signals)", indicators.agreeing());
            return Ok(());
        }

        debug!("driver: shortcut reset unverified, trying the click path");
        self.surface.reset_thread_click().await?;
        self.checked_sleep(self.timings.click_wait, token).await?;
        let indicators = self.surface.thread_indicators().await?;
        if indicators.confirmed() {
            debug!("driver: click reset confirmed ({}/4 signals)", indicators.agreeing());
            return Ok(());
        }

        Err(DriverError::ThreadResetUnverified)
    }

    /// Inter-question pause, consumed in slices so a stop lands quickly.
    async fn paced_pause(&self, token: &CancellationToken) -> Result<(), DriverError> {
        let mut remaining = self.timings.interquestion_pause;
        while remaining > Duration::ZERO {
            let slice = remaining.min(self.timings.pause_slice);
            self.checked_sleep(slice, token).await?;
            remaining -= slice;
        }
        Ok(())
    }

    /// Sleep that loses the race against cancellation.
    async fn checked_sleep(
        &self,
        duration: Duration,
        token: &CancellationToken,
    ) -> Result<(), DriverError> {
        if token.is_cancelled() {
            return Err(DriverError::Stopped);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = token.cancelled() => Err(DriverError::Stopped),
        }
    }

    fn append_rows(&self, rows: Vec<ResultRow>) {
        self.rows.lock().expect("rows lock").extend(rows);
    }

    fn progress(&self, task_id: &str, current: usize, total: usize, message: &str, question: Option<&String>) {
        let _ = self.events.send(Event::Progress {
            task_id: task_id.to_string(),
            current,
            total,
            message: message.to_string(),
            question: question.cloned(),
        });
    }
}
