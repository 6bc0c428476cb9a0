//! The `ChatSurface` seam between the batch state machine and the host page.
//!
//! The hosted chat UI exposes no "reply done" event; the only completion
//! signal is the send control's CSS class set flipping from busy back to
//! idle. That heuristic is host-specific and fragile, so it lives behind
//! this trait: the CDP adapter implements it for the real page and tests
//! implement it with a scripted fake, leaving the state machine untouched
//! when the host markup shifts.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::types::ResultRow;

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("page evaluation failed: {0}")]
    Eval(String),
    #[error("element not found: {0}")]
    Missing(&'static str),
    #[error("page context is gone: {0}")]
    Gone(String),
}

/// Send-control state inferred from its CSS class set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Accepts input — a question can be sent (or the last send was ignored).
    Ready,
    /// A reply is streaming.
    Generating,
    /// Disabled without the busy marker: debounce or post-reply settling.
    Waiting,
    /// Control not found or classes unreadable.
    Unknown,
}

/// Classify a raw class string. `busy_class` on top of `disabled_class`
/// means a reply is streaming; `disabled_class` alone is the settling state.
pub fn control_state_from_classes(classes: &str, disabled_class: &str, busy_class: &str) -> ControlState {
    let has = |needle: &str| classes.split_whitespace().any(|c| c == needle);
    match (has(disabled_class), has(busy_class)) {
        (true, true) => ControlState::Generating,
        (true, false) => ControlState::Waiting,
        (false, _) => ControlState::Ready,
    }
}

/// Whether the chat input region is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    Missing,
    Hidden,
    Ready,
}

/// The four signals used to verify that a thread reset actually happened.
/// No single one is reliable; agreement of two is treated as confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ThreadIndicators {
    pub at_root_path: bool,
    pub welcome_visible: bool,
    pub no_messages: bool,
    pub input_empty: bool,
}

impl ThreadIndicators {
    pub fn agreeing(&self) -> usize {
        [self.at_root_path, self.welcome_visible, self.no_messages, self.input_empty]
            .iter()
            .filter(|&&b| b)
            .count()
    }

    pub fn confirmed(&self) -> bool {
        self.agreeing() >= 2
    }
}

/// Primitive operations the batch driver composes into a run.
///
/// Implementations must be safe to call repeatedly; the driver retries most
/// of these inside bounded budgets.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// Probe the chat input region.
    async fn input_status(&self) -> Result<InputStatus, SurfaceError>;

    /// Set the input content through the rich-editor path. Returns whether
    /// the input verifiably contains the text afterwards.
    async fn fill_input(&self, text: &str) -> Result<bool, SurfaceError>;

    /// Character-by-character fallback when [`fill_input`](Self::fill_input)
    /// could not be verified. Checks `token` between characters.
    async fn type_input(&self, text: &str, token: &CancellationToken) -> Result<(), SurfaceError>;

    /// Dispatch an Enter keystroke to the input.
    async fn press_enter(&self) -> Result<(), SurfaceError>;

    /// Invoke the send control's click handler directly (acceptance
    /// fallback when Enter was swallowed).
    async fn click_send(&self) -> Result<(), SurfaceError>;

    /// Current send-control state.
    async fn control_state(&self) -> Result<ControlState, SurfaceError>;

    /// Monotonic counter bumped by DOM mutations; a cheap wakeup hint for
    /// the completion-polling loop.
    async fn dom_revision(&self) -> u64;

    /// Scrape the latest answer and any cited sources into result rows.
    async fn collect_exchange(&self, question: &str) -> Result<Vec<ResultRow>, SurfaceError>;

    /// Best-effort thread title, for synthetic error rows.
    async fn conversation_label(&self) -> String;

    /// Keyboard-shortcut thread reset (primary path).
    async fn reset_thread_shortcut(&self) -> Result<(), SurfaceError>;

    /// Click-path thread reset (fallback; reveals the sidebar if needed).
    async fn reset_thread_click(&self) -> Result<(), SurfaceError>;

    /// Read the four reset-verification signals.
    async fn thread_indicators(&self) -> Result<ThreadIndicators, SurfaceError>;
}
