#![allow(dead_code)]
//! Scripted chat surface shared by the integration suites.
//!
//! Emulates the send-control dance the real page performs (busy while a
//! reply streams, idle when it finishes) without any browser, so batch runs
//! complete in milliseconds.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use colloquy::driver::surface::{
    ChatSurface, ControlState, InputStatus, SurfaceError, ThreadIndicators,
};
use colloquy::types::{ResultRow, SourceCitation};

/// Per-question behavior of the scripted page.
#[derive(Clone)]
pub enum Script {
    /// Reply normally; collection yields one row per source (or one bare
    /// row when there are none).
    Answer { sources: Vec<SourceCitation> },
    /// The send control never leaves `Ready`: Enter and clicks are ignored.
    SendIgnored,
    /// The reply arrives but scraping it fails.
    CollectFails,
}

#[derive(Default)]
struct SurfaceState {
    sends: usize,
    /// Remaining `Generating` observations before the reply "finishes".
    busy_reads: u32,
    revision: u64,
    reset_requests: usize,
}

pub struct ScriptedSurface {
    scripts: Vec<Script>,
    state: Mutex<SurfaceState>,
    /// Thread resets stop verifying after this many successful resets.
    pub resets_before_failure: Option<usize>,
    /// Cancel this token when send number (1-based) is dispatched.
    pub cancel_on_send: Option<(usize, CancellationToken)>,
    /// Extra delay inside collection, for concurrency tests.
    pub collect_delay: Duration,
}

impl ScriptedSurface {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts,
            state: Mutex::new(SurfaceState::default()),
            resets_before_failure: None,
            cancel_on_send: None,
            collect_delay: Duration::ZERO,
        }
    }

    pub fn answering(n: usize) -> Self {
        Self::new(vec![Script::Answer { sources: vec![] }; n])
    }

    fn current_script(&self) -> Script {
        let sends = self.state.lock().unwrap().sends;
        self.scripts
            .get(sends.saturating_sub(1))
            .cloned()
            .unwrap_or(Script::Answer { sources: vec![] })
    }
}

#[async_trait]
impl ChatSurface for ScriptedSurface {
    async fn input_status(&self) -> Result<InputStatus, SurfaceError> {
        Ok(InputStatus::Ready)
    }

    async fn fill_input(&self, _text: &str) -> Result<bool, SurfaceError> {
        Ok(true)
    }

    async fn type_input(&self, _text: &str, _token: &CancellationToken) -> Result<(), SurfaceError> {
        Ok(())
    }

    async fn press_enter(&self) -> Result<(), SurfaceError> {
        let sends = {
            let mut state = self.state.lock().unwrap();
            state.sends += 1;
            state.busy_reads = 2;
            state.sends
        };
        if let Some((at, token)) = &self.cancel_on_send {
            if sends == *at {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn click_send(&self) -> Result<(), SurfaceError> {
        Ok(())
    }

    async fn control_state(&self) -> Result<ControlState, SurfaceError> {
        if matches!(self.current_script(), Script::SendIgnored) {
            return Ok(ControlState::Ready);
        }
        let mut state = self.state.lock().unwrap();
        if state.busy_reads > 0 {
            state.busy_reads -= 1;
            Ok(ControlState::Generating)
        } else {
            Ok(ControlState::Waiting)
        }
    }

    async fn dom_revision(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.revision += 1;
        state.revision
    }

    async fn collect_exchange(&self, question: &str) -> Result<Vec<ResultRow>, SurfaceError> {
        if !self.collect_delay.is_zero() {
            tokio::time::sleep(self.collect_delay).await;
        }
        match self.current_script() {
            Script::Answer { sources } if sources.is_empty() => {
                Ok(vec![ResultRow::bare(question, "scripted answer", "scripted thread")])
            }
            Script::Answer { sources } => Ok(sources
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    ResultRow::bare(question, "scripted answer", "scripted thread")
                        .with_source((i + 1) as u32, s)
                })
                .collect()),
            Script::CollectFails => Err(SurfaceError::Eval("scripted scrape failure".into())),
            Script::SendIgnored => Ok(vec![]),
        }
    }

    async fn conversation_label(&self) -> String {
        "scripted thread".to_string()
    }

    async fn reset_thread_shortcut(&self) -> Result<(), SurfaceError> {
        self.state.lock().unwrap().reset_requests += 1;
        Ok(())
    }

    async fn reset_thread_click(&self) -> Result<(), SurfaceError> {
        Ok(())
    }

    async fn thread_indicators(&self) -> Result<ThreadIndicators, SurfaceError> {
        let resets = self.state.lock().unwrap().reset_requests;
        let verified = match self.resets_before_failure {
            Some(limit) => resets <= limit,
            None => true,
        };
        Ok(ThreadIndicators {
            at_root_path: verified,
            input_empty: verified,
            ..Default::default()
        })
    }
}

pub fn questions(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("question {i}")).collect()
}

pub fn two_sources() -> Vec<SourceCitation> {
    vec![
        SourceCitation {
            index: 1,
            title: "first".into(),
            content: "snippet one".into(),
            site: "a.example".into(),
            url: "https://a.example/1".into(),
            time: "2026-01-01".into(),
        },
        SourceCitation {
            index: 2,
            title: "second".into(),
            content: "snippet two".into(),
            site: "b.example".into(),
            url: "https://b.example/2".into(),
            time: "2026-01-02".into(),
        },
    ]
}
