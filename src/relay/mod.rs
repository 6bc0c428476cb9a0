//! Typed command/event protocol between front ends and the automation
//! service.
//!
//! The original three-context bridge dispatched on free-form action names;
//! here every request is a `Command` variant and every answer a `Reply`
//! variant, so an unhandled action is a compile-time hole in a `match`, not
//! a silently dropped message. Requests carry a bounded per-operation reply
//! budget and always resolve — a timeout synthesizes a `Reply::Failure`
//! rather than hanging the caller. Events are fire-and-forget broadcasts
//! that tolerate zero listeners.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::core::types::ResultRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Liveness probe of the automation surface.
    Ping,
    StartBatch {
        task_id: String,
        questions: Vec<String>,
    },
    StopBatch {
        task_id: String,
    },
    /// Rows accumulated so far by the active run.
    Snapshot,
    /// Export whatever has been collected, preferring the live buffer and
    /// falling back to the registry's persisted rows.
    ExportNow,
    /// Wipe every task record and in-flight bookkeeping.
    ClearAll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Pong {
        ready: bool,
    },
    Ack {
        message: String,
    },
    Rows {
        rows: Vec<ResultRow>,
        questions: usize,
    },
    Exported {
        filename: String,
        rows: usize,
    },
    Failure {
        error: String,
    },
}

impl Reply {
    pub fn failure(error: impl Into<String>) -> Self {
        Reply::Failure { error: error.into() }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Reply::Failure { .. })
    }
}

/// Progress and completion notices. Broadcast, unordered across tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Progress {
        task_id: String,
        current: usize,
        total: usize,
        message: String,
        #[serde(default)]
        question: Option<String>,
    },
    /// Per-source extraction progress inside one answer.
    SourceProgress {
        current: usize,
        total: usize,
    },
    BatchFinished {
        task_id: String,
        success: bool,
        rows: usize,
        is_stop_export: bool,
        #[serde(default)]
        error: Option<String>,
    },
    /// User-facing notification line (completion toast equivalent).
    Notice {
        title: String,
        message: String,
    },
}

/// Reply budget per command. An elapsed budget resolves to `Reply::Failure`,
/// never an indefinite hang.
pub fn reply_budget(command: &Command) -> Duration {
    match command {
        Command::Ping => Duration::from_secs(2),
        Command::StartBatch { .. } => Duration::from_secs(30),
        Command::StopBatch { .. } => Duration::from_secs(5),
        Command::Snapshot => Duration::from_secs(10),
        Command::ExportNow => Duration::from_secs(15),
        Command::ClearAll => Duration::from_secs(5),
    }
}

/// One in-flight request: the command plus its single-use reply slot.
#[derive(Debug)]
pub struct Envelope {
    pub command: Command,
    pub respond: oneshot::Sender<Reply>,
}

/// Caller-side handle. FIFO per handle; nothing is ordered across handles.
#[derive(Clone)]
pub struct Relay {
    tx: mpsc::Sender<Envelope>,
}

impl Relay {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Send a command and wait for its reply within the command's budget.
    pub async fn request(&self, command: Command) -> Reply {
        let budget = reply_budget(&command);
        let (respond, rx) = oneshot::channel();
        if self.tx.send(Envelope { command, respond }).await.is_err() {
            return Reply::failure("automation service is not running");
        }
        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Reply::failure("automation service dropped the request"),
            Err(_) => Reply::failure(format!(
                "no response within {}s — the page side may be unresponsive; \
                 try reloading the chat page or restarting the tool",
                budget.as_secs()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tags_round_trip() {
        let cmd = Command::StartBatch {
            task_id: "17_abc".into(),
            questions: vec!["q1".into()],
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""command":"start_batch""#), "{json}");
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[tokio::test]
    async fn unanswered_request_resolves_to_failure() {
        tokio::time::pause();
        let (relay, mut rx) = Relay::channel(4);
        // Service receives the envelope but never replies.
        let server = tokio::spawn(async move {
            let env = rx.recv().await.unwrap();
            // Keep the reply slot alive past the caller's budget.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(env);
        });
        let reply = relay.request(Command::Ping).await;
        assert!(reply.is_failure());
        server.abort();
    }

    #[tokio::test]
    async fn closed_service_resolves_to_failure() {
        let (relay, rx) = Relay::channel(1);
        drop(rx);
        let reply = relay.request(Command::Snapshot).await;
        assert!(reply.is_failure());
    }

    #[tokio::test]
    async fn round_trip_reply() {
        let (relay, mut rx) = Relay::channel(4);
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let reply = match env.command {
                    Command::Ping => Reply::Pong { ready: true },
                    _ => Reply::failure("unexpected"),
                };
                let _ = env.respond.send(reply);
            }
        });
        assert_eq!(relay.request(Command::Ping).await, Reply::Pong { ready: true });
    }
}
