//! End-to-end service tests: relay commands in, task records and CSV files
//! out, with the scripted surface standing in for the live page.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use colloquy::core::config::ColloquyConfig;
use colloquy::export::CsvExporter;
use colloquy::types::{new_task_id, ResultRow, TaskRecord, TaskStatus};
use colloquy::{AppState, BatchService, Command, Event, Relay, Reply, Timings};
use common::{questions, ScriptedSurface};

fn test_config() -> ColloquyConfig {
    let mut config = ColloquyConfig::default();
    // Keep the stop grace short so stop tests do not wait two real seconds.
    config.automation.stop_grace_ms = Some(10);
    config
}

fn start_service(surface: ScriptedSurface, dir: &std::path::Path) -> (AppState, Relay) {
    let state = AppState::ephemeral(test_config());
    let exporter = CsvExporter::new(dir.join("out"), dir.join("fb"));
    let service = BatchService::new(
        state.clone(),
        Arc::new(surface),
        Timings::rapid(),
        exporter,
        "ctx-test",
    );
    let (relay, rx) = Relay::channel(16);
    tokio::spawn(service.serve(rx));
    (state, relay)
}

async fn wait_for_finished(
    events: &mut broadcast::Receiver<Event>,
    task_id: &str,
) -> (bool, usize) {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(Event::BatchFinished { task_id: id, success, rows, .. })) if id == task_id => {
                return (success, rows);
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => panic!("event channel closed: {e}"),
            Err(_) => panic!("timed out waiting for batch completion"),
        }
    }
}

fn csv_files(dir: &std::path::Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".csv"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn full_batch_completes_and_exports_a_csv() {
    let dir = tempfile::tempdir().unwrap();
    let (state, relay) = start_service(ScriptedSurface::answering(2), dir.path());
    let mut events = state.subscribe();

    let task_id = new_task_id();
    let reply = relay
        .request(Command::StartBatch {
            task_id: task_id.clone(),
            questions: questions(2),
        })
        .await;
    assert!(matches!(reply, Reply::Ack { .. }), "start reply: {reply:?}");

    let (success, rows) = wait_for_finished(&mut events, &task_id).await;
    assert!(success);
    assert_eq!(rows, 2);

    let record = state.registry.get_state(&task_id).expect("record retained");
    assert_eq!(record.status, TaskStatus::Completed);
    let filename = record.filename.expect("export filename stamped");
    assert!(filename.starts_with("qa_batch_"), "{filename}");

    let files = csv_files(&dir.path().join("out"));
    assert_eq!(files, vec![filename]);
}

#[tokio::test]
async fn ping_reports_surface_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, relay) = start_service(ScriptedSurface::answering(0), dir.path());
    assert_eq!(relay.request(Command::Ping).await, Reply::Pong { ready: true });
}

#[tokio::test]
async fn second_start_while_a_run_is_active_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut surface = ScriptedSurface::answering(1);
    surface.collect_delay = Duration::from_millis(100);
    let (state, relay) = start_service(surface, dir.path());
    let mut events = state.subscribe();

    let first_id = new_task_id();
    let reply = relay
        .request(Command::StartBatch {
            task_id: first_id.clone(),
            questions: questions(1),
        })
        .await;
    assert!(matches!(reply, Reply::Ack { .. }));

    let reply = relay
        .request(Command::StartBatch {
            task_id: new_task_id(),
            questions: questions(1),
        })
        .await;
    match reply {
        Reply::Failure { error } => assert!(error.contains("already active"), "{error}"),
        other => panic!("expected rejection, got {other:?}"),
    }

    wait_for_finished(&mut events, &first_id).await;
}

#[tokio::test]
async fn stop_mid_run_exports_the_collected_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let mut surface = ScriptedSurface::answering(5);
    surface.collect_delay = Duration::from_millis(50);
    let (state, relay) = start_service(surface, dir.path());

    let task_id = new_task_id();
    relay
        .request(Command::StartBatch {
            task_id: task_id.clone(),
            questions: questions(5),
        })
        .await;

    // Let at least two questions finish, then stop.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Reply::Rows { rows, .. } = relay.request(Command::Snapshot).await {
            if rows.len() >= 2 {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "run never progressed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let exported_rows = match relay.request(Command::StopBatch { task_id: task_id.clone() }).await {
        Reply::Exported { rows, filename } => {
            assert!(filename.starts_with("qa_batch_stopped_"), "{filename}");
            rows
        }
        other => panic!("expected a stop export, got {other:?}"),
    };
    assert!(exported_rows >= 2);

    // Exported rows are a strict prefix of the question sequence.
    let record = state.registry.get_state(&task_id).expect("record retained");
    assert_eq!(record.status, TaskStatus::StoppedWithExport);
    let asked: Vec<&str> = record.rows.iter().map(|r| r.question.as_str()).collect();
    let expected: Vec<String> = questions(5);
    assert!(asked.len() < 5, "stop landed before the batch finished");
    for (i, q) in asked.iter().enumerate() {
        assert_eq!(*q, expected[i]);
    }
}

#[tokio::test]
async fn export_now_falls_back_to_persisted_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (state, relay) = start_service(ScriptedSurface::answering(0), dir.path());

    let mut record = TaskRecord::new("old-task", "ctx-test", TaskStatus::Failed);
    record.rows = vec![
        ResultRow::bare("kept q1", "a1", "t"),
        ResultRow::bare("kept q2", "a2", "t"),
    ];
    state.registry.save_state(record);

    match relay.request(Command::ExportNow).await {
        Reply::Exported { rows, filename } => {
            assert_eq!(rows, 2);
            assert!(filename.starts_with("qa_manual_export_"), "{filename}");
        }
        other => panic!("expected an export, got {other:?}"),
    }
    assert_eq!(csv_files(&dir.path().join("out")).len(), 1);
}

#[tokio::test]
async fn export_now_with_nothing_collected_writes_header_only() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, relay) = start_service(ScriptedSurface::answering(0), dir.path());

    match relay.request(Command::ExportNow).await {
        Reply::Exported { rows, .. } => assert_eq!(rows, 0),
        other => panic!("expected an export, got {other:?}"),
    }
}

#[tokio::test]
async fn clear_all_wipes_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let (state, relay) = start_service(ScriptedSurface::answering(0), dir.path());

    state
        .registry
        .save_state(TaskRecord::new("a", "ctx-test", TaskStatus::Running));
    state
        .registry
        .save_state(TaskRecord::new("b", "ctx-test", TaskStatus::Waiting));

    assert!(matches!(relay.request(Command::ClearAll).await, Reply::Ack { .. }));
    assert!(state.registry.list_active().is_empty());
    assert!(state.registry.get_state("a").is_none());
    assert!(state.registry.get_state("b").is_none());
}

#[tokio::test]
async fn malformed_upload_is_an_input_error_and_no_task_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _relay) = start_service(ScriptedSurface::answering(0), dir.path());

    // Header with an empty question column: intake rejects it before any
    // start command exists to send.
    let parsed = colloquy::intake::parse_questions("question,notes\n,\n ,x\n");
    assert!(parsed.is_err());
    assert!(state.registry.list_active().is_empty());
}
