//! Batch driver state-machine tests against the scripted chat surface.

mod common;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use colloquy::driver::{BatchDriver, DriverError, Timings};
use colloquy::types::BatchDisposition;
use common::{questions, two_sources, Script, ScriptedSurface};

fn driver(surface: ScriptedSurface) -> BatchDriver<ScriptedSurface> {
    let (events, _) = broadcast::channel(64);
    BatchDriver::new(Arc::new(surface), Timings::rapid(), events)
}

#[tokio::test]
async fn completed_run_yields_one_row_per_sourceless_question() {
    let driver = driver(ScriptedSurface::answering(3));
    let outcome = driver
        .run("t1", &questions(3), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.disposition, BatchDisposition::Completed);
    assert_eq!(outcome.rows.len(), 3);
    for (i, row) in outcome.rows.iter().enumerate() {
        assert_eq!(row.question, format!("question {}", i + 1));
        assert!(row.source_url.is_empty());
        assert_eq!(row.sequence_index, None);
    }
}

#[tokio::test]
async fn cited_sources_multiply_rows_sharing_question_and_answer() {
    let driver = driver(ScriptedSurface::new(vec![Script::Answer {
        sources: two_sources(),
    }]));
    let outcome = driver
        .run("t2", &questions(1), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.disposition, BatchDisposition::Completed);
    assert_eq!(outcome.rows.len(), 2);
    assert_eq!(outcome.rows[0].question, outcome.rows[1].question);
    assert_eq!(outcome.rows[0].answer, outcome.rows[1].answer);
    assert_eq!(outcome.rows[0].sequence_index, Some(1));
    assert_eq!(outcome.rows[1].sequence_index, Some(2));
    assert_ne!(outcome.rows[0].source_url, outcome.rows[1].source_url);
}

#[tokio::test]
async fn per_question_failure_records_placeholder_row_and_continues() {
    let driver = driver(ScriptedSurface::new(vec![
        Script::Answer { sources: vec![] },
        Script::SendIgnored,
        Script::Answer { sources: vec![] },
    ]));
    let outcome = driver
        .run("t3", &questions(3), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.disposition, BatchDisposition::Completed);
    // Row count never drops below the question count.
    assert_eq!(outcome.rows.len(), 3);
    assert!(outcome.rows[1].answer.starts_with("processing failed: "));
    assert_eq!(outcome.rows[2].question, "question 3");
}

#[tokio::test]
async fn collection_failure_becomes_error_row() {
    let driver = driver(ScriptedSurface::new(vec![
        Script::CollectFails,
        Script::Answer { sources: vec![] },
    ]));
    let outcome = driver
        .run("t4", &questions(2), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.rows.len(), 2);
    assert!(outcome.rows[0].answer.contains("scripted scrape failure"));
    assert_eq!(outcome.rows[1].answer, "scripted answer");
}

#[tokio::test]
async fn unverified_thread_reset_aborts_the_remaining_batch() {
    let mut surface = ScriptedSurface::answering(3);
    surface.resets_before_failure = Some(0); // first reset already unverified
    let driver = driver(surface);
    let outcome = driver
        .run("t5", &questions(3), CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome.disposition, BatchDisposition::Aborted(_)));
    assert_eq!(outcome.rows.len(), 1, "only the first question's rows survive");
}

#[tokio::test]
async fn stop_after_two_of_five_yields_the_prefix() {
    let token = CancellationToken::new();
    let mut surface = ScriptedSurface::answering(5);
    surface.cancel_on_send = Some((3, token.clone()));
    let driver = driver(surface);

    let outcome = driver.run("t6", &questions(5), token).await.unwrap();

    assert_eq!(outcome.disposition, BatchDisposition::Stopped);
    let asked: Vec<&str> = outcome.rows.iter().map(|r| r.question.as_str()).collect();
    assert_eq!(asked, ["question 1", "question 2"]);
    // The snapshot after the run matches the stopped outcome exactly.
    assert_eq!(driver.snapshot(), outcome.rows);
}

#[tokio::test]
async fn second_concurrent_run_is_rejected() {
    let mut surface = ScriptedSurface::answering(1);
    surface.collect_delay = std::time::Duration::from_millis(100);
    let driver = Arc::new(driver(surface));

    let first = {
        let driver = Arc::clone(&driver);
        tokio::spawn(async move {
            driver.run("t7", &questions(1), CancellationToken::new()).await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let second = driver.run("t8", &questions(1), CancellationToken::new()).await;
    assert!(matches!(second, Err(DriverError::AlreadyRunning)));

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.disposition, BatchDisposition::Completed);
}
