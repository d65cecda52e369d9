mod common;

use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};

use common::*;
use kafka_pipeline::config::CommitPolicy;
use kafka_pipeline::consumer::state::PipelineState;
use kafka_pipeline::error::{ConfigError, PipelineError};
use kafka_pipeline::KafkaConsumer;

fn ids(range: std::ops::RangeInclusive<i64>) -> Vec<String> {
    let mut ids: Vec<String> = range.map(|i| i.to_string()).collect();
    ids.sort();
    ids
}

// ── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn start_blocks_until_the_first_session_is_ready() {
    let handler = RecordingHandler::open();
    let harness = Harness::start(settings(2, CommitPolicy::OnDispatch), handler);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!harness.runner.is_finished());
    assert!(harness.consumer.current_session().is_none());
    assert_eq!(harness.consumer.state(), PipelineState::Running);

    let _session = harness.assign(&[0, 1]).await;
    let session = harness.consumer.current_session().unwrap();
    assert!(session.is_ready());
    assert_eq!(session.partitions().len(), 2);

    // Still running until closed
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!harness.runner.is_finished());

    harness.consumer.close().await.unwrap();
    tokio::time::timeout(WAIT_TIMEOUT, harness.runner)
        .await
        .expect("start should return after close")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn second_close_is_rejected() {
    let handler = RecordingHandler::open();
    let harness = Harness::start(settings(1, CommitPolicy::OnDispatch), handler);
    let _session = harness.assign(&[0]).await;

    harness.consumer.close().await.unwrap();
    assert!(matches!(
        harness.consumer.close().await,
        Err(PipelineError::AlreadyClosed)
    ));
    assert_eq!(harness.client.close_calls(), 1);
    assert_eq!(harness.consumer.state(), PipelineState::Closed);
}

#[tokio::test]
async fn close_before_start_releases_the_client() {
    let (client, _controller) = FakeGroupClient::new();
    let consumer = KafkaConsumer::with_client(
        settings(1, CommitPolicy::OnDispatch),
        RecordingHandler::open(),
        client.clone(),
    )
    .unwrap();

    consumer.close().await.unwrap();
    assert_eq!(consumer.state(), PipelineState::Closed);
    assert_eq!(client.close_calls(), 1);

    assert!(matches!(
        consumer.start().await,
        Err(PipelineError::InvalidTransition {
            from: PipelineState::Closed,
            to: PipelineState::Running,
        })
    ));
}

#[tokio::test]
async fn zero_workers_is_rejected_at_construction() {
    let (client, _controller) = FakeGroupClient::new();
    let mut settings = settings(1, CommitPolicy::OnDispatch);
    settings.num_workers = 0;

    let result = KafkaConsumer::with_client(settings, RecordingHandler::open(), client);
    assert!(matches!(
        result,
        Err(PipelineError::Config(ConfigError::InvalidWorkerCount(0)))
    ));
}

// ── Draining ────────────────────────────────────────────────────

#[tokio::test]
async fn close_drains_every_buffered_message_exactly_once() {
    let (gate, handler) = RecordingHandler::gated();
    let harness = Harness::start(settings(2, CommitPolicy::OnDispatch), handler.clone());
    let session = harness.assign(&[0]).await;

    for id in 1..=5 {
        session.send(0, id - 1, &id.to_string()).await;
    }
    let client = harness.client.clone();
    eventually(|| client.commits().len() == 5).await;
    // Resuming starts right after the last committed record
    assert_eq!(client.committed_position(0), Some(5));

    let closer = tokio::spawn({
        let consumer = harness.consumer.clone();
        async move { consumer.close().await }
    });

    // The broker connection goes away while the workers are still busy
    let client = harness.client.clone();
    eventually(|| client.close_calls() == 1).await;
    assert!(handler.handled().is_empty());
    assert!(!closer.is_finished());
    assert_eq!(harness.consumer.state(), PipelineState::Draining);

    gate.open();
    tokio::time::timeout(WAIT_TIMEOUT, closer)
        .await
        .expect("close should finish once handlers complete")
        .unwrap()
        .unwrap();

    assert_eq!(handler.handled_sorted(), ids(1..=5));
    assert_eq!(harness.consumer.queued(), 0);
    assert_eq!(harness.consumer.state(), PipelineState::Closed);
}

#[tokio::test]
async fn backpressure_bounds_the_queue() {
    let (gate, handler) = RecordingHandler::gated();
    let harness = Harness::start(settings(1, CommitPolicy::OnDispatch), handler.clone());
    assert_eq!(harness.consumer.queue_capacity(), 8);
    let session = harness.assign(&[0]).await;

    for offset in 0..20 {
        session.send(0, offset, &offset.to_string()).await;
    }

    // One message held by the worker, eight buffered, the reader waiting on the next one
    let started = handler.clone();
    let client = harness.client.clone();
    eventually(|| started.started() == 1 && client.commits().len() == 9).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.consumer.queued(), 8);
    assert_eq!(handler.started(), 1);
    assert_eq!(harness.client.commits().len(), 9);

    gate.open();
    let handled = handler.clone();
    eventually(|| handled.handled().len() == 20).await;
    assert!(harness.consumer.queued() <= 8);

    harness.consumer.close().await.unwrap();
}

// ── Commit policy ───────────────────────────────────────────────

#[tokio::test]
async fn dispatch_commit_happens_before_the_handler_finishes() {
    let (gate, handler) = RecordingHandler::gated();
    let harness = Harness::start(settings(1, CommitPolicy::OnDispatch), handler.clone());
    let session = harness.assign(&[0]).await;

    session.send(0, 41, "in-flight").await;

    let client = harness.client.clone();
    eventually(|| client.committed_offsets() == vec![41]).await;
    let started = handler.clone();
    eventually(|| started.started() == 1).await;

    // A crash at this point loses the message: the group already considers it consumed
    // while the handler never completed.
    assert!(handler.handled().is_empty());

    gate.open();
    harness.consumer.close().await.unwrap();
    assert_eq!(handler.handled(), vec!["in-flight".to_string()]);
}

#[tokio::test]
async fn after_handle_commit_waits_for_success() {
    let handler = RecordingHandler::failing_on("2");
    let harness = Harness::start(settings(1, CommitPolicy::AfterHandle), handler.clone());
    let session = harness.assign(&[0]).await;

    for offset in 0..4 {
        session.send(0, offset, &(offset + 1).to_string()).await;
    }

    let handled = handler.clone();
    eventually(|| handled.handled().len() == 3).await;
    harness.consumer.close().await.unwrap();

    // Offset 1 carried "2", which the handler rejected
    assert_eq!(harness.client.committed_offsets(), vec![0, 2, 3]);
}

#[tokio::test]
async fn after_handle_commit_is_not_made_while_handling() {
    let (gate, handler) = RecordingHandler::gated();
    let harness = Harness::start(settings(1, CommitPolicy::AfterHandle), handler.clone());
    let session = harness.assign(&[0]).await;

    session.send(0, 7, "slow").await;
    let started = handler.clone();
    eventually(|| started.started() == 1).await;
    assert!(harness.client.commits().is_empty());

    gate.open();
    let client = harness.client.clone();
    eventually(|| client.committed_offsets() == vec![7]).await;
    harness.consumer.close().await.unwrap();
}

// ── Fault isolation ─────────────────────────────────────────────

#[tokio::test]
async fn a_panicking_handler_does_not_stop_the_worker() {
    let handler = RecordingHandler::panicking_on("2");
    let harness = Harness::start(settings(1, CommitPolicy::OnDispatch), handler.clone());
    let session = harness.assign(&[0]).await;

    for offset in 0..4 {
        session.send(0, offset, &(offset + 1).to_string()).await;
    }

    let handled = handler.clone();
    eventually(|| handled.handled().len() == 3).await;
    assert_eq!(handler.handled(), vec!["1", "3", "4"]);

    harness.consumer.close().await.unwrap();
}

#[tokio::test]
async fn consume_errors_are_retried() {
    let handler = RecordingHandler::open();
    let harness = Harness::start(settings(1, CommitPolicy::OnDispatch), handler.clone());

    harness.controller.fail(KafkaError::MessageConsumption(
        RDKafkaErrorCode::BrokerTransportFailure,
    ));
    harness.controller.fail(KafkaError::MessageConsumption(
        RDKafkaErrorCode::BrokerTransportFailure,
    ));
    let session = harness.assign(&[0]).await;
    assert_eq!(harness.consumer.current_session().unwrap().generation(), 1);

    session.send(0, 0, "after-errors").await;
    let handled = handler.clone();
    eventually(|| handled.handled() == vec!["after-errors".to_string()]).await;

    harness.consumer.close().await.unwrap();
}

// ── Ordering and rebalances ─────────────────────────────────────

#[tokio::test]
async fn single_worker_preserves_partition_order() {
    let handler = RecordingHandler::open();
    let harness = Harness::start(settings(1, CommitPolicy::OnDispatch), handler.clone());
    let session = harness.assign(&[3]).await;

    for offset in 0..30 {
        session.send(3, offset, &format!("{offset:02}")).await;
    }

    let handled = handler.clone();
    eventually(|| handled.handled().len() == 30).await;
    let expected: Vec<String> = (0..30).map(|o| format!("{o:02}")).collect();
    assert_eq!(handler.handled(), expected);

    harness.consumer.close().await.unwrap();
}

#[tokio::test]
async fn rebalance_starts_a_fresh_session() {
    let handler = RecordingHandler::open();
    let harness = Harness::start(settings(2, CommitPolicy::OnDispatch), handler.clone());

    let first = harness.assign(&[0]).await;
    let first_session = harness.consumer.current_session().unwrap();
    first.send(0, 0, "before").await;
    let handled = handler.clone();
    eventually(|| handled.handled().len() == 1).await;

    first.revoke();
    let second = harness.controller.assign(&[1]);

    let consumer = harness.consumer.clone();
    eventually(|| {
        consumer
            .current_session()
            .is_some_and(|s| s.generation() == 2 && s.is_ready())
    })
    .await;
    assert!(first_session.done().is_cancelled());

    let second_session = harness.consumer.current_session().unwrap();
    assert_eq!(
        second_session.partitions(),
        &[kafka_pipeline::Partition::new(TOPIC, 1)]
    );

    second.send(1, 0, "after").await;
    let handled = handler.clone();
    eventually(|| handled.handled().len() == 2).await;

    harness.consumer.close().await.unwrap();
    assert_eq!(handler.handled_sorted(), vec!["after", "before"]);
}

#[tokio::test]
async fn nothing_is_admitted_after_close() {
    let handler = RecordingHandler::open();
    let harness = Harness::start(settings(1, CommitPolicy::OnDispatch), handler.clone());
    let session = harness.assign(&[0]).await;

    session.send(0, 0, "kept").await;
    let handled = handler.clone();
    eventually(|| handled.handled().len() == 1).await;

    harness.consumer.close().await.unwrap();

    // The claim reader is gone, so the record cannot reach the handler
    assert!(session.claims[&0].send(record(0, 1, "late")).await.is_err());
    assert_eq!(handler.handled(), vec!["kept".to_string()]);
}
