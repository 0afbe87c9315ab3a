//! Integration tests for the batch engine against the in-memory queue and sink.
//!
//! Every test drives messages through the full peek-lock → fold → emit →
//! acknowledge path; time is passed in explicitly so nothing sleeps.

use std::time::{Duration, Instant};

use batchpoint::{AggregateDocument, BatchEngine, BatchError, MessageOutcome};
use batchpoint_core::BatchSettings;
use batchpoint_queue::{
    HandlingErrorKind, InboundMessage, MemoryQueue, MemorySink, MessageSource, QueueError,
    DISCARD_MESSAGE_TYPE,
};

const PEEK: Duration = Duration::from_millis(20);

fn settings(threshold: u32, wait_minutes: u32) -> BatchSettings {
    BatchSettings {
        messages_per_batch: threshold,
        debug_mode: false,
        class_id: "Batch".into(),
        message_type: "DTP".into(),
        wait_minutes,
    }
}

/// Enqueue, peek-lock and hand one message to the engine.
async fn deliver(
    engine: &mut BatchEngine,
    queue: &MemoryQueue,
    sink: &MemorySink,
    message: InboundMessage,
) -> Result<MessageOutcome, BatchError> {
    queue.push(message).await;
    let locked = queue.peek_lock(PEEK).await.unwrap().unwrap();
    engine.handle_message(locked, queue, sink).await
}

fn fragments(body: &str) -> Vec<String> {
    AggregateDocument::parse(body)
        .unwrap()
        .fragments()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn threshold_three_example() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let mut engine = BatchEngine::new(settings(3, 60));

    let msgs: Vec<_> = (1..=3)
        .map(|i| InboundMessage::new("A", "DTP", format!("msg{i}")))
        .collect();

    for m in &msgs[..2] {
        let outcome = deliver(&mut engine, &queue, &sink, m.clone()).await.unwrap();
        assert!(matches!(outcome, MessageOutcome::Folded { .. }));
    }
    assert_eq!(engine.store().pool_count("A"), 2);
    assert!(sink.is_empty().await);
    assert!(queue.completed().await.is_empty());

    let outcome = deliver(&mut engine, &queue, &sink, msgs[2].clone()).await.unwrap();
    let report = match outcome {
        MessageOutcome::Emitted(report) => report,
        other => panic!("third message should flush, got {other:?}"),
    };
    assert_eq!(report.messages, 3);
    assert_eq!(report.acknowledged, 3);

    let batches = sink.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].batch_class, "A");
    assert_eq!(fragments(&batches[0].body), vec!["msg1", "msg2", "msg3"]);

    let ids: Vec<_> = msgs.iter().map(|m| m.id).collect();
    assert_eq!(queue.completed().await, ids);
    assert!(engine.store().get("A").is_none());
    assert!(engine.tracker().is_empty());
}

#[tokio::test]
async fn count_trigger_flushes_only_that_class() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let mut engine = BatchEngine::new(settings(2, 60));

    deliver(&mut engine, &queue, &sink, InboundMessage::new("B", "DTP", "b1"))
        .await
        .unwrap();
    deliver(&mut engine, &queue, &sink, InboundMessage::new("A", "DTP", "a1"))
        .await
        .unwrap();
    let outcome = deliver(&mut engine, &queue, &sink, InboundMessage::new("A", "DTP", "a2"))
        .await
        .unwrap();

    assert!(matches!(outcome, MessageOutcome::Emitted(ref r) if r.class_id == "A"));
    let batches = sink.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(fragments(&batches[0].body), vec!["a1", "a2"]);

    assert_eq!(engine.store().classes(), vec!["B".to_string()]);
    assert_eq!(engine.store().pool_count("B"), 1);
    assert_eq!(queue.completed().await.len(), 2);
    assert!(engine.is_consistent());
}

#[tokio::test]
async fn time_trigger_flushes_single_message() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let start = Instant::now();
    let mut engine = BatchEngine::starting_at(settings(1000, 60), start);

    let msg = InboundMessage::new("A", "DTP", "lonely");
    deliver(&mut engine, &queue, &sink, msg.clone()).await.unwrap();

    // Not yet due.
    let early = engine
        .flush_if_due(start + Duration::from_secs(59 * 60), &queue, &sink)
        .await;
    assert!(early.is_none());
    assert!(sink.is_empty().await);

    let due = start + Duration::from_secs(61 * 60);
    let report = engine.flush_if_due(due, &queue, &sink).await.unwrap();
    assert_eq!(report.flushed.len(), 1);
    assert!(report.failed.is_empty());
    assert_eq!(report.acknowledged(), 1);
    assert_eq!(queue.completed().await, vec![msg.id]);
    assert!(engine.store().is_empty());

    // The clock restarted at the flush.
    assert_eq!(engine.scheduler().last_flush(), due);
    assert_eq!(engine.stats().time_flushes, 1);
}

#[tokio::test]
async fn time_flush_with_nothing_accumulated_resets_clock() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let start = Instant::now();
    let mut engine = BatchEngine::starting_at(settings(10, 1), start);

    let due = start + Duration::from_secs(90);
    let report = engine.flush_if_due(due, &queue, &sink).await.unwrap();
    assert!(report.flushed.is_empty());
    assert!(sink.is_empty().await);
    assert_eq!(engine.scheduler().last_flush(), due);
}

#[tokio::test]
async fn correlation_stays_consistent_across_folds_and_flushes() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let start = Instant::now();
    let mut engine = BatchEngine::starting_at(settings(4, 5), start);

    let classes = ["A", "B", "C", "A", "A", "B", "C", "A", "B", "A", "C", "C", "C"];
    for (i, class) in classes.iter().enumerate() {
        deliver(
            &mut engine,
            &queue,
            &sink,
            InboundMessage::new(*class, "DTP", format!("{class}{i}")),
        )
        .await
        .unwrap();
        assert!(engine.is_consistent(), "inconsistent after message {i}");

        for class_id in engine.store().classes() {
            let doc = engine.store().get(&class_id).unwrap();
            assert_eq!(engine.tracker().pending_count(&doc.id), doc.count);
        }
    }

    engine
        .flush_if_due(start + Duration::from_secs(6 * 60), &queue, &sink)
        .await
        .unwrap();
    assert!(engine.is_consistent());
    assert!(engine.tracker().is_empty());
    assert_eq!(queue.completed().await.len(), classes.len());

    let total: usize = sink
        .batches()
        .await
        .iter()
        .map(|b| fragments(&b.body).len())
        .sum();
    assert_eq!(total, classes.len());
}

#[tokio::test]
async fn one_failed_acknowledgment_is_isolated() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let mut engine = BatchEngine::new(settings(3, 60));

    let msgs: Vec<_> = (0..3)
        .map(|i| InboundMessage::new("A", "DTP", format!("m{i}")))
        .collect();
    queue.fail_completion_of(msgs[1].id).await;

    let mut last = None;
    for m in &msgs {
        last = Some(deliver(&mut engine, &queue, &sink, m.clone()).await.unwrap());
    }
    let Some(MessageOutcome::Emitted(report)) = last else {
        panic!("expected a flush on the third message");
    };
    assert_eq!(report.acknowledged, 2);
    assert_eq!(report.dead_lettered, 1);

    assert_eq!(queue.completed().await, vec![msgs[0].id, msgs[2].id]);
    let dead = queue.dead_lettered().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, msgs[1].id);
    assert_eq!(dead[0].kind, HandlingErrorKind::AckFailed);

    assert!(engine.tracker().is_empty());
    assert_eq!(engine.stats().ack_failures, 1);
}

#[tokio::test]
async fn rejected_hand_off_loses_nothing() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let mut engine = BatchEngine::new(settings(2, 60));

    let first = InboundMessage::new("A", "DTP", "one");
    let second = InboundMessage::new("A", "DTP", "two");
    let third = InboundMessage::new("A", "DTP", "three");

    deliver(&mut engine, &queue, &sink, first.clone()).await.unwrap();
    sink.reject_next(1).await;
    let err = deliver(&mut engine, &queue, &sink, second.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BatchError::HandOff { source: QueueError::Rejected(_), .. }
    ));
    assert!(queue.completed().await.is_empty());
    assert_eq!(engine.store().pool_count("A"), 2);
    assert!(engine.is_consistent());

    // Counter is still past the threshold, so the next fold retries.
    let outcome = deliver(&mut engine, &queue, &sink, third.clone()).await.unwrap();
    let report = match outcome {
        MessageOutcome::Emitted(report) => report,
        other => panic!("retry should emit, got {other:?}"),
    };
    assert_eq!(report.acknowledged, 3);

    let batches = sink.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(fragments(&batches[0].body), vec!["one", "two", "three"]);
    assert_eq!(
        queue.completed().await,
        vec![first.id, second.id, third.id]
    );
}

#[tokio::test]
async fn rejected_time_flush_is_retried_next_interval() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let start = Instant::now();
    let mut engine = BatchEngine::starting_at(settings(100, 1), start);

    let msg = InboundMessage::new("A", "DTP", "x");
    deliver(&mut engine, &queue, &sink, msg.clone()).await.unwrap();

    sink.reject_next(1).await;
    let first = start + Duration::from_secs(61);
    let report = engine.flush_if_due(first, &queue, &sink).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(engine.scheduler().last_flush(), first);
    assert_eq!(engine.store().pool_count("A"), 1);

    let second = first + Duration::from_secs(61);
    let report = engine.flush_if_due(second, &queue, &sink).await.unwrap();
    assert_eq!(report.flushed.len(), 1);
    assert_eq!(queue.completed().await, vec![msg.id]);
}

#[tokio::test]
async fn discard_marker_never_reaches_a_batch() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let mut engine = BatchEngine::new(settings(2, 60));

    deliver(&mut engine, &queue, &sink, InboundMessage::new("A", "DTP", "real"))
        .await
        .unwrap();
    let marker = InboundMessage::new("A", DISCARD_MESSAGE_TYPE, "drop me");
    let outcome = deliver(&mut engine, &queue, &sink, marker.clone()).await.unwrap();
    assert!(matches!(outcome, MessageOutcome::Discarded(id) if id == marker.id));

    // Acknowledged at once, counter untouched.
    assert_eq!(queue.completed().await, vec![marker.id]);
    assert_eq!(engine.store().pool_count("A"), 1);
    assert_eq!(engine.tracker().batch_of(&marker.id), None);

    deliver(&mut engine, &queue, &sink, InboundMessage::new("A", "DTP", "real2"))
        .await
        .unwrap();
    let batches = sink.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(fragments(&batches[0].body), vec!["real", "real2"]);
}

#[tokio::test]
async fn undecodable_message_is_dead_lettered_and_batching_continues() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let mut engine = BatchEngine::new(settings(2, 60));

    deliver(&mut engine, &queue, &sink, InboundMessage::new("A", "DTP", "good"))
        .await
        .unwrap();
    let bad = InboundMessage::new("A", "DTP", vec![0xff]);
    let outcome = deliver(&mut engine, &queue, &sink, bad.clone()).await.unwrap();
    assert!(matches!(outcome, MessageOutcome::Rejected { id, .. } if id == bad.id));
    assert_eq!(engine.store().pool_count("A"), 1);

    let dead = queue.dead_lettered().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].kind, HandlingErrorKind::InvalidBody);
    assert!(engine.is_consistent());
}

#[tokio::test]
async fn initialize_drops_unacknowledged_state() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let mut engine = BatchEngine::new(settings(10, 60));

    deliver(&mut engine, &queue, &sink, InboundMessage::new("A", "DTP", "a"))
        .await
        .unwrap();
    deliver(&mut engine, &queue, &sink, InboundMessage::new("B", "DTP", "b"))
        .await
        .unwrap();

    engine.initialize(Instant::now());
    assert!(engine.store().is_empty());
    assert!(engine.tracker().is_empty());
    // Nothing was acknowledged; both stay locked for redelivery.
    assert!(queue.completed().await.is_empty());
    assert_eq!(queue.locked_len().await, 2);
}

#[tokio::test]
async fn redelivery_of_open_message_is_acknowledged_once() {
    let queue = MemoryQueue::new();
    let sink = MemorySink::new();
    let start = Instant::now();
    let mut engine = BatchEngine::starting_at(settings(10, 5), start);

    let msg = InboundMessage::new("A", "DTP", "body");
    deliver(&mut engine, &queue, &sink, msg.clone()).await.unwrap();
    // Lock expired upstream and the same message comes back.
    let outcome = deliver(&mut engine, &queue, &sink, msg.clone()).await.unwrap();
    assert!(matches!(
        outcome,
        MessageOutcome::Folded { ref folded, .. } if folded.count == 1
    ));
    assert!(engine.is_consistent());

    let report = engine
        .flush_if_due(start + Duration::from_secs(6 * 60), &queue, &sink)
        .await
        .unwrap();
    assert_eq!(report.flushed.len(), 1);
    assert_eq!(report.flushed[0].messages, 1);
    assert_eq!(report.flushed[0].acknowledged, 1);
    assert_eq!(report.flushed[0].dead_lettered, 0);

    let batches = sink.batches().await;
    assert_eq!(fragments(&batches[0].body), vec!["body"]);
    assert_eq!(queue.completed().await, vec![msg.id]);
    assert!(queue.dead_lettered().await.is_empty());
}
