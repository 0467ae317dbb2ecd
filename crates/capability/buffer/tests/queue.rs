use edge_buffer::{BufferError, OverflowPolicy, QueueConfig, StoreAndForwardQueue};
use std::sync::Arc;
use std::time::Duration;

fn payload(n: usize) -> Vec<u8> {
    vec![b'x'; n]
}

#[test]
fn drains_in_fifo_order_and_acks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = StoreAndForwardQueue::open(QueueConfig::new(dir.path())).expect("open");
    for i in 0..5u8 {
        queue
            .enqueue("spBv1.0/l1/DDATA/n1/m1", vec![i], 1)
            .expect("enqueue");
    }

    let batch = queue.drain_in_order(3).expect("drain");
    assert_eq!(
        batch.iter().map(|e| e.payload[0]).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    // 未确认前条目仍在队列中。
    assert_eq!(queue.len(), 5);

    assert!(queue.ack(batch[0].id).expect("ack"));
    assert!(!queue.ack(batch[0].id).expect("double ack"));
    assert_eq!(queue.len(), 4);
    assert_eq!(queue.drain_in_order(1).expect("drain")[0].payload, vec![1]);
}

#[test]
fn survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let queue = StoreAndForwardQueue::open(QueueConfig::new(dir.path())).expect("open");
        let a = queue.enqueue("t/a", payload(10), 1).expect("a");
        queue.enqueue("t/b", payload(20), 1).expect("b");
        queue.enqueue("t/a", payload(30), 1).expect("c");
        queue.ack(a.id).expect("ack");
        queue.sync().expect("sync");
    }

    let queue = StoreAndForwardQueue::open(QueueConfig::new(dir.path())).expect("reopen");
    let entries = queue.drain_in_order(10).expect("drain");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].topic, "t/b");
    assert_eq!(entries[1].payload.len(), 30);
    assert_eq!(queue.bytes(), (20 + 3 + 30 + 3) as u64);

    // 新 id 延续旧序列，顺序不倒退。
    let next = queue.enqueue("t/c", payload(1), 1).expect("next");
    assert!(next.id > entries[1].id);
}

#[test]
fn reject_newest_at_watermark() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = QueueConfig::new(dir.path())
        .with_watermark(100)
        .with_policy(OverflowPolicy::RejectNewest);
    let queue = StoreAndForwardQueue::open(config).expect("open");
    queue.enqueue("t", payload(49), 1).expect("first");
    queue.enqueue("t", payload(49), 1).expect("second");
    let err = queue.enqueue("t", payload(1), 1).expect_err("full");
    assert!(matches!(err, BufferError::Full { .. }));
    assert_eq!(queue.len(), 2);
    assert!(queue.bytes() <= 100);
}

#[test]
fn evict_oldest_keeps_newest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = QueueConfig::new(dir.path())
        .with_watermark(100)
        .with_policy(OverflowPolicy::EvictOldest);
    let queue = StoreAndForwardQueue::open(config).expect("open");
    let first = queue.enqueue("t", payload(39), 1).expect("first");
    queue.enqueue("t", payload(39), 1).expect("second");
    let outcome = queue.enqueue("t", payload(39), 1).expect("third");
    assert_eq!(outcome.evicted, vec![first.id]);
    assert_eq!(queue.len(), 2);
    assert!(queue.bytes() <= 100);

    let too_big = queue.enqueue("t", payload(200), 1).expect_err("too large");
    assert!(matches!(too_big, BufferError::TooLarge(_)));
}

#[test]
fn compaction_keeps_live_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = QueueConfig::new(dir.path()).with_compact_min_dead(8);
    {
        let queue = StoreAndForwardQueue::open(config.clone()).expect("open");
        for i in 0..20u8 {
            let outcome = queue.enqueue("t", vec![i], 1).expect("enqueue");
            if i < 18 {
                queue.ack(outcome.id).expect("ack");
            }
        }
    }
    let log_len = std::fs::read_to_string(dir.path().join("queue.log"))
        .expect("log")
        .lines()
        .count();
    assert!(log_len < 20, "log should have been compacted, has {log_len} lines");

    let queue = StoreAndForwardQueue::open(config).expect("reopen");
    let entries = queue.drain_in_order(10).expect("drain");
    assert_eq!(
        entries.iter().map(|e| e.payload[0]).collect::<Vec<_>>(),
        vec![18, 19]
    );
}

#[tokio::test]
async fn consumer_wakes_on_enqueue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = Arc::new(StoreAndForwardQueue::open(QueueConfig::new(dir.path())).expect("open"));
    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.wait_nonempty().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.enqueue("t", payload(1), 1).expect("enqueue");
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("woken")
        .expect("join");
}
