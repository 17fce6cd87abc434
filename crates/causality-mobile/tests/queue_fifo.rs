//! Durable queue semantics: FIFO order, idempotency-key dedup, capacity
//! eviction, retry bookkeeping, and reset.

use causality_mobile::queue::PersistentQueue;

fn queue(capacity: usize) -> PersistentQueue {
    PersistentQueue::open_in_memory(capacity).expect("open queue")
}

#[test]
fn fifo_with_duplicate_key_suppression() {
    let queue = queue(10);
    assert!(queue.enqueue("{\"n\":1}", "k1").unwrap());
    assert!(queue.enqueue("{\"n\":2}", "k2").unwrap());
    assert!(queue.enqueue("{\"n\":3}", "k3").unwrap());
    // Re-enqueue of k1 is silently ignored.
    assert!(!queue.enqueue("{\"n\":1,\"dup\":true}", "k1").unwrap());

    let rows = queue.dequeue_batch(10).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].event_json, "{\"n\":1}");
    assert_eq!(rows[1].event_json, "{\"n\":2}");
    assert_eq!(rows[2].event_json, "{\"n\":3}");
}

#[test]
fn dequeue_does_not_delete() {
    let queue = queue(10);
    queue.enqueue("{}", "k1").unwrap();
    assert_eq!(queue.dequeue_batch(10).unwrap().len(), 1);
    assert_eq!(queue.count().unwrap(), 1);
}

#[test]
fn capacity_eviction_drops_the_oldest() {
    let capacity = 5;
    let queue = queue(capacity);
    for i in 0..=capacity {
        queue
            .enqueue(&format!("{{\"n\":{}}}", i), &format!("k{}", i))
            .unwrap();
    }

    assert_eq!(queue.count().unwrap(), capacity as i64);
    let rows = queue.dequeue_batch(10).unwrap();
    // k0 was evicted to make room for k5.
    assert!(rows.iter().all(|r| r.idempotency_key != "k0"));
    assert_eq!(rows[0].idempotency_key, "k1");
    assert_eq!(rows.last().unwrap().idempotency_key, "k5");
}

#[test]
fn duplicate_key_at_capacity_is_a_true_no_op() {
    let queue = queue(3);
    queue.enqueue("{\"n\":1}", "k1").unwrap();
    queue.enqueue("{\"n\":2}", "k2").unwrap();
    queue.enqueue("{\"n\":3}", "k3").unwrap();

    // k1 is both a duplicate and the oldest row; the re-enqueue must not
    // evict it and must not replace its content or FIFO position.
    assert!(!queue.enqueue("{\"n\":1,\"dup\":true}", "k1").unwrap());

    assert_eq!(queue.count().unwrap(), 3);
    let rows = queue.dequeue_batch(10).unwrap();
    assert_eq!(rows[0].idempotency_key, "k1");
    assert_eq!(rows[0].event_json, "{\"n\":1}");
    assert_eq!(rows[1].idempotency_key, "k2");
    assert_eq!(rows[2].idempotency_key, "k3");

    // A genuinely new key at capacity still evicts the oldest.
    assert!(queue.enqueue("{\"n\":4}", "k4").unwrap());
    let rows = queue.dequeue_batch(10).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].idempotency_key, "k2");
    assert_eq!(rows[2].idempotency_key, "k4");
}

#[test]
fn delete_removes_only_the_given_ids() {
    let queue = queue(10);
    queue.enqueue("{}", "k1").unwrap();
    queue.enqueue("{}", "k2").unwrap();
    queue.enqueue("{}", "k3").unwrap();

    let rows = queue.dequeue_batch(2).unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    queue.delete(&ids).unwrap();

    let remaining = queue.dequeue_batch(10).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].idempotency_key, "k3");
}

#[test]
fn mark_retry_increments_and_timestamps() {
    let queue = queue(10);
    queue.enqueue("{}", "k1").unwrap();
    let row = &queue.dequeue_batch(1).unwrap()[0];
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.last_retry_at, 0);

    queue.mark_retry(row.id).unwrap();
    queue.mark_retry(row.id).unwrap();

    let row = &queue.dequeue_batch(1).unwrap()[0];
    assert_eq!(row.retry_count, 2);
    assert!(row.last_retry_at > 0);
}

#[test]
fn clear_wipes_events_but_not_device_info() {
    let queue = queue(10);
    queue.enqueue("{}", "k1").unwrap();
    queue.set_device_info("device_id", "abc").unwrap();

    queue.clear().unwrap();
    assert_eq!(queue.count().unwrap(), 0);
    assert_eq!(
        queue.get_device_info("device_id").unwrap().as_deref(),
        Some("abc")
    );
}

#[test]
fn device_info_upserts() {
    let queue = queue(10);
    assert_eq!(queue.get_device_info("device_id").unwrap(), None);
    queue.set_device_info("device_id", "first").unwrap();
    queue.set_device_info("device_id", "second").unwrap();
    assert_eq!(
        queue.get_device_info("device_id").unwrap().as_deref(),
        Some("second")
    );

    queue.delete_device_info("device_id").unwrap();
    assert_eq!(queue.get_device_info("device_id").unwrap(), None);
}
