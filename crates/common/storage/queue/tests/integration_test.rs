// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs::OpenOptions,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel;
use spool_queue::{
    FileQueue, FsyncPolicy, QueueBuilder, QueueError, SEGMENT_HEADER_SIZE, StringCodec,
    path::segment_path,
};
use tempfile::TempDir;
use test_case::test_case;

fn open(temp_dir: &TempDir) -> FileQueue<StringCodec> {
    QueueBuilder::new(temp_dir.path()).build(StringCodec).unwrap()
}

fn offer_batch(queue: &FileQueue<StringCodec>, count: usize) {
    for i in 0..count {
        assert!(queue.offer(&format!("testString{i}")).unwrap());
    }
}

#[test]
fn test_drain_in_order_with_iterator() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(&temp_dir);

    offer_batch(&queue, 3000);
    assert_eq!(queue.size(), 3000);

    let mut expected = 0;
    for item in queue.iter() {
        assert_eq!(item.unwrap(), format!("testString{expected}"));
        expected += 1;
    }
    assert_eq!(expected, 3000);
    assert_eq!(queue.size(), 0);
}

#[test]
fn test_resume_after_mark() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(&temp_dir);

    offer_batch(&queue, 3000);
    assert_eq!(queue.iter().count(), 3000);

    offer_batch(&queue, 3000);
    let items: Vec<String> = queue.iter().map(Result::unwrap).collect();
    assert_eq!(items.len(), 3000);
    for (i, item) in items.iter().enumerate() {
        assert_eq!(item, &format!("testString{i}"));
    }
    assert!(queue.is_empty());
}

#[test]
fn test_blocking_poll_times_out() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(&temp_dir);

    let start = Instant::now();
    assert_eq!(queue.poll(Duration::from_millis(1000)).unwrap(), None);
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(1000), "returned after {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2000), "returned after {elapsed:?}");
}

#[test]
fn test_blocking_poll_wakes_on_offer() {
    let temp_dir = TempDir::new().unwrap();
    let queue = Arc::new(open(&temp_dir));

    let start = Instant::now();
    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || queue.poll(Duration::from_millis(5000)).unwrap())
    };

    thread::sleep(Duration::from_millis(1000));
    assert!(queue.offer(&"testString".to_string()).unwrap());

    let received = consumer.join().unwrap();
    assert_eq!(received, Some("testString".to_string()));
    assert!(start.elapsed() < Duration::from_millis(4000));
}

#[test]
fn test_take_across_threads_preserves_order() {
    let temp_dir = TempDir::new().unwrap();
    let queue = Arc::new(open(&temp_dir));

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || (0..200).map(|_| queue.take().unwrap()).collect::<Vec<_>>())
    };

    offer_batch(&queue, 200);

    let received = consumer.join().unwrap();
    let expected: Vec<String> = (0..200).map(|i| format!("testString{i}")).collect();
    assert_eq!(received, expected);
}

#[test_case(1 ; "cut one byte")]
#[test_case(2 ; "cut two bytes")]
#[test_case(3 ; "cut three bytes")]
fn test_crash_during_append(cut: u64) {
    let temp_dir = TempDir::new().unwrap();
    {
        let queue = open(&temp_dir);
        offer_batch(&queue, 51);
    }

    // Lose the tail of record 50's checksum, as if the process died mid-write.
    let path = segment_path(temp_dir.path(), 0);
    let len = std::fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - cut)
        .unwrap();

    let queue = open(&temp_dir);
    assert_eq!(queue.size(), 50);

    let drained = queue.drain_to(usize::MAX).unwrap();
    let expected: Vec<String> = (0..50).map(|i| format!("testString{i}")).collect();
    assert_eq!(drained, expected);
    assert_eq!(queue.size(), 0);
}

#[test]
fn test_rollover_and_gc() {
    let temp_dir = TempDir::new().unwrap();
    // "testStringNN" is 12 bytes, 20 bytes framed: ten records per segment.
    let queue = QueueBuilder::new(temp_dir.path())
        .segment_max_bytes(SEGMENT_HEADER_SIZE + 10 * 20)
        .build(StringCodec)
        .unwrap();

    for i in 0..100 {
        assert!(queue.offer(&format!("testString{i:02}")).unwrap());
    }
    assert_eq!(queue.stats().segment_count, 10);

    for i in 0..25 {
        assert_eq!(
            queue.try_poll().unwrap(),
            Some(format!("testString{i:02}"))
        );
    }

    let stats = queue.stats();
    assert!(stats.read_segment_id > 0);
    assert!(stats.segment_count <= 8);
    assert!(!segment_path(temp_dir.path(), 0).exists());
    assert!(!segment_path(temp_dir.path(), 1).exists());

    let backlog = stats.len * 20;
    assert!(stats.disk_bytes <= backlog + 2 * (SEGMENT_HEADER_SIZE + 10 * 20));
}

#[test]
fn test_cursor_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let queue = open(&temp_dir);
        offer_batch(&queue, 10);
        for i in 0..4 {
            assert_eq!(queue.take().unwrap(), format!("testString{i}"));
        }
        // No explicit close; every consume already stored the cursor.
    }

    let queue = open(&temp_dir);
    assert_eq!(queue.size(), 6);
    assert_eq!(queue.take().unwrap(), "testString4");
}

#[test]
fn test_uncommitted_iteration_is_replayed_after_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let queue = open(&temp_dir);
        offer_batch(&queue, 5);
        let seen: Vec<String> = queue.iter().take(3).map(Result::unwrap).collect();
        assert_eq!(seen.len(), 3);
        queue.close().unwrap();
    }

    let queue = open(&temp_dir);
    assert_eq!(queue.size(), 5);
    assert_eq!(queue.peek().unwrap(), Some("testString0".to_string()));
}

#[test]
fn test_close_is_idempotent_and_releases_lock() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(&temp_dir);
    offer_batch(&queue, 3);

    assert!(matches!(
        QueueBuilder::new(temp_dir.path()).build(StringCodec),
        Err(QueueError::Locked { .. })
    ));

    queue.close().unwrap();
    queue.close().unwrap();

    let reopened = open(&temp_dir);
    assert_eq!(reopened.size(), 3);
}

#[test]
fn test_interrupt_wakes_blocked_take() {
    let temp_dir = TempDir::new().unwrap();
    let queue = Arc::new(open(&temp_dir));
    let (done_tx, done_rx) = channel::bounded(1);

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || {
            let result = queue.take();
            done_tx.send(()).unwrap();
            result
        })
    };

    // An interrupt that lands before the consumer starts waiting is lost, so
    // keep signalling until it reports back.
    loop {
        queue.interrupt();
        if done_rx.recv_timeout(Duration::from_millis(50)).is_ok() {
            break;
        }
    }

    assert!(matches!(
        consumer.join().unwrap(),
        Err(QueueError::Interrupted)
    ));
    assert!(queue.offer(&"after".to_string()).unwrap());
    assert_eq!(queue.take().unwrap(), "after");
}

#[test]
fn test_close_fails_blocked_consumer() {
    let temp_dir = TempDir::new().unwrap();
    let queue = Arc::new(open(&temp_dir));

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || queue.poll(Duration::from_secs(10)))
    };

    thread::sleep(Duration::from_millis(100));
    queue.close().unwrap();

    assert!(matches!(consumer.join().unwrap(), Err(QueueError::Closed)));
}

#[test]
fn test_interval_fsync_keeps_records_across_close() {
    let temp_dir = TempDir::new().unwrap();
    {
        let queue = QueueBuilder::new(temp_dir.path())
            .fsync_policy(FsyncPolicy::Interval(Duration::from_millis(50)))
            .build(StringCodec)
            .unwrap();
        offer_batch(&queue, 100);
        queue.close().unwrap();
    }

    let queue = open(&temp_dir);
    assert_eq!(queue.size(), 100);
    assert_eq!(queue.take().unwrap(), "testString0");
}

#[test]
fn test_disk_budget_refuses_offers_until_gc() {
    let temp_dir = TempDir::new().unwrap();
    let segment = SEGMENT_HEADER_SIZE + 5 * 20;
    let queue = QueueBuilder::new(temp_dir.path())
        .segment_max_bytes(segment)
        .disk_max_bytes(2 * segment)
        .build(StringCodec)
        .unwrap();

    let mut accepted = 0;
    while queue.offer(&format!("testString{accepted:02}")).unwrap() {
        accepted += 1;
    }
    assert_eq!(accepted, 10);
    assert_eq!(queue.size(), 10);

    // Consuming the whole first segment frees it on the next boundary crossing.
    for _ in 0..6 {
        queue.take().unwrap();
    }
    assert!(queue.remaining_bytes() >= segment);
    assert!(queue.offer(&"testString10".to_string()).unwrap());
}
