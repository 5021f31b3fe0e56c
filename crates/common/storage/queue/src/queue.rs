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

//! The blocking queue and its lifecycle.
//!
//! All mutable state (segment set, cursor, counters) lives behind a single
//! monitor lock paired with a `not_empty` condition. Producers append and
//! signal; consumers re-check the predicate on every wake.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("/var/spool/events").build(StringCodec)?;
//!
//! queue.offer(&"hello".to_string())?;
//! let item = queue.poll(Duration::from_secs(1))?;
//!
//! for item in queue.iter() {
//!     println!("{}", item?);
//! }
//!
//! queue.close()?;
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use snafu::ensure;
use tracing::{debug, error, info, warn};

use crate::{
    Codec, FsyncPolicy, QueueConfig, QueueError, Result,
    cursor::{Cursor, CursorStore},
    error::{ClosedSnafu, CorruptSegmentSnafu, DiskFullSnafu, InterruptedSnafu, InvalidPathSnafu},
    flusher::Flusher,
    iter::QueueIter,
    lock::DirLock,
    record::{ReadOutcome, length_prefix, record_disk_size},
    recovery::{self, RecoveredState},
    segment::{Append, SEGMENT_HEADER_SIZE},
    segment_set::SegmentSet,
};

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Unconsumed records.
    pub len:              u64,
    /// Records skipped because their payload failed to decode.
    pub lost_records:     u64,
    pub segment_count:    usize,
    /// Bytes held by all live segments.
    pub disk_bytes:       u64,
    pub read_segment_id:  u64,
    pub read_offset:      u64,
    pub write_segment_id: u64,
}

/// State guarded by the monitor lock.
pub(crate) struct State {
    pub segments:        SegmentSet,
    /// Durable read position.
    pub cursor:          Cursor,
    /// Records consumed since open.
    pub head_seq:        u64,
    /// Records appended since open, plus those found at recovery.
    pub tail_seq:        u64,
    pub lost_records:    u64,
    pub closed:          bool,
    /// Bumped by `interrupt`; waiters compare against the value seen on entry.
    pub interrupt_epoch: u64,
    /// Appends not yet fsynced.
    dirty:               bool,
    last_sync:           Instant,
    cursor_store:        CursorStore,
    dir_lock:            Option<DirLock>,
}

impl State {
    pub fn len(&self) -> u64 { self.tail_seq - self.head_seq }

    /// Finds the first record at or after `from`.
    ///
    /// Crosses from the end of a sealed segment into the next one. Returns the
    /// payload and the position just past it, or `None` at the end of the log.
    pub fn locate(&mut self, from: Cursor) -> Result<Option<(Bytes, Cursor)>> {
        let mut position = from;
        loop {
            let outcome = self.segments.read_segment(position.segment_id)?.read_at(position.offset)?;
            match outcome {
                ReadOutcome::Record { payload, next } => {
                    return Ok(Some((payload, Cursor::new(position.segment_id, next))));
                }
                ReadOutcome::Eof => {
                    let next_id = position.segment_id + 1;
                    if self.segments.is_sealed(position.segment_id) && self.segments.contains(next_id) {
                        position = Cursor::new(next_id, SEGMENT_HEADER_SIZE);
                    } else {
                        return Ok(None);
                    }
                }
                ReadOutcome::Corrupt { reason } => {
                    error!(
                        segment_id = position.segment_id,
                        offset = position.offset,
                        reason = %reason,
                        "Corrupt record in segment"
                    );
                    return CorruptSegmentSnafu {
                        segment_id: position.segment_id,
                        offset: position.offset,
                        reason,
                    }
                    .fail();
                }
            }
        }
    }

    /// Moves the durable cursor to `cursor`, which is `seq` records past open.
    ///
    /// The cursor is persisted first; on failure nothing changes. Segments the
    /// cursor has left behind are then collected.
    pub fn advance_to(&mut self, cursor: Cursor, seq: u64) -> Result<()> {
        self.cursor_store.store(cursor)?;
        self.cursor = cursor;
        self.head_seq = seq;

        if cursor.segment_id > self.segments.first_id() {
            if let Err(e) = self.segments.gc(cursor.segment_id) {
                warn!(up_to = cursor.segment_id, error = ?e, "Segment gc failed");
            }
        }
        Ok(())
    }

    /// Consumes the head record, returning its payload.
    fn consume_next(&mut self) -> Result<Option<Bytes>> {
        match self.locate(self.cursor)? {
            Some((payload, next)) => {
                self.advance_to(next, self.head_seq + 1)?;
                Ok(Some(payload))
            }
            None => {
                if self.len() > 0 {
                    warn!(
                        expected = self.len(),
                        "Record count ahead of the log, resetting to empty"
                    );
                    self.tail_seq = self.head_seq;
                }
                Ok(None)
            }
        }
    }

    /// Appends one payload, rolling once if the active segment is full.
    fn append(&mut self, payload: &[u8], config: &QueueConfig) -> Result<()> {
        length_prefix(payload.len())?;
        let record_len = record_disk_size(payload.len());
        let active = self.segments.active_write_segment();
        let needs_roll = !active.is_empty() && active.size() + record_len > config.segment_max_bytes;
        let required = self.segments.disk_bytes() +
            record_len +
            if needs_roll { SEGMENT_HEADER_SIZE } else { 0 };
        ensure!(required <= config.disk_max_bytes, DiskFullSnafu {
            required,
            limit: config.disk_max_bytes,
        });

        if self.segments.active_write_segment().append(payload)? == Append::Full {
            self.segments.roll()?;
            if self.segments.active_write_segment().append(payload)? == Append::Full {
                return CorruptSegmentSnafu {
                    segment_id: self.segments.active_id(),
                    offset:     SEGMENT_HEADER_SIZE,
                    reason:     "fresh segment rejected an append",
                }
                .fail();
            }
        }
        self.tail_seq += 1;
        self.dirty = true;

        match config.fsync_policy {
            FsyncPolicy::EveryRecord => self.sync_active(),
            FsyncPolicy::Interval(interval) if self.last_sync.elapsed() >= interval => self.sync_active(),
            FsyncPolicy::Interval(_) => Ok(()),
        }
    }

    /// Seals the active segment; nothing is appended to it after this.
    fn seal_active(&mut self) -> Result<()> {
        self.segments.active_write_segment().seal()?;
        self.dirty = false;
        self.last_sync = Instant::now();
        Ok(())
    }

    fn sync_active(&mut self) -> Result<()> {
        self.segments.active_write_segment().sync()?;
        self.dirty = false;
        self.last_sync = Instant::now();
        Ok(())
    }
}

/// Monitor lock plus condition, shared with the flusher thread.
pub(crate) struct Shared {
    pub state:     Mutex<State>,
    pub not_empty: Condvar,
}

impl Shared {
    /// Fsyncs the active segment if appends are pending.
    pub fn sync_if_dirty(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || !state.dirty {
            return Ok(());
        }
        state.sync_active()?;
        debug!(segment_id = state.segments.active_id(), "Background fsync complete");
        Ok(())
    }
}

/// A durable FIFO queue of `C::Item` values stored under a spool directory.
///
/// The queue is `Sync`; share it between producers and consumers behind an
/// `Arc`. Only one queue may have a given directory open at a time.
pub struct FileQueue<C: Codec> {
    pub(crate) inner: Arc<Shared>,
    pub(crate) codec: C,
    config:           Arc<QueueConfig>,
    flusher:          Mutex<Option<Flusher>>,
}

impl<C: Codec> FileQueue<C> {
    /// Opens the queue at `config.spool_path`, creating the directory if
    /// needed and recovering any state left by a previous run.
    pub fn open(config: QueueConfig, codec: C) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        if let Err(e) = std::fs::create_dir_all(&config.spool_path) {
            error!(path = ?config.spool_path, error = ?e, "Failed to create spool directory");
            return InvalidPathSnafu {
                path: config.spool_path.clone(),
            }
            .fail();
        }

        let dir_lock = DirLock::acquire(&config.spool_path)?;
        let cursor_store = CursorStore::new(&config.spool_path);
        let RecoveredState {
            segments,
            cursor,
            pending,
        } = recovery::recover(&config, &cursor_store)?;

        let inner = Arc::new(Shared {
            state:     Mutex::new(State {
                segments,
                cursor,
                head_seq: 0,
                tail_seq: pending,
                lost_records: 0,
                closed: false,
                interrupt_epoch: 0,
                dirty: false,
                last_sync: Instant::now(),
                cursor_store,
                dir_lock: Some(dir_lock),
            }),
            not_empty: Condvar::new(),
        });

        let flusher = match config.fsync_policy {
            FsyncPolicy::Interval(interval) => Some(Flusher::spawn(inner.clone(), interval)?),
            FsyncPolicy::EveryRecord => None,
        };

        info!(
            path = ?config.spool_path,
            len = pending,
            fsync_policy = %config.fsync_policy,
            "Queue opened"
        );

        Ok(Self {
            inner,
            codec,
            config,
            flusher: Mutex::new(flusher),
        })
    }

    /// Appends `item` and wakes one waiting consumer.
    ///
    /// Returns `Ok(false)` without writing if the queue would exceed
    /// `disk_max_bytes`, or if the filesystem is out of space. Never blocks on
    /// consumers.
    pub fn offer(&self, item: &C::Item) -> Result<bool> {
        let payload = self.codec.encode(item);

        let mut state = self.inner.state.lock();
        ensure!(!state.closed, ClosedSnafu);
        let result = state.append(&payload, &self.config);
        drop(state);
        self.inner.not_empty.notify_one();

        match result {
            Ok(()) => Ok(true),
            Err(QueueError::DiskFull { required, limit }) => {
                debug!(required, limit, "Disk budget exhausted, rejecting offer");
                Ok(false)
            }
            Err(e) if e.is_out_of_space() => {
                warn!(error = ?e, "Filesystem out of space, rejecting offer");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Removes and returns the head, waiting up to `timeout` for one to
    /// arrive.
    ///
    /// Returns `Ok(None)` once the deadline, fixed at entry, passes.
    /// A concurrent [`interrupt`](Self::interrupt) makes the wait fail with
    /// `Interrupted`.
    pub fn poll(&self, timeout: Duration) -> Result<Option<C::Item>> {
        self.wait_for_head(Instant::now().checked_add(timeout))
    }

    /// [`poll`](Self::poll) with the configured default timeout.
    pub fn poll_default(&self) -> Result<Option<C::Item>> { self.poll(self.config.poll_default_timeout()) }

    /// Removes and returns the head if there is one, without waiting.
    pub fn try_poll(&self) -> Result<Option<C::Item>> { self.poll(Duration::ZERO) }

    /// Removes and returns the head, waiting as long as it takes.
    pub fn take(&self) -> Result<C::Item> {
        loop {
            if let Some(item) = self.wait_for_head(None)? {
                return Ok(item);
            }
        }
    }

    fn wait_for_head(&self, deadline: Option<Instant>) -> Result<Option<C::Item>> {
        let mut state = self.inner.state.lock();
        let epoch = state.interrupt_epoch;

        loop {
            ensure!(!state.closed, ClosedSnafu);
            if state.len() > 0 {
                if let Some(payload) = state.consume_next()? {
                    return self.decode(&mut state, &payload).map(Some);
                }
                continue;
            }
            ensure!(state.interrupt_epoch == epoch, InterruptedSnafu);

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    self.inner.not_empty.wait_until(&mut state, deadline);
                }
                None => self.inner.not_empty.wait(&mut state),
            }
        }
    }

    /// Returns the head without consuming it.
    pub fn peek(&self) -> Result<Option<C::Item>> {
        let mut state = self.inner.state.lock();
        ensure!(!state.closed, ClosedSnafu);
        let cursor = state.cursor;
        match state.locate(cursor)? {
            Some((payload, _)) => Ok(Some(self.codec.decode(&payload)?)),
            None => Ok(None),
        }
    }

    /// Removes up to `max` head values without waiting.
    ///
    /// Records that fail to decode are skipped and counted as lost.
    pub fn drain_to(&self, max: usize) -> Result<Vec<C::Item>> {
        let mut state = self.inner.state.lock();
        ensure!(!state.closed, ClosedSnafu);

        let mut items = Vec::with_capacity(max.min(usize::try_from(state.len()).unwrap_or(usize::MAX)));
        while items.len() < max && state.len() > 0 {
            let Some(payload) = state.consume_next()? else {
                break;
            };
            match self.decode(&mut state, &payload) {
                Ok(item) => items.push(item),
                Err(QueueError::Codec { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    /// Decodes a payload that has already been consumed, counting failures.
    pub(crate) fn decode(&self, state: &mut State, payload: &[u8]) -> Result<C::Item> {
        self.codec.decode(payload).map_err(|e| {
            state.lost_records += 1;
            warn!(
                error = %e,
                lost_records = state.lost_records,
                "Skipping record that failed to decode"
            );
            e.into()
        })
    }

    /// Approximate number of unconsumed records.
    pub fn size(&self) -> u64 { self.inner.state.lock().len() }

    pub fn is_empty(&self) -> bool { self.size() == 0 }

    /// Bytes that can still be appended before `offer` starts refusing.
    pub fn remaining_bytes(&self) -> u64 {
        let state = self.inner.state.lock();
        self.config
            .disk_max_bytes
            .saturating_sub(state.segments.disk_bytes())
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            len:              state.len(),
            lost_records:     state.lost_records,
            segment_count:    state.segments.segment_count(),
            disk_bytes:       state.segments.disk_bytes(),
            read_segment_id:  state.cursor.segment_id,
            read_offset:      state.cursor.offset,
            write_segment_id: state.segments.active_id(),
        }
    }

    /// Iterates from the current head without consuming.
    ///
    /// The durable cursor moves only when the iterator is exhausted or
    /// [`QueueIter::commit`] is called.
    pub fn iter(&self) -> QueueIter<'_, C> {
        let state = self.inner.state.lock();
        QueueIter::new(self, state.cursor, state.head_seq)
    }

    /// Wakes every consumer blocked in `poll` or `take`; each returns
    /// `Interrupted`. Has no effect on calls that start afterwards.
    pub fn interrupt(&self) {
        let mut state = self.inner.state.lock();
        state.interrupt_epoch += 1;
        drop(state);
        self.inner.not_empty.notify_all();
        debug!("Interrupted waiting consumers");
    }

    pub fn config(&self) -> &QueueConfig { &self.config }

    /// Fsyncs the active segment, persists the cursor and releases the
    /// directory lock. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        let flusher = self.flusher.lock().take();
        if let Some(mut flusher) = flusher {
            flusher.stop();
        }

        let mut state = self.inner.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let sealed = state.seal_active();
        let cursor = state.cursor;
        let stored = state.cursor_store.store(cursor);
        state.dir_lock = None;
        let len = state.len();
        drop(state);

        self.inner.not_empty.notify_all();
        info!(path = ?self.config.spool_path, len, "Queue closed");
        sealed.and(stored)
    }
}

impl<C: Codec> Drop for FileQueue<C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = ?e, "Failed to close queue on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{BytesCodec, QueueBuilder, StringCodec};

    fn open(temp_dir: &TempDir) -> FileQueue<StringCodec> {
        QueueBuilder::new(temp_dir.path()).build(StringCodec).unwrap()
    }

    #[test]
    fn test_offer_and_poll_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir);

        for i in 0..10 {
            assert!(queue.offer(&format!("item-{i}")).unwrap());
        }
        assert_eq!(queue.size(), 10);

        for i in 0..10 {
            assert_eq!(queue.try_poll().unwrap(), Some(format!("item-{i}")));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.try_poll().unwrap(), None);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir);

        assert_eq!(queue.peek().unwrap(), None);
        queue.offer(&"first".to_string()).unwrap();
        queue.offer(&"second".to_string()).unwrap();

        assert_eq!(queue.peek().unwrap(), Some("first".to_string()));
        assert_eq!(queue.peek().unwrap(), Some("first".to_string()));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.take().unwrap(), "first");
        assert_eq!(queue.peek().unwrap(), Some("second".to_string()));
    }

    #[test]
    fn test_drain_to_respects_max() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir);
        for i in 0..5 {
            queue.offer(&i.to_string()).unwrap();
        }

        assert_eq!(queue.drain_to(3).unwrap(), vec!["0", "1", "2"]);
        assert_eq!(queue.drain_to(10).unwrap(), vec!["3", "4"]);
        assert!(queue.drain_to(10).unwrap().is_empty());
    }

    #[test]
    fn test_disk_budget_rejects_offer() {
        let temp_dir = TempDir::new().unwrap();
        let queue = QueueBuilder::new(temp_dir.path())
            .disk_max_bytes(SEGMENT_HEADER_SIZE + 3 * record_disk_size(4))
            .build(StringCodec)
            .unwrap();

        for _ in 0..3 {
            assert!(queue.offer(&"abcd".to_string()).unwrap());
        }
        assert_eq!(queue.remaining_bytes(), 0);
        assert!(!queue.offer(&"abcd".to_string()).unwrap());
        assert_eq!(queue.size(), 3);

        // Consuming does not free bytes until a whole segment is collected.
        queue.try_poll().unwrap();
        assert!(!queue.offer(&"abcd".to_string()).unwrap());
    }

    #[test]
    fn test_poisoned_record_is_skipped_and_counted() {
        let temp_dir = TempDir::new().unwrap();
        {
            let raw = QueueBuilder::new(temp_dir.path()).build(BytesCodec).unwrap();
            raw.offer(&Bytes::from_static(b"good-1")).unwrap();
            raw.offer(&Bytes::from_static(&[0xFF, 0xFE, 0xFD])).unwrap();
            raw.offer(&Bytes::from_static(b"good-2")).unwrap();
            raw.close().unwrap();
        }

        let queue = open(&temp_dir);
        assert_eq!(queue.try_poll().unwrap(), Some("good-1".to_string()));
        assert!(matches!(queue.try_poll(), Err(QueueError::Codec { .. })));
        assert_eq!(queue.stats().lost_records, 1);
        assert_eq!(queue.try_poll().unwrap(), Some("good-2".to_string()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_to_skips_poisoned_records() {
        let temp_dir = TempDir::new().unwrap();
        {
            let raw = QueueBuilder::new(temp_dir.path()).build(BytesCodec).unwrap();
            raw.offer(&Bytes::from_static(&[0xC0])).unwrap();
            raw.offer(&Bytes::from_static(b"ok")).unwrap();
        }

        let queue = open(&temp_dir);
        assert_eq!(queue.drain_to(10).unwrap(), vec!["ok"]);
        assert_eq!(queue.stats().lost_records, 1);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir);
        queue.close().unwrap();
        queue.close().unwrap();

        assert!(matches!(queue.offer(&"x".to_string()), Err(QueueError::Closed)));
        assert!(matches!(queue.try_poll(), Err(QueueError::Closed)));
        assert!(matches!(queue.peek(), Err(QueueError::Closed)));
    }

    #[test]
    fn test_close_seals_active_segment() {
        let temp_dir = TempDir::new().unwrap();
        {
            let queue = open(&temp_dir);
            queue.offer(&"before close".to_string()).unwrap();
            queue.close().unwrap();

            let mut state = queue.inner.state.lock();
            assert!(!state.dirty);
            assert!(state.segments.active_write_segment().is_sealed());
        }

        let queue = open(&temp_dir);
        assert!(queue.offer(&"after reopen".to_string()).unwrap());
        assert_eq!(queue.drain_to(usize::MAX).unwrap(), vec![
            "before close",
            "after reopen"
        ]);
    }

    #[test]
    fn test_second_open_is_locked() {
        let temp_dir = TempDir::new().unwrap();
        let _queue = open(&temp_dir);

        let err = QueueBuilder::new(temp_dir.path())
            .build(StringCodec)
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Locked { .. }));
    }

    #[test]
    fn test_stats_track_positions() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir);
        queue.offer(&"abc".to_string()).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.len, 1);
        assert_eq!(stats.segment_count, 1);
        assert_eq!(stats.read_segment_id, 0);
        assert_eq!(stats.read_offset, SEGMENT_HEADER_SIZE);
        assert_eq!(stats.disk_bytes, SEGMENT_HEADER_SIZE + record_disk_size(3));

        queue.try_poll().unwrap();
        assert_eq!(
            queue.stats().read_offset,
            SEGMENT_HEADER_SIZE + record_disk_size(3)
        );
    }

    #[test]
    fn test_interval_policy_flushes_in_background() {
        let temp_dir = TempDir::new().unwrap();
        let queue = QueueBuilder::new(temp_dir.path())
            .fsync_policy(FsyncPolicy::Interval(Duration::from_millis(10)))
            .build(StringCodec)
            .unwrap();

        queue.offer(&"batched".to_string()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!queue.inner.state.lock().dirty);

        queue.close().unwrap();
        drop(queue);

        let queue = open(&temp_dir);
        assert_eq!(queue.try_poll().unwrap(), Some("batched".to_string()));
    }

    #[test]
    fn test_invalid_config_rejected_at_open() {
        let temp_dir = TempDir::new().unwrap();
        let result = QueueBuilder::new(temp_dir.path())
            .segment_max_bytes(1)
            .build(StringCodec);
        assert!(matches!(result, Err(QueueError::InvalidConfig { .. })));
    }
}
