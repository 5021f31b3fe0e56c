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

//! One-shot iterator over the queue with a commit mark.
//!
//! The iterator reads ahead of the durable cursor. Its position is folded
//! back into the queue only when it runs dry or [`QueueIter::commit`] is
//! called, so a partially walked iterator that is dropped leaves the queue
//! untouched.

use snafu::ensure;
use tracing::{debug, warn};

use crate::{
    Codec, FileQueue, Result,
    cursor::Cursor,
    error::ClosedSnafu,
    queue::State,
};

/// Iterator returned by [`FileQueue::iter`].
///
/// Yields `Err` for a record that fails to decode and keeps going. A corrupt
/// segment ends the iteration after yielding the error. The iterator never
/// blocks: it stops at the end of what has been appended so far.
pub struct QueueIter<'a, C: Codec> {
    queue:    &'a FileQueue<C>,
    /// Cursor and sequence at the last commit (or at creation).
    mark:     (Cursor, u64),
    position: Cursor,
    seq:      u64,
    done:     bool,
}

impl<'a, C: Codec> QueueIter<'a, C> {
    pub(crate) fn new(queue: &'a FileQueue<C>, cursor: Cursor, seq: u64) -> Self {
        Self {
            queue,
            mark: (cursor, seq),
            position: cursor,
            seq,
            done: false,
        }
    }

    /// Position the durable cursor moves to on the next commit.
    pub fn position(&self) -> Cursor { self.position }

    /// Position recorded at creation or at the last commit.
    pub fn mark(&self) -> Cursor { self.mark.0 }

    /// Makes everything yielded so far consumed.
    ///
    /// A no-op if other consumers have already moved the queue past this
    /// iterator's position.
    pub fn commit(&mut self) -> Result<()> {
        let queue = self.queue;
        let mut state = queue.inner.state.lock();
        self.commit_locked(&mut state)
    }

    fn commit_locked(&mut self, state: &mut State) -> Result<()> {
        ensure!(!state.closed, ClosedSnafu);
        if self.seq > state.head_seq {
            state.advance_to(self.position, self.seq)?;
            debug!(
                segment_id = self.position.segment_id,
                offset = self.position.offset,
                "Iterator committed"
            );
        }
        self.mark = (self.position, self.seq);
        Ok(())
    }
}

impl<C: Codec> Iterator for QueueIter<'_, C> {
    type Item = Result<C::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let queue = self.queue;
        let mut state = queue.inner.state.lock();
        if state.closed {
            self.done = true;
            return Some(ClosedSnafu.fail());
        }

        // Another consumer got ahead; carry on from the queue's head.
        if state.head_seq > self.seq {
            self.position = state.cursor;
            self.seq = state.head_seq;
        }

        match state.locate(self.position) {
            Ok(Some((payload, next))) => {
                self.position = next;
                self.seq += 1;
                Some(queue.decode(&mut state, &payload))
            }
            Ok(None) => {
                self.done = true;
                match self.commit_locked(&mut state) {
                    Ok(()) => None,
                    Err(e) => Some(Err(e)),
                }
            }
            Err(e) => {
                warn!(error = ?e, "Iteration stopped at unreadable record");
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
