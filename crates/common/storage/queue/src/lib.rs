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

//! A durable, file-backed blocking FIFO queue.
//!
//! Records are appended to a chain of segment files under a spool directory
//! and consumed through a crash-safe cursor. Consumers can block on
//! [`FileQueue::poll`] or [`FileQueue::take`], or walk the backlog with
//! [`FileQueue::iter`] and commit once at the end.

mod builder;
mod codec;
mod config;
mod crc;
mod cursor;
mod error;
mod flusher;
mod iter;
mod lock;
pub mod path;
mod queue;
mod record;
mod recovery;
pub mod segment;
mod segment_set;

pub use builder::QueueBuilder;
pub use codec::{BytesCodec, Codec, CodecError, StringCodec};
pub use config::{FsyncPolicy, QueueConfig};
pub use cursor::Cursor;
pub use error::{QueueError, Result};
pub use iter::QueueIter;
pub use queue::{FileQueue, QueueStats};
pub use record::ReadOutcome;
pub use segment::SEGMENT_HEADER_SIZE;
