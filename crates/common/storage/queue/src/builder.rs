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

use std::{path::PathBuf, time::Duration};

use crate::{Codec, FileQueue, FsyncPolicy, QueueConfig, Result};

pub struct QueueBuilder {
    config: QueueConfig,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>>(spool_path: P) -> Self {
        Self {
            config: QueueConfig {
                spool_path: spool_path.into(),
                ..Default::default()
            },
        }
    }

    /// Starts from an existing configuration, e.g. one loaded from a file.
    pub fn from_config(config: QueueConfig) -> Self { Self { config } }

    pub fn segment_max_bytes(mut self, bytes: u64) -> Self {
        self.config.segment_max_bytes = bytes;
        self
    }

    pub fn disk_max_bytes(mut self, bytes: u64) -> Self {
        self.config.disk_max_bytes = bytes;
        self
    }

    pub fn fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.config.fsync_policy = policy;
        self
    }

    pub fn poll_default_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_default_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn config(&self) -> &QueueConfig { &self.config }

    /// Opens the queue, running crash recovery on the spool directory.
    pub fn build<C: Codec>(self, codec: C) -> Result<FileQueue<C>> { FileQueue::open(self.config, codec) }
}
