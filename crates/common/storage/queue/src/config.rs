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

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{QueueError, Result, error::InvalidConfigSnafu, segment::SEGMENT_HEADER_SIZE};

/// Queue configuration.
///
/// Deserializable with every field optional, so it can be embedded in an
/// application config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding the queue.
    #[default(PathBuf::from("./spool"))]
    pub spool_path:              PathBuf,
    /// Soft cap per segment; an append that would cross it rolls first.
    #[default(100 * 1024 * 1024)]
    pub segment_max_bytes:       u64,
    /// Hard cap on all segments together; `offer` returns `false` above it.
    #[default(1024 * 1024 * 1024)]
    pub disk_max_bytes:          u64,
    pub fsync_policy:            FsyncPolicy,
    /// Timeout used by `poll_default`.
    #[default(1000)]
    pub poll_default_timeout_ms: u64,
}

impl QueueConfig {
    pub fn poll_default_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_default_timeout_ms)
    }

    /// Rejects settings the queue cannot operate with.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.spool_path.as_os_str().is_empty(), InvalidConfigSnafu {
            reason: "spool_path is empty",
        });
        ensure!(
            self.segment_max_bytes > SEGMENT_HEADER_SIZE,
            InvalidConfigSnafu {
                reason: format!(
                    "segment_max_bytes must exceed the {SEGMENT_HEADER_SIZE} byte segment header"
                ),
            }
        );
        ensure!(
            self.disk_max_bytes > SEGMENT_HEADER_SIZE,
            InvalidConfigSnafu {
                reason: format!(
                    "disk_max_bytes must exceed the {SEGMENT_HEADER_SIZE} byte segment header"
                ),
            }
        );
        if let FsyncPolicy::Interval(interval) = self.fsync_policy {
            ensure!(!interval.is_zero(), InvalidConfigSnafu {
                reason: "fsync interval must be positive",
            });
        }
        Ok(())
    }
}

/// When appended records are forced to stable storage.
///
/// Renders as `every_record` or `interval_ms=<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FsyncPolicy {
    /// fsync after every append. No acknowledged record is lost on crash.
    #[default]
    EveryRecord,
    /// fsync at most this long after an append; a crash loses at most the
    /// records appended within the window.
    Interval(Duration),
}

impl FromStr for FsyncPolicy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "every_record" {
            return Ok(Self::EveryRecord);
        }

        let millis = s
            .strip_prefix("interval_ms=")
            .and_then(|n| n.trim().parse::<u64>().ok());
        match millis {
            Some(ms) => Ok(Self::Interval(Duration::from_millis(ms))),
            None => InvalidConfigSnafu {
                reason: format!("unknown fsync policy {s:?}"),
            }
            .fail(),
        }
    }
}

impl fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EveryRecord => f.write_str("every_record"),
            Self::Interval(interval) => write!(f, "interval_ms={}", interval.as_millis()),
        }
    }
}

impl TryFrom<String> for FsyncPolicy {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self> { value.parse() }
}

impl From<FsyncPolicy> for String {
    fn from(policy: FsyncPolicy) -> Self { policy.to_string() }
}
