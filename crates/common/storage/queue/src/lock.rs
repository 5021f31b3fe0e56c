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
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::{QueueError, Result, error::LockedSnafu, path::LOCK_FILE};

/// Exclusive advisory lock on a spool directory.
///
/// The lock is taken on `queue.lock` and released when this value is
/// dropped. A second handle on the same directory, from this process or any
/// other, fails with `Locked`.
#[derive(Debug)]
pub(crate) struct DirLock {
    path: PathBuf,
    file: File,
}

impl DirLock {
    pub fn acquire<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref();
        let path = base_path.join(LOCK_FILE);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|e| lock_error(base_path, e))?;

        debug!(path = ?path, "Acquired spool lock");
        Ok(Self { path, file })
    }
}

/// Only contention means another handle holds the lock; anything else is a
/// plain I/O failure.
fn lock_error(base_path: &Path, e: io::Error) -> QueueError {
    if e.kind() == fs2::lock_contended_error().kind() {
        LockedSnafu {
            path: base_path.to_path_buf(),
        }
        .build()
    } else {
        e.into()
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = ?self.path, error = ?e, "Failed to release spool lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::QueueError;

    #[test]
    fn test_second_lock_fails() {
        let temp_dir = TempDir::new().unwrap();
        let _held = DirLock::acquire(temp_dir.path()).unwrap();

        let err = DirLock::acquire(temp_dir.path()).unwrap_err();
        assert!(matches!(err, QueueError::Locked { .. }));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        drop(DirLock::acquire(temp_dir.path()).unwrap());
        assert!(DirLock::acquire(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_contention_maps_to_locked() {
        let temp_dir = TempDir::new().unwrap();
        let err = lock_error(temp_dir.path(), fs2::lock_contended_error());
        assert!(matches!(err, QueueError::Locked { ref path } if path == temp_dir.path()));
    }

    #[test]
    fn test_other_lock_failures_map_to_io() {
        let temp_dir = TempDir::new().unwrap();
        for kind in [io::ErrorKind::PermissionDenied, io::ErrorKind::Unsupported] {
            let err = lock_error(temp_dir.path(), io::Error::from(kind));
            assert!(matches!(err, QueueError::Io { ref source, .. } if source.kind() == kind));
        }
    }
}
