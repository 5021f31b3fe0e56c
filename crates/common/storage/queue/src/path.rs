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
    fs::File,
    path::{Path, PathBuf},
};

use crate::Result;

/// Advisory lock file held for the lifetime of a queue.
pub const LOCK_FILE: &str = "queue.lock";
/// Durable read cursor.
pub const CURSOR_FILE: &str = "cursor.dat";
/// Scratch file used while atomically replacing the cursor.
pub const CURSOR_TMP_FILE: &str = "cursor.dat.tmp";

const SEGMENT_PREFIX: &str = "data-";
const SEGMENT_SUFFIX: &str = ".log";

/// Generates a segment file name: `data-NNNNNNNNNN.log`.
pub fn segment_file_name(id: u64) -> String { format!("{SEGMENT_PREFIX}{id:010}{SEGMENT_SUFFIX}") }

/// Returns the full path to a segment file.
pub fn segment_path<P: AsRef<Path>>(base: P, id: u64) -> PathBuf {
    base.as_ref().join(segment_file_name(id))
}

/// Extracts the segment id from a file name, or `None` if the name is not a
/// segment file.
pub fn parse_segment_id(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Scans `base` for segment files, sorted by id ascending.
pub fn scan_segments<P: AsRef<Path>>(base: P) -> Result<Vec<(u64, PathBuf)>> {
    let base = base.as_ref();
    let mut segments = Vec::new();

    if !base.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(id) = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(parse_segment_id)
        {
            segments.push((id, path));
        }
    }

    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Fsyncs a directory so that renames and unlinks inside it are durable.
#[cfg(unix)]
pub fn sync_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    File::open(dir.as_ref())?.sync_all()?;
    Ok(())
}

/// Directory handles cannot be fsynced on this platform; renames are made
/// durable by the filesystem itself.
#[cfg(not(unix))]
pub fn sync_dir<P: AsRef<Path>>(_dir: P) -> Result<()> { Ok(()) }

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_segment_file_name() {
        assert_eq!(segment_file_name(0), "data-0000000000.log");
        assert_eq!(segment_file_name(42), "data-0000000042.log");
    }

    #[test]
    fn test_segment_names_sort_lexicographically() {
        let mut names: Vec<_> = [10, 2, 100, 1].map(segment_file_name).to_vec();
        names.sort();
        assert_eq!(names, vec![
            segment_file_name(1),
            segment_file_name(2),
            segment_file_name(10),
            segment_file_name(100),
        ]);
    }

    #[test_case("data-0000000042.log", Some(42) ; "padded id")]
    #[test_case("data-0000000000.log", Some(0) ; "zero")]
    #[test_case("data-.log", None ; "missing digits")]
    #[test_case("data-00x1.log", None ; "non digit")]
    #[test_case("cursor.dat", None ; "cursor file")]
    #[test_case("data-0000000001.log.tmp", None ; "wrong suffix")]
    fn test_parse_segment_id(name: &str, expected: Option<u64>) {
        assert_eq!(parse_segment_id(name), expected);
    }

    #[test]
    fn test_scan_segments() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let base = temp_dir.path();

        for id in [3, 1, 2] {
            File::create(segment_path(base, id)).unwrap();
        }
        File::create(base.join(CURSOR_FILE)).unwrap();
        File::create(base.join(LOCK_FILE)).unwrap();

        let segments = scan_segments(base).unwrap();
        let ids: Vec<u64> = segments.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(segments[0].1, segment_path(base, 1));
    }

    #[test]
    fn test_scan_missing_dir() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let segments = scan_segments(temp_dir.path().join("absent")).unwrap();
        assert!(segments.is_empty());
    }
}
