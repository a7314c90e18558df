// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Metadata describing a single bag segment on disk.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches `<prefix>_<N>.db3` file names produced by the segment writer.
static BAG_NUMBER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)_(\d+)\.db3$").expect("pattern is valid"));

/// A bag segment that is, or will become, eligible for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagMetadata {
    /// Absolute path of the `.db3` segment file.
    pub path: PathBuf,
    /// Segment number parsed from the file name.
    pub number: u64,
    /// Whether the segment was produced by the current run (as opposed to recovered backlog).
    pub is_new: bool,
}

impl BagMetadata {
    /// Builds metadata from a segment file path, shifting the segment number by `delta`.
    ///
    /// The filesystem watcher passes `delta = -1`: observing the creation of segment `N` means
    /// segment `N - 1` has been finalized, so the returned metadata points at the shifted file.
    /// Returns `None` when the file name is not a segment name or the shifted number would be
    /// negative.
    pub fn from_path(path: &Path, delta: i64, is_new: bool) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let captures = BAG_NUMBER_PATTERN.captures(name)?;
        let observed: u64 = captures[2].parse().ok()?;
        let number = observed.checked_add_signed(delta)?;
        let file_name = format!("{}_{number}.db3", &captures[1]);
        Some(Self {
            path: path.with_file_name(file_name),
            number,
            is_new,
        })
    }
}

#[cfg(test)]
mod tests {
    use rotorlog_test_utils::param_test;

    use super::*;

    param_test! {
        parses_segment_names: [
            first: ("/data/run/recording_0.db3", 0, Some(0)),
            rolled: ("/data/run/recording_17.db3", 0, Some(17)),
            shifted_down: ("/data/run/recording_17.db3", -1, Some(16)),
            underflow: ("/data/run/recording_0.db3", -1, None),
            not_a_segment: ("/data/run/metadata.yaml", 0, None),
            missing_number: ("/data/run/recording.db3", 0, None),
            compressed: ("/data/run/recording_3.db3.gz", 0, None),
        ]
    }
    fn parses_segment_names(path: &str, delta: i64, expected: Option<u64>) {
        let bag = BagMetadata::from_path(Path::new(path), delta, true);
        assert_eq!(bag.as_ref().map(|bag| bag.number), expected);
    }

    #[test]
    fn shifted_metadata_points_at_previous_file() {
        let bag = BagMetadata::from_path(Path::new("/data/run/recording_4.db3"), -1, true)
            .expect("segment name parses");
        assert_eq!(bag.path, Path::new("/data/run/recording_3.db3"));
        assert_eq!(bag.number, 3);
        assert!(bag.is_new);
    }
}
