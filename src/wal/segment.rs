//! WAL Segment Naming
//!
//! Segments are plain text files named `<db>_<n>.log` with sequential
//! numbers starting at 0. Reading the whole log means concatenating
//! segments in numeric order.

use std::io;
use std::path::{Path, PathBuf};

/// File name for a given segment number
pub fn segment_file_name(db_name: &str, segment: u64) -> String {
    format!("{}_{}.log", db_name, segment)
}

/// Full path of a segment inside the WAL directory
pub fn segment_path(dir: &Path, db_name: &str, segment: u64) -> PathBuf {
    dir.join(segment_file_name(db_name, segment))
}

/// Extract the segment number from a path, if it names a segment of
/// this database
pub fn parse_segment_number(path: &Path, db_name: &str) -> Option<u64> {
    if path.extension()? != "log" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let suffix = stem.strip_prefix(db_name)?.strip_prefix('_')?;
    suffix.parse().ok()
}

/// List this database's segments in ascending numeric order
pub fn list_segments(dir: &Path, db_name: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(number) = parse_segment_number(&path, db_name) {
            segments.push((number, path));
        }
    }

    segments.sort_by_key(|(number, _)| *number);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_segment_names() {
        assert_eq!(segment_file_name("node1", 0), "node1_0.log");
        assert_eq!(segment_file_name("node1", 42), "node1_42.log");
    }

    #[test]
    fn test_parse_segment_number() {
        assert_eq!(
            parse_segment_number(Path::new("/x/node1_3.log"), "node1"),
            Some(3)
        );
        assert_eq!(parse_segment_number(Path::new("/x/node1_3.txt"), "node1"), None);
        assert_eq!(parse_segment_number(Path::new("/x/other_3.log"), "node1"), None);
        assert_eq!(parse_segment_number(Path::new("/x/node1_a.log"), "node1"), None);
    }

    #[test]
    fn test_list_segments_numeric_order() {
        let dir = tempdir().unwrap();
        for n in [10u64, 2, 0, 1] {
            std::fs::write(segment_path(dir.path(), "node1", n), "").unwrap();
        }
        // A foreign file must not be picked up
        std::fs::write(dir.path().join("node2_0.log"), "").unwrap();

        let segments = list_segments(dir.path(), "node1").unwrap();
        let numbers: Vec<u64> = segments.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![0, 1, 2, 10]);
    }
}
