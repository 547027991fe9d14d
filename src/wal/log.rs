//! Segmented Write-Ahead Log
//!
//! Single-writer, append-only log. LSNs assigned here are strictly
//! increasing in read order across all segments; records are never
//! rewritten in place, only whole segments are removed.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::record::{validate_key, Lsn, WalRecord};
use super::segment::{list_segments, segment_path};
use crate::error::{Error, Result};

/// Temporary file used while rewriting the tail during `clear_up_to`
fn compact_tmp_path(dir: &Path, db_name: &str) -> PathBuf {
    dir.join(format!("{}_compact.tmp", db_name))
}

/// Segmented append-only WAL for one database
pub struct Wal {
    db_name: String,
    dir: PathBuf,
    file: File,
    current_seq: Lsn,
    current_segment: u64,
    current_segment_size: u64,
    segment_max_bytes: u64,
}

impl Wal {
    /// Open (or create) the WAL under `<data_dir>/log/<db_name>/`.
    ///
    /// Recovery scans existing segments, adopts the highest-numbered one
    /// as active, and continues the sequence from the last parsable
    /// record.
    pub fn open(data_dir: &Path, db_name: &str, segment_max_bytes: u64) -> Result<Self> {
        let dir = data_dir.join("log").join(db_name);
        std::fs::create_dir_all(&dir)?;

        Self::recover_interrupted_compaction(&dir, db_name)?;

        let segments = list_segments(&dir, db_name)?;
        let current_segment = segments.last().map(|(n, _)| *n).unwrap_or(0);

        let mut current_seq = 0;
        for (_, path) in &segments {
            for record in read_segment_records(path)? {
                current_seq = record.lsn;
            }
        }

        let active_path = segment_path(&dir, db_name, current_segment);
        let file = open_append(&active_path)?;
        let current_segment_size = file.metadata()?.len();

        Ok(Self {
            db_name: db_name.to_string(),
            dir,
            file,
            current_seq,
            current_segment,
            current_segment_size,
            segment_max_bytes,
        })
    }

    /// A crash during `clear_up_to` leaves either the old segments (tmp
    /// not yet authoritative) or only the tmp file (old segments already
    /// removed). Make the surviving state the log.
    fn recover_interrupted_compaction(dir: &Path, db_name: &str) -> Result<()> {
        let tmp = compact_tmp_path(dir, db_name);
        if !tmp.exists() {
            return Ok(());
        }

        let segments = list_segments(dir, db_name)?;
        if segments.is_empty() {
            tracing::warn!("Adopting interrupted WAL compaction for {}", db_name);
            std::fs::rename(&tmp, segment_path(dir, db_name, 0))?;
        } else {
            tracing::warn!("Discarding stale WAL compaction file for {}", db_name);
            std::fs::remove_file(&tmp)?;
        }
        Ok(())
    }

    /// Highest LSN ever written (0 if empty)
    pub fn current_seq(&self) -> Lsn {
        self.current_seq
    }

    /// Number of the active segment
    pub fn current_segment(&self) -> u64 {
        self.current_segment
    }

    /// Raise the sequence to at least `lsn`. Used after opening a WAL
    /// whose segments were truncated behind a persisted apply position,
    /// so old LSNs are never reissued.
    pub fn advance_seq(&mut self, lsn: Lsn) {
        if lsn > self.current_seq {
            self.current_seq = lsn;
        }
    }

    /// Append a SET under the next LSN. The sequence advances only if
    /// the flush succeeds.
    pub fn append_set(&mut self, key: &str, value: &str) -> Result<Lsn> {
        validate_key(key)?;
        let record = WalRecord::set(self.current_seq + 1, key, value);
        self.write_record(&record)?;
        self.current_seq = record.lsn;
        Ok(record.lsn)
    }

    /// Append a DELETE under the next LSN
    pub fn append_delete(&mut self, key: &str) -> Result<Lsn> {
        validate_key(key)?;
        let record = WalRecord::delete(self.current_seq + 1, key);
        self.write_record(&record)?;
        self.current_seq = record.lsn;
        Ok(record.lsn)
    }

    /// Append a record carrying a leader-assigned LSN (follower apply
    /// path). The local sequence jumps to that LSN.
    pub fn append_record(&mut self, record: &WalRecord) -> Result<()> {
        validate_key(&record.key)?;
        if record.lsn <= self.current_seq {
            return Err(Error::Wal(format!(
                "LSN {} not beyond current sequence {}",
                record.lsn, self.current_seq
            )));
        }
        self.write_record(record)?;
        self.current_seq = record.lsn;
        Ok(())
    }

    fn write_record(&mut self, record: &WalRecord) -> Result<()> {
        if self.current_segment_size >= self.segment_max_bytes {
            self.rotate()?;
        }

        let mut line = record.encode_line();
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.current_segment_size += line.len() as u64;
        Ok(())
    }

    /// Close the active segment and open the next one
    fn rotate(&mut self) -> Result<()> {
        self.current_segment += 1;
        let path = segment_path(&self.dir, &self.db_name, self.current_segment);
        self.file = open_append(&path)?;
        self.current_segment_size = 0;
        tracing::debug!(
            "WAL {} rotated to segment {}",
            self.db_name,
            self.current_segment
        );
        Ok(())
    }

    /// Every record across all segments, in write order
    pub fn read_all(&self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        for (_, path) in list_segments(&self.dir, &self.db_name)? {
            records.extend(read_segment_records(&path)?);
        }
        Ok(records)
    }

    /// Records with `lsn > after`, in write order
    pub fn read_from(&self, after: Lsn) -> Result<Vec<WalRecord>> {
        let mut records = self.read_all()?;
        records.retain(|r| r.lsn > after);
        Ok(records)
    }

    /// Remove every segment and restart from an empty segment 0 with
    /// the sequence reset
    pub fn clear_all(&mut self) -> Result<()> {
        for (_, path) in list_segments(&self.dir, &self.db_name)? {
            std::fs::remove_file(&path)?;
        }

        self.current_seq = 0;
        self.current_segment = 0;
        self.current_segment_size = 0;

        let path = segment_path(&self.dir, &self.db_name, 0);
        self.file = open_append(&path)?;
        Ok(())
    }

    /// Drop every record with `lsn <= up_to`, rewriting the tail into a
    /// fresh segment 0. The tail is staged in a temporary file first so
    /// a crash leaves either the old or the new state readable.
    pub fn clear_up_to(&mut self, up_to: Lsn) -> Result<()> {
        let tail = self.read_from(up_to)?;

        let tmp = compact_tmp_path(&self.dir, &self.db_name);
        {
            let mut tmp_file = File::create(&tmp)?;
            for record in &tail {
                let mut line = record.encode_line();
                line.push('\n');
                tmp_file.write_all(line.as_bytes())?;
            }
            tmp_file.sync_all()?;
        }

        for (_, path) in list_segments(&self.dir, &self.db_name)? {
            std::fs::remove_file(&path)?;
        }

        let segment0 = segment_path(&self.dir, &self.db_name, 0);
        std::fs::rename(&tmp, &segment0)?;

        self.current_segment = 0;
        self.file = open_append(&segment0)?;
        self.current_segment_size = self.file.metadata()?.len();
        // current_seq is unchanged: the tail keeps the highest LSN, and
        // an empty tail still must not reissue old LSNs.
        Ok(())
    }

    /// Remove whole segments numbered below `before`, never touching
    /// the active segment
    pub fn delete_old_segments(&mut self, before: u64) -> Result<()> {
        for (number, path) in list_segments(&self.dir, &self.db_name)? {
            if number < before && number != self.current_segment {
                std::fs::remove_file(&path)?;
                tracing::debug!("WAL {} removed segment {}", self.db_name, number);
            }
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)?)
}

fn read_segment_records(path: &Path) -> Result<Vec<WalRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match WalRecord::parse_line(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("Skipping bad WAL line in {:?}: {}", path, e);
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::WalOp;
    use tempfile::tempdir;

    fn open_wal(dir: &Path) -> Wal {
        Wal::open(dir, "node1", 5 * 1024 * 1024).unwrap()
    }

    #[test]
    fn test_lsns_assigned_from_one() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());

        assert_eq!(wal.append_set("a", "x").unwrap(), 1);
        assert_eq!(wal.append_set("b", "y").unwrap(), 2);
        assert_eq!(wal.append_delete("a").unwrap(), 3);

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], WalRecord::set(1, "a", "x"));
        assert_eq!(records[2].op, WalOp::Delete);
        // Strictly increasing in read order
        assert!(records.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn test_read_from_filters() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());
        for i in 0..5 {
            wal.append_set(&format!("k{}", i), "v").unwrap();
        }

        let tail = wal.read_from(3).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].lsn, 4);
        assert_eq!(tail[1].lsn, 5);
    }

    #[test]
    fn test_rotation_and_recovery() {
        let dir = tempdir().unwrap();
        {
            // Tiny segment cap: every append rotates
            let mut wal = Wal::open(dir.path(), "node1", 8).unwrap();
            for i in 0..4 {
                wal.append_set(&format!("k{}", i), "value").unwrap();
            }
            assert!(wal.current_segment() >= 2);
        }

        // Reopen: sequence continues where it left off
        let mut wal = open_wal(dir.path());
        assert_eq!(wal.current_seq(), 4);
        assert_eq!(wal.append_set("k4", "value").unwrap(), 5);

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 5);
        assert!(records.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn test_clear_all_resets() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());
        wal.append_set("a", "x").unwrap();
        wal.append_set("b", "y").unwrap();

        wal.clear_all().unwrap();
        assert_eq!(wal.current_seq(), 0);
        assert_eq!(wal.current_segment(), 0);
        assert!(wal.read_all().unwrap().is_empty());

        assert_eq!(wal.append_set("c", "z").unwrap(), 1);
    }

    #[test]
    fn test_clear_up_to_keeps_tail() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), "node1", 8).unwrap();
        for i in 0..6 {
            wal.append_set(&format!("k{}", i), "v").unwrap();
        }

        wal.clear_up_to(4).unwrap();
        let records = wal.read_all().unwrap();
        let lsns: Vec<Lsn> = records.iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![5, 6]);
        assert_eq!(wal.current_segment(), 0);

        // Sequence still monotonic after compaction
        assert_eq!(wal.append_set("k6", "v").unwrap(), 7);
    }

    #[test]
    fn test_clear_up_to_everything() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());
        wal.append_set("a", "x").unwrap();
        wal.append_set("b", "y").unwrap();

        wal.clear_up_to(2).unwrap();
        assert!(wal.read_all().unwrap().is_empty());
        // Old LSNs must not be reissued
        assert_eq!(wal.append_set("c", "z").unwrap(), 3);
    }

    #[test]
    fn test_delete_old_segments() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), "node1", 8).unwrap();
        for i in 0..4 {
            wal.append_set(&format!("k{}", i), "value").unwrap();
        }
        let active = wal.current_segment();
        assert!(active >= 2);

        wal.delete_old_segments(active).unwrap();
        let remaining = list_segments(&dir.path().join("log").join("node1"), "node1").unwrap();
        assert!(remaining.iter().all(|(n, _)| *n >= active));

        // Tail still reads back in order
        let records = wal.read_all().unwrap();
        assert!(records.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn test_interrupted_compaction_adopts_tmp() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("log").join("node1");
        std::fs::create_dir_all(&wal_dir).unwrap();

        // Crash state: old segments removed, tmp not yet renamed
        std::fs::write(wal_dir.join("node1_compact.tmp"), "9|SET|k|v\n").unwrap();

        let wal = open_wal(dir.path());
        assert_eq!(wal.current_seq(), 9);
        assert_eq!(wal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_interrupted_compaction_prefers_existing_segments() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("log").join("node1");
        std::fs::create_dir_all(&wal_dir).unwrap();

        // Crash state: segments still present, stale tmp left behind
        std::fs::write(wal_dir.join("node1_0.log"), "1|SET|a|x\n2|SET|b|y\n").unwrap();
        std::fs::write(wal_dir.join("node1_compact.tmp"), "2|SET|b|y\n").unwrap();

        let wal = open_wal(dir.path());
        assert_eq!(wal.current_seq(), 2);
        assert_eq!(wal.read_all().unwrap().len(), 2);
        assert!(!wal_dir.join("node1_compact.tmp").exists());
    }

    #[test]
    fn test_failed_validation_does_not_advance_seq() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());
        wal.append_set("a", "x").unwrap();

        assert!(wal.append_set("bad key", "v").is_err());
        assert!(wal.append_delete("bad|key").is_err());
        assert_eq!(wal.current_seq(), 1);
        assert_eq!(wal.append_set("b", "y").unwrap(), 2);
    }

    #[test]
    fn test_append_record_preserves_leader_lsn() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());

        wal.append_record(&WalRecord::set(5, "a", "x")).unwrap();
        assert_eq!(wal.current_seq(), 5);

        // Not beyond the current sequence: rejected
        assert!(wal.append_record(&WalRecord::set(5, "a", "x")).is_err());
        assert!(wal.append_record(&WalRecord::set(3, "b", "y")).is_err());

        wal.append_record(&WalRecord::delete(8, "a")).unwrap();
        assert_eq!(wal.current_seq(), 8);
    }
}
