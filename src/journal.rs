// src/journal.rs

//! Append-only migration journal for resumable runs
//!
//! The journal is the durable checkpoint of an import. Each record is written as
//! a single line with a CRC32 checksum for integrity verification.
//!
//! Format: `{crc32_hex}|{json}\n`
//!
//! Every record is written only after the target system has confirmed the
//! corresponding mutation, and is fsynced before the engine moves on. A crash
//! between confirmation and the write causes the revision to be replayed on the
//! next run; a crash can never cause a revision to be skipped without having been
//! applied.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Journal file name inside the migration workspace
pub const JOURNAL_FILE_NAME: &str = "migration.journal";

/// A record in the migration journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JournalRecord {
    /// A run opened the journal
    Session {
        session_id: String,
        app: String,
        force_fresh: bool,
        timestamp: DateTime<Utc>,
    },

    /// The target confirmed creation of the item for `origin_id`
    ItemMigrated { origin_id: String, wi_id: i64 },

    /// The target confirmed the mutation for one revision
    RevisionProcessed {
        origin_id: String,
        wi_id: i64,
        index: usize,
    },

    /// An attachment upload was confirmed
    AttachmentMigrated {
        att_origin_id: String,
        target_ref: String,
    },
}

/// Durable item, revision and attachment checkpoints
pub struct Journal {
    path: PathBuf,
    file: File,
    sequence: u64,
    force_fresh: bool,
    migrated_ids: HashMap<String, i64>,
    processed: HashSet<(String, usize)>,
    processed_this_run: HashSet<(String, usize)>,
    attachments: HashMap<String, String>,
}

impl Journal {
    /// Open (or create) the journal in `workspace`, replaying prior records
    ///
    /// With `force_fresh`, prior processed markers are ignored for skip
    /// decisions, but item and attachment ids are still reused and new records
    /// keep extending the same file.
    pub fn open(workspace: &Path, force_fresh: bool) -> Result<Self> {
        fs::create_dir_all(workspace)?;
        let path = workspace.join(JOURNAL_FILE_NAME);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        lock_with_retry(&file, &path)?;

        let records = read_records(&path)?;
        let mut journal = Self {
            path,
            file,
            sequence: records.len() as u64,
            force_fresh,
            migrated_ids: HashMap::new(),
            processed: HashSet::new(),
            processed_this_run: HashSet::new(),
            attachments: HashMap::new(),
        };
        for record in records {
            journal.apply(record);
        }
        journal.terminate_torn_line()?;

        debug!(
            "Journal {} opened: {} items, {} revisions, {} attachments",
            journal.path.display(),
            journal.migrated_ids.len(),
            journal.processed.len(),
            journal.attachments.len()
        );
        Ok(journal)
    }

    /// Get the journal file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_force_fresh(&self) -> bool {
        self.force_fresh
    }

    /// Number of records in the file, including ones from prior runs
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Record the start of a run
    pub fn begin_session(&mut self, session_id: &str, app: &str) -> Result<()> {
        self.write_barrier(JournalRecord::Session {
            session_id: session_id.to_string(),
            app: app.to_string(),
            force_fresh: self.force_fresh,
            timestamp: Utc::now(),
        })
    }

    /// Target id for an item, if it has been created
    pub fn get_migrated_id(&self, origin_id: &str) -> Option<i64> {
        self.migrated_ids.get(origin_id).copied()
    }

    /// True if the revision must not be replayed again in this run
    pub fn is_item_migrated(&self, origin_id: &str, index: usize) -> bool {
        let key = (origin_id.to_string(), index);
        if self.force_fresh {
            self.processed_this_run.contains(&key)
        } else {
            self.processed.contains(&key)
        }
    }

    /// Target reference of an uploaded attachment
    pub fn is_attachment_migrated(&self, att_origin_id: &str) -> Option<&str> {
        self.attachments.get(att_origin_id).map(String::as_str)
    }

    /// Number of revisions journaled as processed, across all runs
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Record a confirmed item creation; the first id recorded wins
    pub fn mark_item_migrated(&mut self, origin_id: &str, wi_id: i64) -> Result<()> {
        match self.migrated_ids.get(origin_id) {
            Some(existing) if *existing == wi_id => Ok(()),
            Some(existing) => {
                warn!(
                    "'{}' already journaled as work item {}, ignoring {}",
                    origin_id, existing, wi_id
                );
                Ok(())
            }
            None => self.write_barrier(JournalRecord::ItemMigrated {
                origin_id: origin_id.to_string(),
                wi_id,
            }),
        }
    }

    /// Record a confirmed revision mutation
    pub fn mark_rev_processed(&mut self, origin_id: &str, wi_id: i64, index: usize) -> Result<()> {
        self.mark_item_migrated(origin_id, wi_id)?;
        self.write_barrier(JournalRecord::RevisionProcessed {
            origin_id: origin_id.to_string(),
            wi_id,
            index,
        })
    }

    /// Record a confirmed attachment upload
    pub fn mark_attachment_migrated(&mut self, att_origin_id: &str, target_ref: &str) -> Result<()> {
        if self.attachments.get(att_origin_id).is_some_and(|r| r == target_ref) {
            return Ok(());
        }
        self.write_barrier(JournalRecord::AttachmentMigrated {
            att_origin_id: att_origin_id.to_string(),
            target_ref: target_ref.to_string(),
        })
    }

    /// Write a record and fsync before updating the in-memory view
    fn write_barrier(&mut self, record: JournalRecord) -> Result<()> {
        let json = serde_json::to_string(&record).map_err(|e| {
            Error::IoError(format!("Failed to serialize journal record: {}", e))
        })?;
        let crc = crc32fast::hash(json.as_bytes());
        writeln!(self.file, "{:08x}|{}", crc, json)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.sequence += 1;

        self.apply_current(record);
        Ok(())
    }

    /// Fold a record replayed from disk
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Session { .. } => {}
            JournalRecord::ItemMigrated { origin_id, wi_id } => {
                self.migrated_ids.entry(origin_id).or_insert(wi_id);
            }
            JournalRecord::RevisionProcessed {
                origin_id,
                wi_id,
                index,
            } => {
                self.migrated_ids.entry(origin_id.clone()).or_insert(wi_id);
                self.processed.insert((origin_id, index));
            }
            JournalRecord::AttachmentMigrated {
                att_origin_id,
                target_ref,
            } => {
                self.attachments.insert(att_origin_id, target_ref);
            }
        }
    }

    /// Fold a record written by this run
    fn apply_current(&mut self, record: JournalRecord) {
        if let JournalRecord::RevisionProcessed {
            origin_id, index, ..
        } = &record
        {
            self.processed_this_run.insert((origin_id.clone(), *index));
        }
        self.apply(record);
    }

    /// Make sure the next append starts on a fresh line after a torn write
    fn terminate_torn_line(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        if len == 0 {
            return Ok(());
        }
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(len - 1))?;
        let mut last = [0u8; 1];
        reader.read_exact(&mut last)?;
        if last[0] != b'\n' {
            warn!("Journal {} ends with a partial record", self.path.display());
            writeln!(self.file)?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquire the exclusive journal lock, retrying briefly
fn lock_with_retry(file: &File, path: &Path) -> Result<()> {
    // Tries: 0ms, 100ms, 200ms, 400ms, 800ms
    const MAX_RETRIES: u32 = 5;
    let mut last_error = None;
    for attempt in 0..MAX_RETRIES {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = Some(e);
                std::thread::sleep(Duration::from_millis(100 * (1 << attempt) / 2));
            }
        }
    }
    Err(Error::InitError(format!(
        "Journal {} is locked by another run: {}",
        path.display(),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Read all valid records, skipping malformed or corrupted lines
pub fn read_records(path: &Path) -> Result<Vec<JournalRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.is_empty() {
            continue;
        }

        // Parse format: {crc32}|{json}
        let Some((crc_hex, json)) = line.split_once('|') else {
            warn!("Malformed journal line {}: missing delimiter", line_num + 1);
            continue;
        };

        let Ok(expected_crc) = u32::from_str_radix(crc_hex, 16) else {
            warn!("Invalid CRC32 at journal line {}: {}", line_num + 1, crc_hex);
            continue;
        };

        let actual_crc = crc32fast::hash(json.as_bytes());
        if expected_crc != actual_crc {
            warn!(
                "CRC mismatch at journal line {}: expected {:08x}, got {:08x}",
                line_num + 1,
                expected_crc,
                actual_crc
            );
            continue;
        }

        match serde_json::from_str(json) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                "Failed to parse journal record at line {}: {}",
                line_num + 1,
                e
            ),
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_journal_marks_and_reopens() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut journal = Journal::open(temp_dir.path(), false).unwrap();
            journal.begin_session("s1", "wi-import").unwrap();
            journal.mark_rev_processed("PRJ-1", 42, 0).unwrap();
            journal.mark_attachment_migrated("10001", "https://x/att/1").unwrap();
        }

        let journal = Journal::open(temp_dir.path(), false).unwrap();
        assert_eq!(journal.get_migrated_id("PRJ-1"), Some(42));
        assert!(journal.is_item_migrated("PRJ-1", 0));
        assert!(!journal.is_item_migrated("PRJ-1", 1));
        assert_eq!(journal.is_attachment_migrated("10001"), Some("https://x/att/1"));
        assert_eq!(journal.sequence(), 4);
    }

    #[test]
    fn test_force_fresh_ignores_prior_markers_but_keeps_ids() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut journal = Journal::open(temp_dir.path(), false).unwrap();
            journal.mark_rev_processed("PRJ-1", 42, 0).unwrap();
        }

        let mut journal = Journal::open(temp_dir.path(), true).unwrap();
        assert!(!journal.is_item_migrated("PRJ-1", 0));
        assert_eq!(journal.get_migrated_id("PRJ-1"), Some(42));

        journal.mark_rev_processed("PRJ-1", 42, 0).unwrap();
        assert!(journal.is_item_migrated("PRJ-1", 0));
        assert_eq!(journal.processed_count(), 1);
    }

    #[test]
    fn test_first_item_id_wins() {
        let temp_dir = TempDir::new().unwrap();
        let mut journal = Journal::open(temp_dir.path(), false).unwrap();
        journal.mark_item_migrated("PRJ-1", 1).unwrap();
        journal.mark_item_migrated("PRJ-1", 2).unwrap();
        assert_eq!(journal.get_migrated_id("PRJ-1"), Some(1));
        assert_eq!(journal.sequence(), 1);
    }

    #[test]
    fn test_corrupted_line_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut journal = Journal::open(temp_dir.path(), false).unwrap();
            journal.mark_rev_processed("PRJ-1", 7, 0).unwrap();
        }

        let path = temp_dir.path().join(JOURNAL_FILE_NAME);
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("deadbeef|{\"type\":\"ItemMigrated\",\"origin_id\":\"X\",\"wi_id\":1}\n");
        content.push_str("{\"torn");
        fs::write(&path, content).unwrap();

        {
            let mut journal = Journal::open(temp_dir.path(), false).unwrap();
            assert_eq!(journal.get_migrated_id("X"), None);
            assert!(journal.is_item_migrated("PRJ-1", 0));
            journal.mark_rev_processed("PRJ-1", 7, 1).unwrap();
        }

        let journal = Journal::open(temp_dir.path(), false).unwrap();
        assert!(journal.is_item_migrated("PRJ-1", 1));
    }

    #[test]
    fn test_records_have_crc_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let mut journal = Journal::open(temp_dir.path(), false).unwrap();
        journal.mark_item_migrated("PRJ-9", 9).unwrap();

        let content = fs::read_to_string(journal.path()).unwrap();
        let line = content.lines().next().unwrap();
        let (crc, json) = line.split_once('|').unwrap();
        assert_eq!(crc.len(), 8);
        assert_eq!(u32::from_str_radix(crc, 16).unwrap(), crc32fast::hash(json.as_bytes()));
    }
}
