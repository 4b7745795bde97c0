//! File-backed write-ahead log and snapshot file.
//!
//! The WAL is an append-only sequence of framed [`WalRecord`]s, each one
//! fsynced before the write returns. On load the records are replayed in
//! order; the first torn or corrupt record marks the end of the log and the
//! file is cut back to the last good record, as if the tail was never
//! written. A write that fails at runtime is cut back the same way before
//! the error is returned; if that is impossible the WAL refuses every later
//! write until it is reopened.
//!
//! Taking a snapshot writes `snapshot.bin` through a temp file + rename and
//! then rewrites the WAL the same way, keeping only the hard state and the
//! entries after the snapshot.

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::codec::{frame, read_frame, Frame};
use super::{RecoveredState, Snapshot, Storage, StorageResult};
use crate::error::StorageError;
use crate::raft::state::LogEntry;
use crate::raft::NodeId;

const WAL_FILE: &str = "raft.wal";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// One persisted delta of the Raft persistent state.
#[derive(Debug, Serialize, Deserialize)]
enum WalRecord<'a> {
    HardState {
        term: u64,
        voted_for: Option<NodeId>,
    },
    Append(Cow<'a, [LogEntry]>),
    Truncate {
        from: u64,
    },
}

pub struct FileStorage {
    dir: PathBuf,
    file: Option<File>,
    /// Length of the WAL up to the end of the last fully synced record
    len: u64,
    // Last persisted hard state, rewritten into a fresh WAL on compaction
    term: u64,
    voted_for: Option<NodeId>,
}

impl FileStorage {
    /// Open (or create) the WAL in `dir`. Nothing is read until [`Storage::load`].
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let file = open_log(&dir.join(WAL_FILE))?;
        let len = file.metadata()?.len();
        Ok(Self {
            dir,
            file: Some(file),
            len,
            term: 0,
            voted_for: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn wal_path(&self) -> PathBuf {
        self.dir.join(WAL_FILE)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn write_record(&mut self, record: &WalRecord<'_>) -> StorageResult<()> {
        let bytes = frame(&bincode::serialize(record)?);
        let file = self.file.as_mut().ok_or(StorageError::Closed)?;
        let written = file.write_all(&bytes).and_then(|()| file.sync_data());
        if let Err(e) = written {
            tracing::warn!(dir = %self.dir.display(), error = %e, "WAL write failed");
            self.discard_partial_record();
            return Err(e.into());
        }
        self.len += bytes.len() as u64;
        Ok(())
    }

    /// Cut the WAL back to the end of the last good record so the next write
    /// starts on a record boundary. Closes the WAL if that fails.
    fn discard_partial_record(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.set_len(self.len).and_then(|()| file.sync_all()) {
            tracing::error!(
                dir = %self.dir.display(),
                error = %e,
                "Cannot discard partial WAL record, refusing further writes"
            );
            self.file = None;
        }
    }

    fn replay(&mut self) -> StorageResult<(u64, Option<NodeId>, Vec<LogEntry>)> {
        let buf = fs::read(self.wal_path())?;
        let mut offset = 0;
        let mut term = 0;
        let mut voted_for = None;
        let mut log: Vec<LogEntry> = Vec::new();

        loop {
            let (payload, next) = match read_frame(&buf, offset) {
                Frame::Record { payload, next } => (payload, next),
                Frame::End => break,
                Frame::Torn | Frame::Corrupt => {
                    tracing::warn!(offset, dir = %self.dir.display(), "Invalid WAL record");
                    break;
                }
            };
            let record: WalRecord<'_> = match bincode::deserialize(payload) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "Undecodable WAL record");
                    break;
                }
            };

            match record {
                WalRecord::HardState {
                    term: t,
                    voted_for: v,
                } => {
                    term = t;
                    voted_for = v;
                }
                WalRecord::Append(entries) => {
                    for entry in entries.into_owned() {
                        if log.last().is_some_and(|last| entry.index <= last.index) {
                            log.retain(|e| e.index < entry.index);
                        }
                        log.push(entry);
                    }
                }
                WalRecord::Truncate { from } => log.retain(|e| e.index < from),
            }
            offset = next;
        }

        if offset < buf.len() {
            tracing::warn!(
                valid_bytes = offset,
                discarded_bytes = buf.len() - offset,
                "Truncating WAL to last valid record"
            );
            let file = self.file.as_mut().ok_or(StorageError::Closed)?;
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }
        self.len = offset as u64;

        Ok((term, voted_for, log))
    }

    fn load_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        let buf = match fs::read(self.snapshot_path()) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match read_frame(&buf, 0) {
            Frame::Record { payload, .. } => Ok(Some(bincode::deserialize(payload)?)),
            _ => Err(StorageError::Corrupt("snapshot file")),
        }
    }
}

impl Storage for FileStorage {
    fn save_hard_state(&mut self, term: u64, voted_for: Option<NodeId>) -> StorageResult<()> {
        self.write_record(&WalRecord::HardState { term, voted_for })?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.write_record(&WalRecord::Append(Cow::Borrowed(entries)))
    }

    fn truncate_from(&mut self, from: u64) -> StorageResult<()> {
        self.write_record(&WalRecord::Truncate { from })
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot, retained: &[LogEntry]) -> StorageResult<()> {
        if self.file.is_none() {
            return Err(StorageError::Closed);
        }
        let payload = bincode::serialize(snapshot)?;
        write_atomically(&self.dir, SNAPSHOT_FILE, &frame(&payload))?;

        // Fresh WAL: hard state followed by whatever outlives the snapshot
        let mut bytes = frame(&bincode::serialize(&WalRecord::HardState {
            term: self.term,
            voted_for: self.voted_for,
        })?);
        if !retained.is_empty() {
            bytes.extend(frame(&bincode::serialize(&WalRecord::Append(
                Cow::Borrowed(retained),
            ))?));
        }
        self.file = None;
        write_atomically(&self.dir, WAL_FILE, &bytes)?;
        self.file = Some(open_log(&self.wal_path())?);
        self.len = bytes.len() as u64;

        tracing::debug!(
            last_included_index = snapshot.last_included_index(),
            retained = retained.len(),
            "WAL compacted"
        );
        Ok(())
    }

    fn load(&mut self) -> StorageResult<RecoveredState> {
        let snapshot = self.load_snapshot()?;
        let (term, voted_for, mut entries) = self.replay()?;

        // A crash between writing the snapshot and rewriting the WAL leaves
        // entries the snapshot already covers.
        if let Some(snapshot) = &snapshot {
            entries.retain(|e| e.index > snapshot.last_included_index());
        }

        self.term = term;
        self.voted_for = voted_for;
        Ok(RecoveredState {
            current_term: term,
            voted_for,
            entries,
            snapshot,
        })
    }

    fn close(&mut self) {
        self.file = None;
    }
}

fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
}

/// Replace `dir/name` with `bytes` so readers see either the old or the new file.
fn write_atomically(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    File::open(dir)?.sync_all()
}
