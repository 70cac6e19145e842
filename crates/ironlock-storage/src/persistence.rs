//! File-backed transaction log
//!
//! The log is a sequence of JSON lines, one `LogRecord` per line, appended
//! in commit order. A commit is flushed and synced to disk before
//! `write_commit` returns.

use crate::log::{LogRecord, Logger};
use crate::store::Row;
use ironlock_common::{ActionType, Result, SessionId, Timestamp};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Logger that appends records to a file
pub struct FileLogger {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileLogger {
    /// Open (or create) the log at `path` for appending
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::info!(path = %path.display(), "opened transaction log");
        Ok(FileLogger {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record of the log at `path`
    pub fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn append(&self, record: &LogRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl Logger for FileLogger {
    fn write_to_log(&self, session: SessionId, sql: &str) -> Result<()> {
        self.append(&LogRecord::Statement {
            session,
            sql: sql.to_string(),
        })
    }

    fn write_row_action(&self, session: SessionId, action: ActionType, row: &Row) -> Result<()> {
        match LogRecord::for_action(session, action, row) {
            Some(record) => self.append(&record),
            None => Ok(()),
        }
    }

    fn write_commit(&self, session: SessionId, timestamp: Timestamp) -> Result<()> {
        self.append(&LogRecord::Commit { session, timestamp })?;
        self.sync()
    }

    fn checkpoint(&self) -> Result<()> {
        self.append(&LogRecord::Checkpoint)?;
        self.sync()?;
        tracing::info!(path = %self.path.display(), "checkpoint written");
        Ok(())
    }
}
