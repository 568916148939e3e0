// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSONL event write-ahead log with group commit support.
//!
//! Durable events are journaled here before the caller considers the
//! mutation complete; recovery replays the tail after the newest snapshot.
//! Each entry is a single line of JSON: `{"seq":N,"event":{...}}\n`.
//!
//! A corrupt tail (torn write at crash) rotates the damaged file to `.bak`
//! and preserves the valid prefix, so recovery never stalls on a bad line.

use ductile_core::Event;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Flush interval for group commit.
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum entries to buffer before a flush is forced.
const FLUSH_THRESHOLD: usize = 100;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct RecordRef<'a> {
    seq: u64,
    event: &'a Event,
}

#[derive(Deserialize)]
struct Record {
    seq: u64,
    event: Event,
}

/// A single journaled event with its sequence number.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub seq: u64,
    pub event: Event,
}

/// Append-only JSONL journal.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Highest sequence number written (buffered entries included).
    write_seq: u64,
    /// Buffered JSON lines awaiting flush (without trailing newline).
    write_buffer: Vec<Vec<u8>>,
    last_flush: Instant,
}

impl Wal {
    /// Open or create a WAL, rotating a corrupt tail out of the way.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = Self::open_file(path)?;
        let (write_seq, valid_lines, corrupt) = Self::scan(&file)?;

        let file = if corrupt {
            drop(file);
            let bak_path = crate::snapshot::rotate_bak_path(path);
            warn!(
                path = %path.display(),
                bak = %bak_path.display(),
                valid_entries = valid_lines.len(),
                "corrupt WAL tail, rotating to .bak and keeping the valid prefix",
            );
            std::fs::rename(path, &bak_path)?;

            let mut clean = File::create(path)?;
            for line in &valid_lines {
                clean.write_all(line.as_bytes())?;
                clean.write_all(b"\n")?;
            }
            clean.sync_all()?;
            drop(clean);
            Self::open_file(path)?
        } else {
            file
        };

        Ok(Self {
            file,
            path: path.to_owned(),
            write_seq,
            write_buffer: Vec::new(),
            last_flush: Instant::now(),
        })
    }

    fn open_file(path: &Path) -> Result<File, WalError> {
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?)
    }

    /// Scan the whole file: max sequence, parseable lines, corruption flag.
    fn scan(file: &File) -> Result<(u64, Vec<String>, bool), WalError> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut max_seq = 0u64;
        let mut valid_lines = Vec::new();
        let mut corrupt = false;
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    corrupt = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(trimmed) {
                Ok(record) => {
                    max_seq = max_seq.max(record.seq);
                    valid_lines.push(trimmed.to_string());
                }
                Err(_) => {
                    corrupt = true;
                    break;
                }
            }
        }

        Ok((max_seq, valid_lines, corrupt))
    }

    /// Buffer an event. Returns the assigned sequence number; the entry is
    /// not durable until `flush()`.
    pub fn append(&mut self, event: &Event) -> Result<u64, WalError> {
        self.write_seq += 1;
        let seq = self.write_seq;
        let bytes = serde_json::to_vec(&RecordRef { seq, event })?;
        self.write_buffer.push(bytes);
        Ok(seq)
    }

    /// Whether group commit should flush now (interval elapsed or buffer full).
    pub fn needs_flush(&self) -> bool {
        !self.write_buffer.is_empty()
            && (self.last_flush.elapsed() >= FLUSH_INTERVAL
                || self.write_buffer.len() >= FLUSH_THRESHOLD)
    }

    /// Write all buffered entries with a single fsync. This is the
    /// durability point.
    pub fn flush(&mut self) -> Result<(), WalError> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        for mut bytes in self.write_buffer.drain(..) {
            bytes.push(b'\n');
            self.file.write_all(&bytes)?;
        }
        self.file.sync_all()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Highest sequence number assigned so far.
    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    /// All entries with `seq > after`, for recovery replay.
    pub fn entries_after(&mut self, after: u64) -> Result<Vec<WalEntry>, WalError> {
        self.flush()?;

        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
                Err(e) => return Err(e.into()),
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: Record = match serde_json::from_str(trimmed) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "corrupt WAL entry during replay, stopping at corruption point");
                    break;
                }
            };
            if record.seq > after {
                entries.push(WalEntry {
                    seq: record.seq,
                    event: record.event,
                });
            }
        }
        Ok(entries)
    }

    /// Drop entries with `seq < keep_from`, called after a checkpoint is
    /// durable. Rewrites the file atomically (tmp + rename).
    pub fn truncate_before(&mut self, keep_from: u64) -> Result<(), WalError> {
        self.flush()?;

        let kept: Vec<String> = {
            let mut reader = BufReader::new(self.file.try_clone()?);
            reader.seek(SeekFrom::Start(0))?;
            let mut kept = Vec::new();
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
                    Err(e) => return Err(e.into()),
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(record) = serde_json::from_str::<Record>(trimmed) else {
                    break;
                };
                if record.seq >= keep_from {
                    kept.push(trimmed.to_string());
                }
            }
            kept
        };

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for line in &kept {
                tmp.write_all(line.as_bytes())?;
                tmp.write_all(b"\n")?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = Self::open_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "wal_tests.rs"]
mod tests;
