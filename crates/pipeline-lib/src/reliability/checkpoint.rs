//! Append-only checkpoint log per partition
//!
//! Each line is `<sha256 hex> <record json>`. A line whose checksum does not
//! match its payload (torn write, manual edit) is ignored on load.

use crate::error::CheckpointError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    /// Write a record after this many processed offsets
    pub every_offsets: u64,
    /// Rewrite the log down to its last record at this interval
    pub compact_interval_secs: u64,
    pub fsync: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/telemetry-pipeline/checkpoints"),
            every_offsets: 500,
            compact_interval_secs: 300,
            fsync: true,
        }
    }
}

/// Durable progress marker of one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub partition: usize,
    /// Highest offset processed when the record was written
    pub offset: u64,
    /// First offset a restart must reprocess; everything below it sat only in
    /// windows that had already closed
    #[serde(default)]
    pub replay_from: u64,
    pub watermark_ms: Option<i64>,
    /// Per key (canonical form) end of the latest closed window
    pub horizons: BTreeMap<String, i64>,
    pub written_at_ms: i64,
}

pub struct CheckpointStore {
    partition: usize,
    path: PathBuf,
    fsync: bool,
    appended: u64,
}

impl CheckpointStore {
    pub fn open(config: &CheckpointConfig, partition: usize) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&config.dir).map_err(|e| CheckpointError::io(&config.dir, e))?;
        Ok(Self {
            partition,
            path: config.dir.join(format!("partition-{}.ckpt", partition)),
            fsync: config.fsync,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Records appended through this handle
    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn append(&mut self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let line = encode_line(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CheckpointError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| CheckpointError::io(&self.path, e))?;
        if self.fsync {
            file.sync_data().map_err(|e| CheckpointError::io(&self.path, e))?;
        }
        self.appended += 1;
        debug!(partition = self.partition, offset = record.offset, "Checkpoint written");
        Ok(())
    }

    /// Last record with a valid checksum, if any
    pub fn load_latest(&self) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::io(&self.path, e)),
        };

        let mut latest = None;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| CheckpointError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match decode_line(&line) {
                Some(record) => latest = Some(record),
                None => warn!(
                    path = ?self.path,
                    line = lineno + 1,
                    "Ignoring corrupt checkpoint record"
                ),
            }
        }
        Ok(latest)
    }

    /// Rewrite the log so it holds only the latest valid record.
    ///
    /// Returns whether anything was rewritten.
    pub fn compact(&mut self) -> Result<bool, CheckpointError> {
        let Some(latest) = self.load_latest()? else {
            return Ok(false);
        };

        let tmp = self.path.with_extension("ckpt.tmp");
        let line = encode_line(&latest)?;
        {
            let mut file = fs::File::create(&tmp).map_err(|e| CheckpointError::io(&tmp, e))?;
            file.write_all(line.as_bytes())
                .map_err(|e| CheckpointError::io(&tmp, e))?;
            file.sync_all().map_err(|e| CheckpointError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| CheckpointError::io(&self.path, e))?;
        debug!(partition = self.partition, offset = latest.offset, "Checkpoint log compacted");
        Ok(true)
    }
}

fn checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

fn encode_line(record: &CheckpointRecord) -> Result<String, CheckpointError> {
    let payload = serde_json::to_string(record)?;
    Ok(format!("{} {}\n", checksum(&payload), payload))
}

fn decode_line(line: &str) -> Option<CheckpointRecord> {
    let (sum, payload) = line.split_once(' ')?;
    if checksum(payload) != sum {
        return None;
    }
    serde_json::from_str(payload).ok()
}
