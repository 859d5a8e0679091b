//! # Run Store Module
//!
//! ## Purpose
//! Durable checkpoint storage for run attempts. Every save writes the full
//! run record; every load restores the exact tree the Spider last
//! checkpointed, so an interrupted run resumes instead of restarting.
//!
//! ## Input/Output Specification
//! - **Input**: A run identifier, an attempt timestamp, and the serialized
//!   run record
//! - **Output**: The record persisted under a chronologically ordered key;
//!   prior attempts are kept as run history
//! - **Storage**: Primary records in sled; records above a size threshold
//!   spill to gzip-compressed sidecar files with a small pointer left in
//!   their place
//!
//! ## Key layout
//! `{run_id}\x1f{rfc3339-micros}`: the separator sorts below every key
//! character in use, and the fixed-width timestamp makes a prefix scan
//! return attempts in chronological order.

use crate::config::StoreConfig;
use crate::errors::{Result, SpiderError};
use crate::spider::RunRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::debug;

const KEY_SEPARATOR: char = '\x1f';

/// Stand-in value for a record that spilled to a sidecar file
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Pointer {
    blob: PathBuf,
}

/// Checkpoint storage for run attempts
pub struct RunStore {
    db: sled::Db,
    blob_dir: PathBuf,
    blob_threshold_bytes: usize,
}

impl RunStore {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let db = sled::open(&config.run_db_path)?;
        std::fs::create_dir_all(&config.blob_dir).map_err(|e| SpiderError::Store {
            operation: "create blob directory".to_string(),
            details: e.to_string(),
        })?;
        Ok(Self {
            db,
            blob_dir: config.blob_dir.clone(),
            blob_threshold_bytes: config.blob_threshold_bytes,
        })
    }

    fn key(run_id: &str, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}{}{}",
            run_id,
            KEY_SEPARATOR,
            timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
        )
    }

    /// Persist one attempt. Re-saving the same attempt overwrites it;
    /// different attempts of the same run accumulate as history.
    pub fn save(
        &self,
        run_id: &str,
        timestamp: DateTime<Utc>,
        record: &RunRecord,
    ) -> Result<()> {
        let json = serde_json::to_vec(record)?;
        let value = if json.len() > self.blob_threshold_bytes {
            let path = self.write_blob(run_id, timestamp, &json)?;
            debug!(
                "Run {} record ({} bytes) spilled to {}",
                run_id,
                json.len(),
                path.display()
            );
            serde_json::to_vec(&Pointer { blob: path })?
        } else {
            json
        };

        self.db.insert(Self::key(run_id, timestamp), value)?;
        self.db.flush()?;
        Ok(())
    }

    /// Load one attempt, or the most recent one when no timestamp is given
    pub fn load(&self, run_id: &str, timestamp: Option<DateTime<Utc>>) -> Result<RunRecord> {
        let bytes = match timestamp {
            Some(ts) => self.db.get(Self::key(run_id, ts))?,
            None => {
                let prefix = format!("{}{}", run_id, KEY_SEPARATOR);
                self.db
                    .scan_prefix(prefix.as_bytes())
                    .last()
                    .transpose()?
                    .map(|(_, value)| value)
            }
        }
        .ok_or_else(|| SpiderError::RunNotFound {
            run_id: run_id.to_string(),
        })?;

        self.decode(&bytes)
    }

    /// Attempt timestamps for one run, oldest first
    pub fn list_attempts(&self, run_id: &str) -> Result<Vec<DateTime<Utc>>> {
        let prefix = format!("{}{}", run_id, KEY_SEPARATOR);
        let mut attempts = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let key = String::from_utf8_lossy(&key);
            let stamp = key.split(KEY_SEPARATOR).nth(1).ok_or_else(|| {
                SpiderError::Store {
                    operation: "parse attempt key".to_string(),
                    details: format!("malformed key {:?}", key),
                }
            })?;
            let parsed =
                DateTime::parse_from_rfc3339(stamp).map_err(|e| SpiderError::Store {
                    operation: "parse attempt timestamp".to_string(),
                    details: format!("{:?}: {}", stamp, e),
                })?;
            attempts.push(parsed.with_timezone(&Utc));
        }
        Ok(attempts)
    }

    fn decode(&self, bytes: &[u8]) -> Result<RunRecord> {
        // A pointer value has exactly one field; a real record never
        // parses as one
        if let Ok(pointer) = serde_json::from_slice::<Pointer>(bytes) {
            let compressed =
                std::fs::read(&pointer.blob).map_err(|e| SpiderError::Store {
                    operation: "read blob".to_string(),
                    details: format!("{}: {}", pointer.blob.display(), e),
                })?;
            let mut json = Vec::new();
            GzDecoder::new(&compressed[..])
                .read_to_end(&mut json)
                .map_err(|e| SpiderError::Store {
                    operation: "decompress blob".to_string(),
                    details: format!("{}: {}", pointer.blob.display(), e),
                })?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_slice(bytes)?)
        }
    }

    fn write_blob(
        &self,
        run_id: &str,
        timestamp: DateTime<Utc>,
        json: &[u8],
    ) -> Result<PathBuf> {
        let stamp = timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true)
            .replace(':', "-");
        let path = self.blob_dir.join(format!("{}-{}.json.gz", run_id, stamp));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json).map_err(|e| SpiderError::Store {
            operation: "compress blob".to_string(),
            details: e.to_string(),
        })?;
        let compressed = encoder.finish().map_err(|e| SpiderError::Store {
            operation: "compress blob".to_string(),
            details: e.to_string(),
        })?;

        std::fs::write(&path, compressed).map_err(|e| SpiderError::Store {
            operation: "write blob".to_string(),
            details: format!("{}: {}", path.display(), e),
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeResults, NodeStatus};
    use crate::spider::{NodeRecord, RunResults, RunStatus};
    use chrono::NaiveDate;

    fn store(dir: &tempfile::TempDir, threshold: usize) -> RunStore {
        let config = StoreConfig {
            run_db_path: dir.path().join("runs.db"),
            registry_path: dir.path().join("registry.db"),
            blob_dir: dir.path().join("blobs"),
            blob_threshold_bytes: threshold,
        };
        RunStore::open(&config).unwrap()
    }

    fn record(run_id: &str, timestamp: DateTime<Utc>, slices: usize) -> RunRecord {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        RunRecord {
            id: run_id.to_string(),
            timestamp,
            query_start_date: start,
            query_end_date: Some(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()),
            court: None,
            site: None,
            concurrency: 4,
            status: RunStatus::InProgress,
            results: RunResults::default(),
            slices: (0..slices)
                .map(|i| NodeRecord {
                    search_string: format!("P{}", i),
                    range_start_date: start,
                    range_end_date: None,
                    status: NodeStatus::New,
                    timestamp: None,
                    results: NodeResults::default(),
                    tallied: false,
                    children: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn small_records_round_trip_inline() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024 * 1024);
        let ts = Utc::now();
        let original = record("run-a", ts, 2);

        store.save("run-a", ts, &original).unwrap();
        let loaded = store.load("run-a", Some(ts)).unwrap();
        assert_eq!(loaded, original);

        // No blob files for an inline record
        let blobs = std::fs::read_dir(dir.path().join("blobs")).unwrap().count();
        assert_eq!(blobs, 0);
    }

    #[test]
    fn large_records_spill_to_compressed_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 64);
        let ts = Utc::now();
        let original = record("run-b", ts, 40);

        store.save("run-b", ts, &original).unwrap();
        let blobs = std::fs::read_dir(dir.path().join("blobs")).unwrap().count();
        assert_eq!(blobs, 1);

        let loaded = store.load("run-b", None).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn latest_attempt_wins_without_a_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024 * 1024);
        let first = Utc::now();
        let second = first + chrono::Duration::hours(3);

        let mut early = record("run-c", first, 1);
        early.status = RunStatus::Canceled;
        let late = record("run-c", second, 1);

        store.save("run-c", first, &early).unwrap();
        store.save("run-c", second, &late).unwrap();

        let loaded = store.load("run-c", None).unwrap();
        assert_eq!(loaded.status, RunStatus::InProgress);
        assert_eq!(loaded, late);

        // The earlier attempt is still addressable history
        let replay = store.load("run-c", Some(first)).unwrap();
        assert_eq!(replay.status, RunStatus::Canceled);

        let attempts = store.list_attempts("run-c").unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0] < attempts[1]);
    }

    #[test]
    fn missing_runs_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024 * 1024);
        let err = store.load("no-such-run", None).unwrap_err();
        assert!(matches!(err, SpiderError::RunNotFound { .. }));
    }

    #[test]
    fn run_ids_do_not_collide_on_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024 * 1024);
        let ts = Utc::now();

        store.save("run", ts, &record("run", ts, 1)).unwrap();
        store.save("run-x", ts, &record("run-x", ts, 2)).unwrap();

        assert_eq!(store.load("run", None).unwrap().slices.len(), 1);
        assert_eq!(store.list_attempts("run").unwrap().len(), 1);
    }
}
