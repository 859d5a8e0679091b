//! # Case Registry Module
//!
//! ## Purpose
//! Durable registry of every discovered case plus the downstream work queue.
//! The scheduler only needs two operations: "which of these identifiers
//! already exist" and "record these new cases and publish them downstream".
//!
//! ## Input/Output Specification
//! - **Input**: Case identifier sets, batches of newly discovered cases
//! - **Output**: Existence answers, durable case records, queued identifiers
//! - **Storage**: Sled embedded database, bincode-encoded values
//!
//! ## Key Features
//! - Upsert semantics keyed by case number: a case is never recorded twice
//! - A case is enqueued for the detail scraper only on first insertion, so
//!   re-discovery by overlapping prefixes or resumed nodes is idempotent

use crate::errors::{Result, SpiderError};
use crate::Case;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// The registry capability consumed by node execution
#[async_trait]
pub trait Registry: Send + Sync {
    /// Which of the given identifiers are already recorded
    async fn exists(&self, case_numbers: &[String]) -> Result<HashSet<String>>;

    /// Durably record new cases and publish them to the downstream queue.
    /// Returns the number actually inserted (already-known cases are skipped).
    async fn insert_and_publish(&self, cases: &[Case]) -> Result<usize>;
}

/// Sled-backed registry with an embedded downstream queue
pub struct SledRegistry {
    db: sled::Db,
    cases: sled::Tree,
    queue: sled::Tree,
}

impl SledRegistry {
    /// Open (or create) the registry database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::open(path.as_ref()).map_err(|e| SpiderError::Store {
            operation: "open registry".to_string(),
            details: e.to_string(),
        })?;
        let cases = db.open_tree("cases")?;
        let queue = db.open_tree("queue")?;

        Ok(Self { db, cases, queue })
    }

    /// Number of recorded cases
    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    /// Fetch one recorded case
    pub fn get_case(&self, case_number: &str) -> Result<Option<Case>> {
        match self.cases.get(case_number.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Pop up to `max` queued identifiers, in publish order.
    /// This is the downstream scraper's consumption side.
    pub fn drain_queue(&self, max: usize) -> Result<Vec<String>> {
        let mut drained = Vec::new();
        while drained.len() < max {
            match self.queue.pop_min()? {
                Some((_, value)) => drained.push(
                    String::from_utf8(value.to_vec()).map_err(|e| SpiderError::Store {
                        operation: "drain queue".to_string(),
                        details: format!("Non-UTF8 queue entry: {}", e),
                    })?,
                ),
                None => break,
            }
        }
        Ok(drained)
    }

    /// Number of queued, not-yet-drained identifiers
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[async_trait]
impl Registry for SledRegistry {
    async fn exists(&self, case_numbers: &[String]) -> Result<HashSet<String>> {
        let mut known = HashSet::new();
        for number in case_numbers {
            if self.cases.contains_key(number.as_bytes())? {
                known.insert(number.clone());
            }
        }
        Ok(known)
    }

    async fn insert_and_publish(&self, cases: &[Case]) -> Result<usize> {
        let mut inserted = 0usize;
        for case in cases {
            let value = bincode::serialize(case)?;
            // Record first, publish second: a case is never published
            // without being durably recorded
            let previous = self.cases.insert(case.case_number.as_bytes(), value)?;
            if previous.is_none() {
                let id = self.db.generate_id()?;
                self.queue
                    .insert(id.to_be_bytes(), case.case_number.as_bytes())?;
                inserted += 1;
            }
        }

        self.db.flush_async().await?;
        debug!("Registry inserted {} of {} cases", inserted, cases.len());
        Ok(inserted)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn sample_case(number: &str) -> Case {
        Case {
            case_number: number.to_string(),
            court: "District Court".to_string(),
            case_type: Some("Criminal".to_string()),
            status: Some("Open".to_string()),
            filing_date: NaiveDate::from_ymd_opt(2024, 3, 9),
            filing_date_text: "03/09/2024".to_string(),
            caption: "STATE vs DOE".to_string(),
            location: "69".to_string(),
            detail_location: "ODYCRIM".to_string(),
            detail_url: None,
            source_url: "https://example/search".to_string(),
        }
    }

    fn open_registry() -> (tempfile::TempDir, SledRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SledRegistry::open(dir.path().join("registry.db")).unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn insert_records_and_publishes_once() {
        let (_dir, registry) = open_registry();
        let cases = vec![sample_case("C-1"), sample_case("C-2")];

        assert_eq!(registry.insert_and_publish(&cases).await.unwrap(), 2);
        assert_eq!(registry.case_count(), 2);
        assert_eq!(registry.queue_len(), 2);

        // Re-discovery of the same identifiers neither re-records nor
        // re-publishes
        assert_eq!(registry.insert_and_publish(&cases).await.unwrap(), 0);
        assert_eq!(registry.case_count(), 2);
        assert_eq!(registry.queue_len(), 2);
    }

    #[tokio::test]
    async fn exists_reports_only_known_identifiers() {
        let (_dir, registry) = open_registry();
        registry
            .insert_and_publish(&[sample_case("C-1")])
            .await
            .unwrap();

        let asked = vec!["C-1".to_string(), "C-2".to_string()];
        let known = registry.exists(&asked).await.unwrap();
        assert!(known.contains("C-1"));
        assert!(!known.contains("C-2"));
    }

    #[tokio::test]
    async fn queue_drains_in_publish_order() {
        let (_dir, registry) = open_registry();
        registry
            .insert_and_publish(&[sample_case("C-1"), sample_case("C-2"), sample_case("C-3")])
            .await
            .unwrap();

        assert_eq!(registry.drain_queue(2).unwrap(), vec!["C-1", "C-2"]);
        assert_eq!(registry.drain_queue(10).unwrap(), vec!["C-3"]);
        assert!(registry.drain_queue(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn stored_case_round_trips() {
        let (_dir, registry) = open_registry();
        let case = sample_case("C-9");
        registry.insert_and_publish(&[case.clone()]).await.unwrap();
        assert_eq!(registry.get_case("C-9").unwrap(), Some(case));
        assert_eq!(registry.get_case("C-404").unwrap(), None);
    }
}
