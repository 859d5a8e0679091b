//! # Case-Search Spider
//!
//! ## Overview
//! This library implements an adaptive crawl scheduler for enumerating every
//! record behind a public case-search website that caps any single query at
//! 500 results and times out long-running queries.
//!
//! ## Architecture
//! The system is composed of several key modules:
//! - `spider`: Run orchestration, structured concurrency, checkpointing
//! - `node`: Search-space partitioning tree and per-node execution
//! - `transport`: HTTP exchange with the search endpoint, response classification
//! - `session`: Fixed-size pool of authenticated sessions
//! - `registry`: Durable case registry and downstream work queue
//! - `run_store`: Persisted, resumable run state with blob overflow
//! - `config`: Configuration management and settings
//! - `errors`: Centralized error handling and types
//!
//! ## Input/Output Specification
//! - **Input**: A date range plus optional court/site filters
//! - **Output**: Every matching case identifier discovered exactly once,
//!   recorded in the registry and published to the downstream queue
//! - **Resilience**: Overflowed queries refine by prefix, timed-out queries
//!   bisect by date, and the whole run tree checkpoints for crash resume
//!
//! ## Usage
//! ```rust,no_run
//! use case_search_spider::{Config, Spider, RunParams};
//! use case_search_spider::registry::SledRegistry;
//! use case_search_spider::run_store::RunStore;
//! use case_search_spider::transport::HttpTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::from_file("config.toml")?);
//!     let transport = Arc::new(HttpTransport::new(&config)?);
//!     let registry = Arc::new(SledRegistry::open(&config.store.registry_path)?);
//!     let store = Arc::new(RunStore::open(&config.store)?);
//!     let params = RunParams::new("2024-01-01".parse()?, Some("2024-02-01".parse()?));
//!     let mut spider = Spider::start(config, transport, registry, store, params)?;
//!     let (_tx, rx) = tokio::sync::watch::channel(false);
//!     let report = spider.run(rx).await?;
//!     println!("added {} cases", report.total_cases_added);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod node;
pub mod registry;
pub mod run_store;
pub mod session;
pub mod spider;
pub mod transport;

// Re-exports for convenience
pub use config::Config;
pub use errors::{Result, SpiderError};
pub use spider::{RunParams, RunStatus, Spider};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A discovered case, immutable once created.
///
/// Produced from the rows of a successful search, deduplicated by case
/// number within one execution and against the registry before insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    /// Business key: the court's case number
    pub case_number: String,
    /// Court that holds the case
    pub court: String,
    /// Case type as displayed by the search results
    pub case_type: Option<String>,
    /// Case status as displayed by the search results
    pub status: Option<String>,
    /// Filing date parsed from the displayed text
    #[serde(with = "form_date::option", default)]
    pub filing_date: Option<NaiveDate>,
    /// Filing date exactly as displayed
    pub filing_date_text: String,
    /// Case caption (party names)
    pub caption: String,
    /// Location code from the results row
    pub location: String,
    /// Detailed location code from the results row
    pub detail_location: String,
    /// Link to the case detail page
    pub detail_url: Option<String>,
    /// The search URL this case was discovered from
    pub source_url: String,
}

/// Date (de)serialization in the `MM/DD/YYYY` shape of the search form.
///
/// Used for every date that crosses the wire or lands in a persisted run
/// record, so checkpoints stay at parity with what the endpoint accepts.
pub mod form_date {
    use chrono::NaiveDate;
    use serde::{self, Deserialize, Deserializer, Serializer};

    /// The search form's date format
    pub const FORMAT: &str = "%m/%d/%Y";

    pub fn serialize<S>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(serde::de::Error::custom)
    }

    /// Parse a `MM/DD/YYYY` string
    pub fn parse(text: &str) -> Result<NaiveDate, chrono::ParseError> {
        NaiveDate::parse_from_str(text, FORMAT)
    }

    /// Render a date in `MM/DD/YYYY`
    pub fn render(date: &NaiveDate) -> String {
        date.format(FORMAT).to_string()
    }

    /// Same format for `Option<NaiveDate>` fields (null end-dates)
    pub mod option {
        use chrono::NaiveDate;
        use serde::{self, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(date: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match date {
                Some(d) => serializer.serialize_some(&super::render(d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let text: Option<String> = Option::deserialize(deserializer)?;
            match text {
                Some(t) => super::parse(&t).map(Some).map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
