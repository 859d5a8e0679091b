//! # Case-Search Spider Main Driver
//!
//! ## Purpose
//! Command line entry point for the spider. Wires configuration, the HTTP
//! transport, the case registry, and the run store together, then starts or
//! resumes an enumeration run.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration file, command line arguments
//! - **Output**: A run driven to a terminal state, with a summary printed
//!   and every checkpoint persisted for later resume
//! - **Signals**: Ctrl-C requests cooperative cancellation; in-flight
//!   queries drain and a final checkpoint is written before exit
//!
//! ## Architecture Flow
//! 1. Parse command line arguments and load configuration
//! 2. Initialize logging and tracing
//! 3. Open the registry and run store, build the transport
//! 4. Start a new run or resume a persisted one
//! 5. Translate Ctrl-C into cooperative cancellation

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Arg, ArgMatches, Command};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use case_search_spider::{
    config::Config,
    errors::{Result, SpiderError},
    registry::SledRegistry,
    run_store::RunStore,
    spider::{RunParams, RunReport, Spider},
    transport::HttpTransport,
};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("case-spider")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Legal Search Team")
        .about("Adaptive crawler for capped public case-search endpoints")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("start")
                .about("Start a new enumeration run")
                .arg(
                    Arg::new("start-date")
                        .long("start-date")
                        .value_name("YYYY-MM-DD")
                        .help("First filing date to cover (inclusive)")
                        .required(true),
                )
                .arg(
                    Arg::new("end-date")
                        .long("end-date")
                        .value_name("YYYY-MM-DD")
                        .help("End of the covered range (exclusive); defaults to today"),
                )
                .arg(
                    Arg::new("court")
                        .long("court")
                        .value_name("COURT")
                        .help("Restrict the run to one court"),
                )
                .arg(
                    Arg::new("site")
                        .long("site")
                        .value_name("SITE")
                        .help("Restrict the run to one site/category"),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .value_name("N")
                        .help("Session pool size for this run")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("resume")
                .about("Resume a persisted run from its latest checkpoint")
                .arg(
                    Arg::new("run-id")
                        .value_name("RUN_ID")
                        .help("Identifier of the run to resume")
                        .required(true),
                )
                .arg(
                    Arg::new("timestamp")
                        .long("timestamp")
                        .value_name("RFC3339")
                        .help("Resume a specific attempt instead of the latest"),
                ),
        )
        .subcommand(
            Command::new("attempts")
                .about("List the persisted attempts of a run")
                .arg(
                    Arg::new("run-id")
                        .value_name("RUN_ID")
                        .help("Identifier of the run to inspect")
                        .required(true),
                ),
        )
        .get_matches();

    let config = Arc::new(match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    });

    init_logging(&config)?;
    info!("Case-search spider v{}", env!("CARGO_PKG_VERSION"));

    match matches.subcommand() {
        Some(("start", sub)) => {
            let report = run_spider(config, Some(build_start(sub)?), None).await?;
            print_report(&report);
        }
        Some(("resume", sub)) => {
            let run_id = sub.get_one::<String>("run-id").cloned().unwrap_or_default();
            let timestamp = sub
                .get_one::<String>("timestamp")
                .map(|t| parse_timestamp(t))
                .transpose()?;
            let report = run_spider(config, None, Some((run_id, timestamp))).await?;
            print_report(&report);
        }
        Some(("attempts", sub)) => {
            let run_id = sub.get_one::<String>("run-id").cloned().unwrap_or_default();
            let store = RunStore::open(&config.store)?;
            for attempt in store.list_attempts(&run_id)? {
                println!("{}", attempt.to_rfc3339());
            }
        }
        _ => unreachable!("subcommand is required"),
    }

    Ok(())
}

fn build_start(sub: &ArgMatches) -> Result<RunParams> {
    let start = parse_date(sub.get_one::<String>("start-date").map(String::as_str))?;
    let end = sub
        .get_one::<String>("end-date")
        .map(|d| parse_date(Some(d)))
        .transpose()?;

    let mut params = RunParams::new(start, end);
    params.court = sub.get_one::<String>("court").cloned();
    params.site = sub.get_one::<String>("site").cloned();
    params.concurrency = sub.get_one::<usize>("concurrency").copied();
    Ok(params)
}

/// Build the spider from either fresh parameters or a persisted run, then
/// drive it with Ctrl-C wired to cooperative cancellation
async fn run_spider(
    config: Arc<Config>,
    params: Option<RunParams>,
    resume: Option<(String, Option<DateTime<Utc>>)>,
) -> Result<RunReport> {
    let transport = Arc::new(HttpTransport::new(&config)?);
    let registry = Arc::new(SledRegistry::open(&config.store.registry_path)?);
    let store = Arc::new(RunStore::open(&config.store)?);
    info!("Registry holds {} known cases", registry.case_count());

    let mut spider = match (params, resume) {
        (Some(params), None) => Spider::start(config, transport, registry, store, params)?,
        (None, Some((run_id, timestamp))) => {
            Spider::resume(config, transport, registry, store, &run_id, timestamp)?
        }
        _ => {
            return Err(SpiderError::Internal {
                message: "Exactly one of start parameters or a run id is required".to_string(),
            })
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received SIGINT, requesting cancellation...");
            let _ = shutdown_tx.send(true);
        }
    });

    spider.run(shutdown_rx).await
}

fn print_report(report: &RunReport) {
    println!("Run {} finished: {:?}", report.run_id, report.status);
    println!("  cases added:     {}", report.total_cases_added);
    println!("  cases processed: {}", report.total_cases_processed);
    println!("  requests:        {}", report.total_requests);
    println!("  elapsed:         {}s", report.run_seconds);
}

fn parse_date(text: Option<&str>) -> Result<NaiveDate> {
    let text = text.ok_or_else(|| SpiderError::ValidationFailed {
        field: "date".to_string(),
        reason: "Missing date argument".to_string(),
    })?;
    text.parse::<NaiveDate>()
        .map_err(|e| SpiderError::ValidationFailed {
            field: "date".to_string(),
            reason: format!("{:?} is not a YYYY-MM-DD date: {}", text, e),
        })
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SpiderError::ValidationFailed {
            field: "timestamp".to_string(),
            reason: format!("{:?} is not an RFC3339 timestamp: {}", text, e),
        })
}

/// Initialize logging and tracing
fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.logging.level).map_err(|_| {
        SpiderError::Config {
            message: format!("Invalid log level: {}", config.logging.level),
        }
    })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .init();

    Ok(())
}
