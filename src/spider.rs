//! # Spider Orchestration Module
//!
//! ## Purpose
//! Owns one enumeration run: the root date slices, the shared session pool,
//! the structured-concurrency scope that executes every node, periodic
//! checkpointing, and run-level result aggregation.
//!
//! ## Input/Output Specification
//! - **Input**: Run parameters (date range, optional court/site filters,
//!   concurrency) or a persisted run identifier to resume
//! - **Output**: Every discovered case recorded and published via the
//!   registry, plus a final checkpoint and run summary
//! - **Lifecycle**: NEW → IN_PROGRESS → COMPLETE | CANCELED | FAILED, with a
//!   checkpoint written on every terminal path
//!
//! ## Concurrency model
//! All node executions run as tasks in one `JoinSet`. Tasks perform only
//! I/O against value snapshots; every tree mutation (status transitions,
//! child attachment, bisection, counter propagation) is applied on the
//! loop thread as task results arrive, so concurrent completions of
//! independent subtrees never race. Cancellation is cooperative: no new
//! tasks are spawned, in-flight work drains, and a final checkpoint is
//! written before `run` returns.

use crate::config::Config;
use crate::errors::{Result, SpiderError};
use crate::form_date;
use crate::node::{
    self, bisect, refinement_children, slice_children, ExecCounters, ExecOutcome, ExecShared,
    NodeArena, NodeId, NodeResults, NodeSnapshot, NodeStatus, SearchNode,
};
use crate::registry::Registry;
use crate::run_store::RunStore;
use crate::session::SessionPool;
use crate::transport::Transport;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Run lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    New,
    InProgress,
    Complete,
    Canceled,
    Failed,
}

/// Aggregate run counters, accumulated across resumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResults {
    pub run_seconds: u64,
    pub total_cases_added: u64,
    pub total_cases_processed: u64,
    pub total_requests: u64,
}

/// Parameters for a fresh run
#[derive(Debug, Clone)]
pub struct RunParams {
    pub start: NaiveDate,
    /// Defaults to today when unset
    pub end: Option<NaiveDate>,
    pub court: Option<String>,
    pub site: Option<String>,
    /// Defaults to the configured pool size
    pub concurrency: Option<usize>,
}

impl RunParams {
    pub fn new(start: NaiveDate, end: Option<NaiveDate>) -> Self {
        Self {
            start,
            end,
            court: None,
            site: None,
            concurrency: None,
        }
    }
}

/// Summary of a finished run attempt
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub total_cases_added: u64,
    pub total_cases_processed: u64,
    pub total_requests: u64,
    pub run_seconds: u64,
}

/// Deterministic run identifier from the query parameters
pub fn run_id(
    start: NaiveDate,
    end: NaiveDate,
    court: Option<&str>,
    site: Option<&str>,
) -> String {
    let mut id = format!("{}-{}", start.format("%Y%m%d"), end.format("%Y%m%d"));
    if let Some(court) = court {
        id.push('-');
        id.push_str(&slug(court));
    }
    if let Some(site) = site {
        id.push('-');
        id.push_str(&slug(site));
    }
    id
}

fn slug(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Persisted shape of one run attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "form_date")]
    pub query_start_date: NaiveDate,
    #[serde(with = "form_date::option")]
    pub query_end_date: Option<NaiveDate>,
    pub court: Option<String>,
    pub site: Option<String>,
    pub concurrency: usize,
    pub status: RunStatus,
    pub results: RunResults,
    pub slices: Vec<NodeRecord>,
}

/// Persisted shape of one node, serialized recursively
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub search_string: String,
    #[serde(with = "form_date")]
    pub range_start_date: NaiveDate,
    #[serde(with = "form_date::option")]
    pub range_end_date: Option<NaiveDate>,
    pub status: NodeStatus,
    pub timestamp: Option<DateTime<Utc>>,
    pub results: NodeResults,
    #[serde(default)]
    pub tallied: bool,
    #[serde(default)]
    pub children: Vec<NodeRecord>,
}

fn node_record(arena: &NodeArena, id: NodeId) -> NodeRecord {
    let node = arena.get(id);
    NodeRecord {
        search_string: node.search_string.clone(),
        range_start_date: node.range_start,
        range_end_date: node.range_end,
        status: node.status,
        timestamp: node.timestamp,
        results: node.results.clone(),
        tallied: node.tallied,
        children: node
            .children
            .iter()
            .map(|child| node_record(arena, *child))
            .collect(),
    }
}

fn restore_node(arena: &mut NodeArena, parent: Option<NodeId>, record: NodeRecord) {
    let node = SearchNode {
        search_string: record.search_string,
        range_start: record.range_start_date,
        range_end: record.range_end_date,
        status: record.status,
        timestamp: record.timestamp,
        results: record.results,
        tallied: record.tallied,
        parent: None,
        children: Vec::new(),
    };
    let id = match parent {
        None => arena.push_root(node),
        Some(parent) => arena.push_child(parent, node),
    };
    for child in record.children {
        restore_node(arena, Some(id), child);
    }
}

/// Root orchestrator for one enumeration run
pub struct Spider {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    store: Arc<RunStore>,
    sessions: Arc<SessionPool>,
    run_id: String,
    /// Start of this attempt; changes across resumes
    attempt: DateTime<Utc>,
    start_date: NaiveDate,
    end_date: NaiveDate,
    court: Option<String>,
    site: Option<String>,
    concurrency: usize,
    status: RunStatus,
    results: RunResults,
    arena: NodeArena,
}

impl std::fmt::Debug for Spider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spider")
            .field("run_id", &self.run_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Spider {
    /// Create a fresh run: the date range is divided into fixed-size day
    /// chunks, one root slice per chunk
    pub fn start(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
        store: Arc<RunStore>,
        params: RunParams,
    ) -> Result<Self> {
        let end = params.end.unwrap_or_else(|| Utc::now().date_naive());
        if end <= params.start {
            return Err(SpiderError::ValidationFailed {
                field: "end_date".to_string(),
                reason: format!(
                    "End date {} must fall after start date {}",
                    end, params.start
                ),
            });
        }

        let court = params.court.or_else(|| config.http.court.clone());
        let site = params.site.or_else(|| config.http.site.clone());
        let concurrency = params.concurrency.unwrap_or(config.pool.concurrency);
        let sessions = Arc::new(SessionPool::new(&config.http, concurrency)?);

        let mut arena = NodeArena::new();
        let days = config.search.days_per_query;
        let mut cursor = params.start;
        // The range is half-open; slices hold inclusive dates
        while cursor < end {
            let slice_last = std::cmp::min(
                cursor + chrono::Duration::days(days - 1),
                end - chrono::Duration::days(1),
            );
            let range_end = (slice_last > cursor).then_some(slice_last);
            arena.push_root(SearchNode::new("", cursor, range_end));
            cursor = slice_last + chrono::Duration::days(1);
        }

        let run_id = run_id(params.start, end, court.as_deref(), site.as_deref());
        info!(
            "New run {} covering {} through {} ({} root slices, {} sessions)",
            run_id,
            params.start,
            end,
            arena.roots().len(),
            sessions.size()
        );

        Ok(Self {
            config,
            transport,
            registry,
            store,
            sessions,
            run_id,
            attempt: Utc::now(),
            start_date: params.start,
            end_date: end,
            court,
            site,
            concurrency,
            status: RunStatus::New,
            results: RunResults::default(),
            arena,
        })
    }

    /// Rehydrate a persisted run. Terminal nodes stay untouched; NEW and
    /// IN_PROGRESS nodes will be re-entered, which is safe because registry
    /// inserts are idempotent.
    pub fn resume(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
        store: Arc<RunStore>,
        run_id: &str,
        attempt: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let record = store.load(run_id, attempt)?;
        if record.status == RunStatus::Complete {
            return Err(SpiderError::RunComplete {
                run_id: run_id.to_string(),
            });
        }

        let mut arena = NodeArena::new();
        for slice in record.slices {
            restore_node(&mut arena, None, slice);
        }

        let sessions = Arc::new(SessionPool::new(&config.http, record.concurrency)?);
        let end_date = record
            .query_end_date
            .unwrap_or_else(|| Utc::now().date_naive());

        info!(
            "Resuming run {} (previous attempt {}, {} nodes, {} sessions)",
            run_id,
            record.timestamp,
            arena.len(),
            sessions.size()
        );

        Ok(Self {
            config,
            transport,
            registry,
            store,
            sessions,
            run_id: record.id,
            attempt: Utc::now(),
            start_date: record.query_start_date,
            end_date,
            court: record.court,
            site: record.site,
            concurrency: record.concurrency,
            status: RunStatus::InProgress,
            results: record.results,
            arena,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn results(&self) -> &RunResults {
        &self.results
    }

    /// Execute the run to a terminal state. A final checkpoint and summary
    /// log happen on every exit path, including cancellation and errors.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<RunReport> {
        self.status = RunStatus::InProgress;
        let started = Instant::now();

        let outcome = self.run_loop(shutdown).await;

        self.results.run_seconds += started.elapsed().as_secs();
        self.status = match &outcome {
            Ok(status) => *status,
            Err(e) => {
                error!("Run {} failed ({}): {}", self.run_id, e.category(), e);
                RunStatus::Failed
            }
        };

        let checkpoint = self.checkpoint();
        info!(
            "Run {} finished {:?}: {} requests, {} cases processed, {} added in {}s",
            self.run_id,
            self.status,
            self.results.total_requests,
            self.results.total_cases_processed,
            self.results.total_cases_added,
            self.results.run_seconds,
        );

        outcome?;
        checkpoint?;
        Ok(self.report())
    }

    fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id.clone(),
            status: self.status,
            total_cases_added: self.results.total_cases_added,
            total_cases_processed: self.results.total_cases_processed,
            total_requests: self.results.total_requests,
            run_seconds: self.results.run_seconds,
        }
    }

    async fn run_loop(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunStatus> {
        let shared = Arc::new(ExecShared {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            search: self.config.search.clone(),
            court: self.court.clone(),
            site: self.site.clone(),
        });

        let mut tasks: JoinSet<(NodeId, Result<ExecOutcome>)> = JoinSet::new();
        let mut in_flight: HashSet<NodeId> = HashSet::new();
        let mut canceled = *shutdown.borrow();
        let mut shutdown_live = true;

        let mut poll = tokio::time::interval(Duration::from_secs(
            self.config.checkpoint.poll_interval_seconds,
        ));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let checkpoint_after = Duration::from_secs(self.config.checkpoint.interval_seconds);
        let mut last_checkpoint = Instant::now();

        loop {
            if !canceled {
                self.spawn_runnable(&shared, &mut tasks, &mut in_flight);
            }
            if tasks.is_empty() {
                // Nothing running and nothing schedulable: the scope is done
                break;
            }

            tokio::select! {
                Some(joined) = tasks.join_next() => {
                    let (id, result) = joined.map_err(|e| SpiderError::Internal {
                        message: format!("Node task panicked: {}", e),
                    })?;
                    in_flight.remove(&id);
                    self.apply_outcome(id, result?);
                }
                _ = poll.tick() => {
                    if last_checkpoint.elapsed() >= checkpoint_after {
                        self.checkpoint()?;
                        last_checkpoint = Instant::now();
                    }
                }
                changed = shutdown.changed(), if !canceled && shutdown_live => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            canceled = true;
                            info!(
                                "Cancellation requested; draining {} in-flight nodes",
                                tasks.len()
                            );
                        }
                        Ok(()) => {}
                        Err(_) => shutdown_live = false,
                    }
                }
            }
        }

        Ok(if canceled {
            RunStatus::Canceled
        } else {
            RunStatus::Complete
        })
    }

    /// Spawn a task for every node that is schedulable in this attempt
    fn spawn_runnable(
        &self,
        shared: &Arc<ExecShared>,
        tasks: &mut JoinSet<(NodeId, Result<ExecOutcome>)>,
        in_flight: &mut HashSet<NodeId>,
    ) {
        let runnable: Vec<NodeSnapshot> = self
            .arena
            .iter()
            .filter(|(id, _)| !in_flight.contains(id))
            .filter(|(_, node)| self.is_runnable(node))
            .map(|(id, node)| NodeSnapshot::of(id, node))
            .collect();

        for snapshot in runnable {
            in_flight.insert(snapshot.id);
            let shared = shared.clone();
            tasks.spawn(async move {
                let id = snapshot.id;
                (id, node::execute(snapshot, &shared).await)
            });
        }
    }

    /// NEW nodes always run; IN_PROGRESS nodes run once per attempt
    fn is_runnable(&self, node: &SearchNode) -> bool {
        match node.status {
            NodeStatus::New => true,
            NodeStatus::InProgress => node.timestamp.map_or(true, |t| t < self.attempt),
            _ => false,
        }
    }

    /// Apply one finished execution to the tree. Runs on the loop thread,
    /// which serializes all tree mutation and counter propagation.
    fn apply_outcome(&mut self, id: NodeId, outcome: ExecOutcome) {
        let now = Utc::now();
        match outcome {
            ExecOutcome::RootExpansionPending => {
                let (start, end) = {
                    let node = self.arena.get(id);
                    (node.range_start, node.range_end)
                };
                let symbols = self.config.search.symbols();
                for child in slice_children(start, end, &symbols) {
                    self.arena.push_child(id, child);
                }
                debug!(
                    "Expanded root slice {} into {} prefix children",
                    start,
                    symbols.len()
                );
                let node = self.arena.get_mut(id);
                node.status = NodeStatus::InProgress;
                node.timestamp = Some(now);
                self.tally(id);
            }
            ExecOutcome::AlreadyExpanded => {
                self.arena.get_mut(id).timestamp = Some(now);
            }
            ExecOutcome::Completed(counters) => {
                let node = self.arena.get_mut(id);
                record_counters(node, &counters);
                node.status = NodeStatus::Complete;
                node.timestamp = Some(now);
                self.tally(id);
            }
            ExecOutcome::Overflowed(counters) => {
                let (prefix, start, end, has_children) = {
                    let node = self.arena.get(id);
                    (
                        node.search_string.clone(),
                        node.range_start,
                        node.range_end,
                        !node.children.is_empty(),
                    )
                };
                if has_children {
                    debug!("Re-entered overflowed prefix {:?}; children already exist", prefix);
                } else {
                    let symbols = self.config.search.symbols();
                    for child in refinement_children(&prefix, start, end, &symbols) {
                        self.arena.push_child(id, child);
                    }
                    debug!(
                        "Prefix {:?} overflowed; refined into {} children",
                        prefix,
                        symbols.len() * 2
                    );
                }
                let node = self.arena.get_mut(id);
                record_counters(node, &counters);
                node.status = NodeStatus::InProgress;
                node.timestamp = Some(now);
                self.tally(id);
            }
            ExecOutcome::TimedOut => {
                let (prefix, start, end) = {
                    let node = self.arena.get(id);
                    (node.search_string.clone(), node.range_start, node.range_end)
                };
                match bisect(&prefix, start, end) {
                    Some((left, right)) => {
                        info!(
                            "Prefix {:?} timed out over {}..{:?}; bisected into new slices",
                            prefix, start, end
                        );
                        self.arena.push_root(left);
                        self.arena.push_root(right);
                        self.arena.get_mut(id).status = NodeStatus::TimeRangeSplit;
                    }
                    None => {
                        warn!(
                            "Single-day query {:?} on {} timed out; cannot bisect further",
                            prefix, start
                        );
                        self.arena.get_mut(id).status = NodeStatus::Failed;
                    }
                }
                self.arena.get_mut(id).timestamp = Some(now);
                self.tally(id);
            }
            ExecOutcome::Failed { reason, counters } => {
                let node = self.arena.get_mut(id);
                record_counters(node, &counters);
                node.status = NodeStatus::Failed;
                node.timestamp = Some(now);
                error!(
                    "Node {:?} over {}..{:?} failed; abandoning subtree: {}",
                    node.search_string, node.range_start, node.range_end, reason
                );
                self.tally(id);
            }
        }
    }

    /// One-shot propagation into ancestor totals and run-level results
    fn tally(&mut self, id: NodeId) {
        if self.arena.get(id).tallied {
            return;
        }
        let own = self.arena.get(id).results.clone();
        self.arena.tally(id);
        self.results.total_cases_added += own.cases_added;
        self.results.total_cases_processed += own.distinct_cases;
        self.results.total_requests += own.requests;
    }

    /// Serialize the full tree to the run store
    fn checkpoint(&self) -> Result<()> {
        let record = self.to_record();
        self.store.save(&self.run_id, self.attempt, &record)?;
        debug!(
            "Checkpointed run {} ({} nodes, status {:?})",
            self.run_id,
            self.arena.len(),
            self.status
        );
        Ok(())
    }

    fn to_record(&self) -> RunRecord {
        RunRecord {
            id: self.run_id.clone(),
            timestamp: self.attempt,
            query_start_date: self.start_date,
            query_end_date: Some(self.end_date),
            court: self.court.clone(),
            site: self.site.clone(),
            concurrency: self.concurrency,
            status: self.status,
            results: self.results.clone(),
            slices: self
                .arena
                .roots()
                .iter()
                .map(|root| node_record(&self.arena, *root))
                .collect(),
        }
    }
}

fn record_counters(node: &mut SearchNode, counters: &ExecCounters) {
    node.results.cases_returned = counters.cases_returned;
    node.results.distinct_cases = counters.distinct_cases;
    node.results.cases_added = counters.cases_added;
    node.results.requests = counters.requests;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{numbers, MockReply, MockTransport};
    use crate::registry::SledRegistry;

    fn day(month: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, d).unwrap()
    }

    /// Two-symbol alphabet keeps the fan-out small enough to walk in tests
    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.search.alphabet = "AB".to_string();
        config.search.excluded_chars.clear();
        Arc::new(config)
    }

    struct Fixture {
        config: Arc<Config>,
        registry: Arc<SledRegistry>,
        store: Arc<RunStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: Arc<Config>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SledRegistry::open(dir.path().join("registry.db")).unwrap());
        let mut store_config = config.store.clone();
        store_config.run_db_path = dir.path().join("runs.db");
        store_config.blob_dir = dir.path().join("blobs");
        let store = Arc::new(RunStore::open(&store_config).unwrap());
        Fixture {
            config,
            registry,
            store,
            _dir: dir,
        }
    }

    fn spider(f: &Fixture, transport: Arc<MockTransport>, params: RunParams) -> Spider {
        Spider::start(
            f.config.clone(),
            transport,
            f.registry.clone(),
            f.store.clone(),
            params,
        )
        .unwrap()
    }

    fn idle_shutdown() -> watch::Receiver<bool> {
        // Dropping the sender is fine: a closed channel never cancels
        let (_tx, rx) = watch::channel(false);
        rx
    }

    fn find(spider: &Spider, prefix: &str) -> NodeId {
        spider
            .arena
            .iter()
            .find(|(_, n)| n.search_string == prefix)
            .map(|(id, _)| id)
            .unwrap_or_else(|| panic!("no node with prefix {:?}", prefix))
    }

    #[test]
    fn thirty_two_days_make_two_root_slices() {
        let f = fixture(test_config());
        let transport = Arc::new(MockTransport::new());
        // Half-open range: 2024-03-01 .. 2024-04-02 is 32 days
        let s = spider(
            &f,
            transport,
            RunParams::new(day(3, 1), Some(day(4, 2))),
        );

        assert_eq!(s.arena.roots().len(), 2);
        let first = s.arena.get(s.arena.roots()[0]);
        let second = s.arena.get(s.arena.roots()[1]);
        assert_eq!((first.range_start, first.range_end), (day(3, 1), Some(day(3, 16))));
        assert_eq!((second.range_start, second.range_end), (day(3, 17), Some(day(4, 1))));
        assert!(first.is_root_slice());
    }

    #[test]
    fn single_day_run_gets_a_null_end_slice() {
        let f = fixture(test_config());
        let transport = Arc::new(MockTransport::new());
        let s = spider(&f, transport, RunParams::new(day(3, 1), Some(day(3, 2))));

        assert_eq!(s.arena.roots().len(), 1);
        let root = s.arena.get(s.arena.roots()[0]);
        assert_eq!((root.range_start, root.range_end), (day(3, 1), None));
    }

    #[test]
    fn run_ids_are_deterministic() {
        assert_eq!(
            run_id(day(3, 1), day(4, 2), None, None),
            "20240301-20240402"
        );
        assert_eq!(
            run_id(day(3, 1), day(4, 2), Some("District Court"), Some("CRIMINAL")),
            "20240301-20240402-district_court-criminal"
        );
    }

    #[tokio::test]
    async fn plain_run_completes_and_aggregates() {
        let f = fixture(test_config());
        let transport = Arc::new(
            MockTransport::new().on("A", MockReply::Rows(numbers("A", 37))),
        );
        let mut s = spider(
            &f,
            transport.clone(),
            RunParams::new(day(3, 1), Some(day(3, 17))),
        );

        let report = s.run(idle_shutdown()).await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.total_cases_added, 37);
        assert_eq!(report.total_cases_processed, 37);
        // One query per prefix child, none for the fan-out root
        assert_eq!(report.total_requests, 2);
        assert_eq!(transport.searches_for(""), 0);

        let a = s.arena.get(find(&s, "A"));
        assert_eq!(a.status, NodeStatus::Complete);
        assert_eq!(a.results.cases_returned, 37);
        assert!(a.children.is_empty());

        // The fan-out root rolls up both children
        let root = s.arena.get(s.arena.roots()[0]);
        assert_eq!(root.status, NodeStatus::InProgress);
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.results.total_cases_added, 37);
        assert_eq!(root.results.total_requests, 2);
        assert_eq!(f.registry.case_count(), 37);
    }

    #[tokio::test]
    async fn overflow_fans_out_refinement_children() {
        let f = fixture(test_config());
        let transport = Arc::new(
            MockTransport::new().on("A", MockReply::Rows(numbers("A", 500))),
        );
        let mut s = spider(
            &f,
            transport,
            RunParams::new(day(3, 1), Some(day(3, 17))),
        );

        let report = s.run(idle_shutdown()).await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);

        let a = s.arena.get(find(&s, "A"));
        assert_eq!(a.status, NodeStatus::InProgress);
        assert_eq!(a.results.cases_returned, 500);
        // 2 * |alphabet| children: direct and space-joined variants
        assert_eq!(a.children.len(), 4);
        let strings: Vec<&str> = a
            .children
            .iter()
            .map(|c| s.arena.get(*c).search_string.as_str())
            .collect();
        assert_eq!(strings, vec!["AA", "AB", "A A", "A B"]);
        // The unscripted children completed with no results
        assert!(a
            .children
            .iter()
            .all(|c| s.arena.get(*c).status == NodeStatus::Complete));
    }

    #[tokio::test]
    async fn timeout_bisects_into_new_root_slices() {
        let f = fixture(test_config());
        let transport = Arc::new(MockTransport::new().on("A", MockReply::Timeout));
        // Two-day range, so the bisection halves are single days
        let mut s = spider(
            &f,
            transport,
            RunParams::new(day(3, 1), Some(day(3, 3))),
        );

        let report = s.run(idle_shutdown()).await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);

        let a = s.arena.get(find(&s, "A"));
        assert_eq!(a.status, NodeStatus::TimeRangeSplit);
        assert!(a.children.is_empty());
        assert_eq!(a.results, NodeResults::default());

        // The original root plus the two bisection slices
        assert_eq!(s.arena.roots().len(), 3);
        let halves: Vec<(NaiveDate, Option<NaiveDate>)> = s.arena.roots()[1..]
            .iter()
            .map(|r| {
                let n = s.arena.get(*r);
                assert_eq!(n.search_string, "A");
                (n.range_start, n.range_end)
            })
            .collect();
        assert_eq!(halves, vec![(day(3, 1), None), (day(3, 2), None)]);
        // Both halves re-ran and finished
        assert!(s.arena.roots()[1..]
            .iter()
            .all(|r| s.arena.get(*r).status == NodeStatus::Complete));
    }

    #[tokio::test]
    async fn single_day_timeout_fails_instead_of_splitting() {
        let f = fixture(test_config());
        let transport = Arc::new(
            MockTransport::new()
                .on("A", MockReply::Timeout)
                .on("A", MockReply::Timeout)
                .on("A", MockReply::Timeout),
        );
        let mut s = spider(&f, transport, RunParams::new(day(3, 1), Some(day(3, 3))));

        s.run(idle_shutdown()).await.unwrap();

        // First timeout split the two-day range; the single-day halves
        // timed out too and could only fail
        let failed: Vec<NodeId> = s
            .arena
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Failed)
            .map(|(id, _)| id)
            .collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|id| s.arena.get(*id).range_end.is_none()));
    }

    #[tokio::test]
    async fn node_failure_stays_local_to_its_subtree() {
        let f = fixture(test_config());
        let transport = Arc::new(
            MockTransport::new()
                .on("A", MockReply::ServerError)
                .on("A", MockReply::ServerError)
                .on("A", MockReply::ServerError)
                .on("B", MockReply::Rows(numbers("B", 5))),
        );
        let mut s = spider(&f, transport, RunParams::new(day(3, 1), Some(day(3, 17))));

        let report = s.run(idle_shutdown()).await.unwrap();
        // The run itself completes; the failure is discoverable in the tree
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.total_cases_added, 5);
        assert_eq!(s.arena.get(find(&s, "A")).status, NodeStatus::Failed);
        assert_eq!(s.arena.get(find(&s, "B")).status, NodeStatus::Complete);
    }

    #[tokio::test]
    async fn cancellation_checkpoints_without_running_nodes() {
        let f = fixture(test_config());
        let transport = Arc::new(MockTransport::new());
        let mut s = spider(
            &f,
            transport.clone(),
            RunParams::new(day(3, 1), Some(day(3, 17))),
        );
        let run_id = s.run_id().to_string();

        let (tx, rx) = watch::channel(true);
        let report = s.run(rx).await.unwrap();
        drop(tx);

        assert_eq!(report.status, RunStatus::Canceled);
        assert!(transport.searches.lock().unwrap().is_empty());

        // The final checkpoint preserved the untouched tree for resume
        let record = f.store.load(&run_id, None).unwrap();
        assert_eq!(record.status, RunStatus::Canceled);
        assert_eq!(record.slices.len(), 1);
        assert_eq!(record.slices[0].status, NodeStatus::New);
    }

    #[tokio::test]
    async fn record_round_trips_through_the_arena() {
        let f = fixture(test_config());
        let transport = Arc::new(
            MockTransport::new().on("A", MockReply::Rows(numbers("A", 500))),
        );
        let mut s = spider(&f, transport, RunParams::new(day(3, 1), Some(day(3, 17))));
        s.run(idle_shutdown()).await.unwrap();

        let record = s.to_record();
        let mut arena = NodeArena::new();
        for slice in record.slices.clone() {
            restore_node(&mut arena, None, slice);
        }

        // Restoration renumbers depth-first, so match nodes by identity
        // rather than by arena index
        assert_eq!(arena.len(), s.arena.len());
        assert_eq!(arena.roots().len(), s.arena.roots().len());
        for (_, original) in s.arena.iter() {
            let restored = arena
                .iter()
                .map(|(_, n)| n)
                .find(|n| {
                    n.search_string == original.search_string
                        && n.range_start == original.range_start
                        && n.range_end == original.range_end
                })
                .unwrap_or_else(|| panic!("missing node {:?}", original.search_string));
            assert_eq!(restored.status, original.status);
            assert_eq!(restored.results, original.results);
            assert_eq!(restored.tallied, original.tallied);
            assert_eq!(restored.children.len(), original.children.len());
        }
    }

    #[tokio::test]
    async fn resume_reenters_only_unfinished_nodes() {
        let f = fixture(test_config());
        let transport = Arc::new(
            MockTransport::new()
                .on("A", MockReply::Rows(numbers("A", 500)))
                .on("AA", MockReply::Rows(numbers("AA", 3))),
        );
        let mut s = spider(
            &f,
            transport,
            RunParams::new(day(3, 1), Some(day(3, 17))),
        );
        let first = s.run(idle_shutdown()).await.unwrap();
        assert_eq!(first.status, RunStatus::Complete);
        let run_id = s.run_id().to_string();
        let added_before = f.registry.case_count();

        // Force a non-terminal persisted state so the run is resumable:
        // overwrite the final record's status as a crash would leave it
        let mut record = s.to_record();
        record.status = RunStatus::InProgress;
        f.store.save(&run_id, record.timestamp, &record).unwrap();

        // The resumed attempt re-enters the overflowed prefix; its result
        // set is already known, so nothing is added twice
        let transport2 = Arc::new(
            MockTransport::new().on("A", MockReply::Rows(numbers("A", 500))),
        );
        let mut resumed = Spider::resume(
            f.config.clone(),
            transport2.clone(),
            f.registry.clone(),
            f.store.clone(),
            &run_id,
            None,
        )
        .unwrap();
        let report = resumed.run(idle_shutdown()).await.unwrap();

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(f.registry.case_count(), added_before);

        // IN_PROGRESS nodes were re-entered; terminal ones were not
        assert_eq!(transport2.searches_for("A"), 1);
        assert_eq!(transport2.searches_for("AA"), 0);
        assert_eq!(transport2.searches_for("B"), 0);

        let a = resumed.arena.get(find(&resumed, "A"));
        assert_eq!(a.status, NodeStatus::InProgress);
        // No duplicate refinement children on re-entry
        assert_eq!(a.children.len(), 4);
        // Counters were not propagated a second time
        assert_eq!(resumed.results().total_cases_added, s.results().total_cases_added);
    }

    #[tokio::test]
    async fn resuming_a_complete_run_is_rejected() {
        let f = fixture(test_config());
        let transport = Arc::new(MockTransport::new());
        let mut s = spider(
            &f,
            transport.clone(),
            RunParams::new(day(3, 1), Some(day(3, 17))),
        );
        s.run(idle_shutdown()).await.unwrap();

        let err = Spider::resume(
            f.config.clone(),
            transport,
            f.registry.clone(),
            f.store.clone(),
            &s.run_id().to_string(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SpiderError::RunComplete { .. }));
    }

    #[test]
    fn rejects_inverted_date_ranges() {
        let f = fixture(test_config());
        let transport: Arc<MockTransport> = Arc::new(MockTransport::new());
        let err = Spider::start(
            f.config.clone(),
            transport,
            f.registry.clone(),
            f.store.clone(),
            RunParams::new(day(3, 10), Some(day(3, 1))),
        )
        .unwrap_err();
        assert!(matches!(err, SpiderError::ValidationFailed { .. }));
    }
}
