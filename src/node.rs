//! # Search Node Module
//!
//! ## Purpose
//! The search-space partitioning tree. Each node is one schedulable unit of
//! work, a text prefix plus a date range, with a small state machine that
//! decides, from the outcome of its own query, whether the space under it
//! must be refined (overflow), bisected (timeout), or is finished.
//!
//! ## Input/Output Specification
//! - **Input**: A node snapshot plus the shared transport/registry/session
//!   capabilities
//! - **Output**: An execution outcome the orchestration loop applies to the
//!   tree: completion counters, refinement fan-out, bisection, or failure
//! - **Invariants**: `TIME_RANGE_SPLIT` and `FAILED` nodes are terminal;
//!   children exist only after an observed overflow; bisection bottoms out
//!   at single-day (null end-date) ranges
//!
//! ## Tree representation
//! Nodes live in an arena addressed by index, with parent/child links as
//! indices. Execution tasks receive value snapshots and never touch the
//! arena; all tree mutation happens on the orchestration loop, so counter
//! propagation needs no cross-node locking.

use crate::config::SearchConfig;
use crate::errors::Result;
use crate::registry::Registry;
use crate::session::SessionPool;
use crate::transport::{SearchOutcome, SearchQuery, Transport};
use crate::Case;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Index of a node within its arena
pub type NodeId = usize;

/// Node lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    New,
    InProgress,
    Complete,
    TimeRangeSplit,
    Failed,
}

/// Per-node result counters, plus the rolled-up subtree totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResults {
    /// Rows seen, duplicates included
    pub cases_returned: u64,
    /// Distinct case numbers within this execution's result set
    pub distinct_cases: u64,
    /// Distinct cases not previously known to the registry
    pub cases_added: u64,
    /// Page requests issued
    pub requests: u64,
    /// Subtree totals, updated by additive propagation on first completion
    pub total_cases_added: u64,
    pub total_distinct_cases: u64,
    pub total_requests: u64,
}

/// One schedulable unit: a prefix, a date range, and execution state
#[derive(Debug, Clone)]
pub struct SearchNode {
    /// Prefix text; empty for date-only root slices awaiting fan-out
    pub search_string: String,
    pub range_start: NaiveDate,
    /// `None` means a single day with an unbounded upper edge
    pub range_end: Option<NaiveDate>,
    pub status: NodeStatus,
    /// When this node last executed
    pub timestamp: Option<DateTime<Utc>>,
    pub results: NodeResults,
    /// Counters already propagated to ancestors; guards resumes
    pub tallied: bool,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl SearchNode {
    pub fn new(
        search_string: impl Into<String>,
        range_start: NaiveDate,
        range_end: Option<NaiveDate>,
    ) -> Self {
        Self {
            search_string: search_string.into(),
            range_start,
            range_end,
            status: NodeStatus::New,
            timestamp: None,
            results: NodeResults::default(),
            tallied: false,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Terminal nodes are never re-executed and never gain children
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            NodeStatus::Complete | NodeStatus::TimeRangeSplit | NodeStatus::Failed
        )
    }

    /// A date-only slice that fans out rather than querying
    pub fn is_root_slice(&self) -> bool {
        self.search_string.is_empty()
    }
}

/// Index-addressed node tree; roots are the Spider's top-level slices
#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<SearchNode>,
    roots: Vec<NodeId>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn get(&self, id: NodeId) -> &SearchNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut SearchNode {
        &mut self.nodes[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &SearchNode)> {
        self.nodes.iter().enumerate()
    }

    /// Attach a new top-level slice
    pub fn push_root(&mut self, node: SearchNode) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.roots.push(id);
        id
    }

    /// Attach a child under `parent`
    pub fn push_child(&mut self, parent: NodeId, mut node: SearchNode) -> NodeId {
        let id = self.nodes.len();
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent].children.push(id);
        id
    }

    /// Propagate a node's own counters additively into its own and every
    /// ancestor's `total_*` fields. Runs at most once per node.
    pub fn tally(&mut self, id: NodeId) {
        if self.nodes[id].tallied {
            return;
        }
        let (added, distinct, requests) = {
            let r = &self.nodes[id].results;
            (r.cases_added, r.distinct_cases, r.requests)
        };

        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = &mut self.nodes[current];
            node.results.total_cases_added += added;
            node.results.total_distinct_cases += distinct;
            node.results.total_requests += requests;
            cursor = node.parent;
        }
        self.nodes[id].tallied = true;
    }
}

/// Children of a pending root slice: one per alphabet symbol, sharing the
/// slice's date range. The space never leads.
pub fn slice_children(
    start: NaiveDate,
    end: Option<NaiveDate>,
    symbols: &[char],
) -> Vec<SearchNode> {
    symbols
        .iter()
        .map(|c| SearchNode::new(c.to_string(), start, end))
        .collect()
}

/// Refinement fan-out for an overflowed prefix: every symbol appended
/// directly, then every symbol appended behind a space. Trailing spaces
/// collapse to the same server-side result set, so a bare space child is
/// never generated.
pub fn refinement_children(
    prefix: &str,
    start: NaiveDate,
    end: Option<NaiveDate>,
    symbols: &[char],
) -> Vec<SearchNode> {
    let mut children = Vec::with_capacity(symbols.len() * 2);
    for c in symbols {
        children.push(SearchNode::new(format!("{}{}", prefix, c), start, end));
    }
    for c in symbols {
        children.push(SearchNode::new(format!("{} {}", prefix, c), start, end));
    }
    children
}

/// Bisect a timed-out node's date range at the midpoint, day granularity.
///
/// Returns the two replacement slices, or `None` for a single-day range,
/// which cannot split further. A half that collapses to one day gets a null
/// end-date. A two-day range yields two single-day nodes.
pub fn bisect(prefix: &str, start: NaiveDate, end: Option<NaiveDate>) -> Option<(SearchNode, SearchNode)> {
    let end = end?;
    let span = (end - start).num_days();
    if span < 1 {
        return None;
    }

    let bounded = |s: NaiveDate, e: NaiveDate| {
        if s == e {
            SearchNode::new(prefix, s, None)
        } else {
            SearchNode::new(prefix, s, Some(e))
        }
    };

    let mid = start + Duration::days(span / 2);
    Some((bounded(start, mid), bounded(mid + Duration::days(1), end)))
}

/// Immutable view of one node, handed to its execution task
#[derive(Debug, Clone)]
pub(crate) struct NodeSnapshot {
    pub id: NodeId,
    pub search_string: String,
    pub range_start: NaiveDate,
    pub range_end: Option<NaiveDate>,
    pub has_children: bool,
}

impl NodeSnapshot {
    pub fn of(id: NodeId, node: &SearchNode) -> Self {
        Self {
            id,
            search_string: node.search_string.clone(),
            range_start: node.range_start,
            range_end: node.range_end,
            has_children: !node.children.is_empty(),
        }
    }
}

/// Capabilities shared by every execution task
pub(crate) struct ExecShared {
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<dyn Registry>,
    pub sessions: Arc<SessionPool>,
    pub search: SearchConfig,
    pub court: Option<String>,
    pub site: Option<String>,
}

/// Counters gathered during one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ExecCounters {
    pub cases_returned: u64,
    pub distinct_cases: u64,
    pub cases_added: u64,
    pub requests: u64,
}

/// What happened when a node executed; applied to the tree by the loop
#[derive(Debug)]
pub(crate) enum ExecOutcome {
    /// A root slice that still needs its per-symbol fan-out
    RootExpansionPending,
    /// A re-entered root slice whose fan-out already exists
    AlreadyExpanded,
    Completed(ExecCounters),
    /// Saw the row cap or an explicit overflow signal
    Overflowed(ExecCounters),
    TimedOut,
    Failed { reason: String, counters: ExecCounters },
}

/// Execute one node: query, page, deduplicate, record.
///
/// Business failures (double transport faults, unexpected content, exhausted
/// server-error budget) come back as `ExecOutcome::Failed` and stay local to
/// the node's subtree. Only infrastructure faults (pool shutdown, registry
/// errors) propagate as `Err` and fail the run.
pub(crate) async fn execute(snapshot: NodeSnapshot, shared: &ExecShared) -> Result<ExecOutcome> {
    if snapshot.search_string.is_empty() {
        return Ok(if snapshot.has_children {
            ExecOutcome::AlreadyExpanded
        } else {
            ExecOutcome::RootExpansionPending
        });
    }

    let query = SearchQuery {
        prefix: snapshot.search_string.clone(),
        start: snapshot.range_start,
        end: snapshot.range_end,
        court: shared.court.clone(),
        site: shared.site.clone(),
    };

    // One session for the whole query-and-pagination; the guard returns it
    // to the pool on every exit path
    let session = shared.sessions.checkout().await?;

    let mut counters = ExecCounters::default();
    let mut server_errors = 0u32;

    // Initial page, retried against the node's server-error budget
    let mut page = loop {
        counters.requests += 1;
        match shared.transport.search(&session, &query).await {
            Ok(SearchOutcome::Rows(page)) => break page,
            Ok(SearchOutcome::NoResults) => return Ok(ExecOutcome::Completed(counters)),
            Ok(SearchOutcome::Timeout) => return Ok(ExecOutcome::TimedOut),
            Ok(SearchOutcome::ServerError { status }) => {
                server_errors += 1;
                if server_errors >= shared.search.max_server_errors {
                    return Ok(ExecOutcome::Failed {
                        reason: format!(
                            "{} consecutive server errors (last: HTTP {})",
                            server_errors, status
                        ),
                        counters,
                    });
                }
                warn!(
                    "Server error {} for prefix {:?} ({}/{})",
                    status, query.prefix, server_errors, shared.search.max_server_errors
                );
            }
            Err(e) => {
                return Ok(ExecOutcome::Failed {
                    reason: e.to_string(),
                    counters,
                })
            }
        }
    };

    // Follow "next page" links until no link remains or the row cap is hit
    let mut rows: Vec<Case> = Vec::new();
    let mut overflowed = false;
    loop {
        overflowed |= page.overflowed;
        rows.append(&mut page.rows);
        if rows.len() >= shared.search.row_cap || page.next.is_none() {
            break;
        }

        counters.requests += 1;
        match shared.transport.next_page(&session, &page).await {
            Ok(SearchOutcome::Rows(next)) => page = next,
            Ok(SearchOutcome::NoResults) => break,
            Ok(SearchOutcome::Timeout) => return Ok(ExecOutcome::TimedOut),
            Ok(SearchOutcome::ServerError { status }) => {
                server_errors += 1;
                if server_errors >= shared.search.max_server_errors {
                    return Ok(ExecOutcome::Failed {
                        reason: format!(
                            "{} consecutive server errors (last: HTTP {})",
                            server_errors, status
                        ),
                        counters,
                    });
                }
                warn!(
                    "Server error {} while paging prefix {:?} ({}/{})",
                    status, query.prefix, server_errors, shared.search.max_server_errors
                );
            }
            Err(e) => {
                return Ok(ExecOutcome::Failed {
                    reason: e.to_string(),
                    counters,
                })
            }
        }
    }

    counters.cases_returned = rows.len() as u64;

    // A case number can repeat within one page or across pages
    let mut distinct: BTreeMap<String, Case> = BTreeMap::new();
    for case in rows {
        distinct.entry(case.case_number.clone()).or_insert(case);
    }
    counters.distinct_cases = distinct.len() as u64;

    let numbers: Vec<String> = distinct.keys().cloned().collect();
    let known = shared.registry.exists(&numbers).await?;
    let fresh: Vec<Case> = distinct
        .into_values()
        .filter(|case| !known.contains(&case.case_number))
        .collect();
    counters.cases_added = shared.registry.insert_and_publish(&fresh).await? as u64;

    drop(session);

    if counters.cases_returned as usize >= shared.search.row_cap || overflowed {
        Ok(ExecOutcome::Overflowed(counters))
    } else {
        Ok(ExecOutcome::Completed(counters))
    }
}
