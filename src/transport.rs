//! # Search Transport Module
//!
//! ## Purpose
//! Executes one search exchange (or "next page" exchange) against the
//! external case-search endpoint and classifies the outcome. Owns everything
//! the scheduler must not care about: session renewal, transient retries,
//! and extraction of case rows from the response body.
//!
//! ## Input/Output Specification
//! - **Input**: A search query (prefix, date range, optional court/site) and
//!   a pooled session
//! - **Output**: A classified `SearchOutcome`: rows, no-results, timeout, or
//!   server error
//! - **Retries**: One immediate retry on transient faults; a second
//!   consecutive failure surfaces to the node. Expired sessions are renewed
//!   transparently and the request replayed.
//!
//! ## Key Features
//! - `Transport` trait seam so the scheduler can be driven by mocks
//! - Configurable substring matchers for the endpoint's terminal conditions
//! - Timeout is an outcome, never an error: it drives date-range bisection

use crate::config::{Config, HttpConfig, SearchConfig};
use crate::errors::{Result, SpiderError};
use crate::session::Session;
use crate::{form_date, Case};
use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, warn};

/// One unit of query input: prefix, date range, optional filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub prefix: String,
    pub start: NaiveDate,
    /// `None` means a single-day query with an unbounded upper edge
    pub end: Option<NaiveDate>,
    pub court: Option<String>,
    pub site: Option<String>,
}

/// One page of search results
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub rows: Vec<Case>,
    /// Absolute URL of the next page, when the server offers one
    pub next: Option<String>,
    /// The server explicitly said the result set exceeds its cap
    pub overflowed: bool,
    /// The URL this page was fetched from
    pub url: String,
}

/// Classified result of one search exchange
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// Success with at least one row
    Rows(Page),
    /// The query matched nothing
    NoResults,
    /// The query ran past the endpoint's time budget
    Timeout,
    /// A 5xx/overload response; retryable against the node's error budget
    ServerError { status: u16 },
}

/// The search capability consumed by node execution.
///
/// The transport is responsible for session renewal; the scheduler never
/// inspects authentication state.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a fresh search
    async fn search(&self, session: &Session, query: &SearchQuery) -> Result<SearchOutcome>;

    /// Follow a page's "next" link
    async fn next_page(&self, session: &Session, page: &Page) -> Result<SearchOutcome>;

    /// Re-establish an authenticated session after expiry
    async fn renew_session(&self, session: &Session) -> Result<()>;
}

enum Classified {
    Outcome(SearchOutcome),
    Expired,
}

/// Concrete transport against the real site
pub struct HttpTransport {
    http: HttpConfig,
    search: SearchConfig,
    row_re: Regex,
    next_re: Regex,
    loc_re: Regex,
    detail_loc_re: Regex,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        // One results row: linked case number, then caption, court, type,
        // filing date, and status cells. The markup is the site's contract;
        // anything that stops matching is an unrecoverable shape change.
        let row_re = Regex::new(
            r#"(?i)<tr[^>]*>\s*<td[^>]*>\s*<a[^>]*href="(?P<href>[^"]+)"[^>]*>(?P<number>[^<]+)</a>\s*</td>\s*<td[^>]*>(?P<caption>[^<]*)</td>\s*<td[^>]*>(?P<court>[^<]*)</td>\s*<td[^>]*>(?P<kind>[^<]*)</td>\s*<td[^>]*>(?P<filed>[^<]*)</td>\s*<td[^>]*>(?P<status>[^<]*)</td>"#,
        )
        .map_err(|e| SpiderError::Internal {
            message: format!("Invalid row pattern: {}", e),
        })?;

        let next_re = Regex::new(r#"(?i)<a[^>]*href="(?P<href>[^"]+)"[^>]*>\s*Next\b"#).map_err(
            |e| SpiderError::Internal {
                message: format!("Invalid next-link pattern: {}", e),
            },
        )?;

        let loc_re = Regex::new(r#"[?&]loc=([^&"]+)"#).map_err(|e| SpiderError::Internal {
            message: format!("Invalid loc pattern: {}", e),
        })?;

        let detail_loc_re =
            Regex::new(r#"[?&]detailLoc=([^&"]+)"#).map_err(|e| SpiderError::Internal {
                message: format!("Invalid detailLoc pattern: {}", e),
            })?;

        Ok(Self {
            http: config.http.clone(),
            search: config.search.clone(),
            row_re,
            next_re,
            loc_re,
            detail_loc_re,
        })
    }

    fn search_url(&self) -> String {
        format!(
            "{}{}",
            self.http.base_url.trim_end_matches('/'),
            self.http.search_path
        )
    }

    fn absolute(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else {
            format!(
                "{}/{}",
                self.http.base_url.trim_end_matches('/'),
                href.trim_start_matches('/')
            )
        }
    }

    fn search_form(&self, query: &SearchQuery) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("searchString", query.prefix.clone()),
            ("filingStart", form_date::render(&query.start)),
            ("action", "Search".to_string()),
        ];
        if let Some(end) = query.end {
            form.push(("filingEnd", form_date::render(&end)));
        }
        if let Some(court) = &query.court {
            form.push(("court", court.clone()));
        }
        if let Some(site) = &query.site {
            form.push(("site", site.clone()));
        }
        form
    }

    /// Run one exchange with the transport-level retry and renewal policy
    async fn exchange(
        &self,
        session: &Session,
        request: reqwest::RequestBuilder,
    ) -> Result<SearchOutcome> {
        let mut transient_retries = 1u32;
        let mut renewals = 1u32;

        loop {
            let attempt = request.try_clone().ok_or_else(|| SpiderError::Internal {
                message: "Search request cannot be cloned for retry".to_string(),
            })?;

            match self.send_classified(session, attempt).await {
                Ok(Classified::Outcome(outcome)) => return Ok(outcome),
                Ok(Classified::Expired) => {
                    if renewals == 0 {
                        return Err(SpiderError::SessionRenewal {
                            details: "Session still unauthenticated after renewal".to_string(),
                        });
                    }
                    renewals -= 1;
                    debug!("Session {} expired; renewing", session.id());
                    self.renew_session(session).await?;
                }
                Err(e) if e.is_recoverable() && transient_retries > 0 => {
                    transient_retries -= 1;
                    warn!("Transient transport fault, retrying once: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_classified(
        &self,
        _session: &Session,
        request: reqwest::RequestBuilder,
    ) -> Result<Classified> {
        let response = match request.send().await {
            Ok(response) => response,
            // Client-side timeout is the endpoint's "query too broad" signal
            Err(e) if e.is_timeout() => return Ok(Classified::Outcome(SearchOutcome::Timeout)),
            Err(e) => {
                return Err(SpiderError::Network {
                    details: e.to_string(),
                })
            }
        };

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Ok(Classified::Outcome(SearchOutcome::ServerError {
                status: status.as_u16(),
            }));
        }

        let url = response.url().to_string();
        let body = response.text().await.map_err(|e| SpiderError::Network {
            details: format!("Failed to read response body: {}", e),
        })?;

        if self.session_expired(&url, &body) {
            return Ok(Classified::Expired);
        }

        self.parse_results(&body, &url).map(Classified::Outcome)
    }

    fn session_expired(&self, url: &str, body: &str) -> bool {
        let url = url.to_lowercase();
        let body = body.to_lowercase();
        self.http
            .session_markers
            .iter()
            .any(|m| !m.is_empty() && (body.contains(&m.to_lowercase()) || url.contains(&m.to_lowercase())))
    }

    fn matches_any(body: &str, markers: &[String]) -> bool {
        markers
            .iter()
            .any(|m| !m.is_empty() && body.contains(&m.to_lowercase()))
    }

    /// Classify a success body and extract its rows
    fn parse_results(&self, body: &str, url: &str) -> Result<SearchOutcome> {
        let lowered = body.to_lowercase();

        if Self::matches_any(&lowered, &self.search.timeout_markers) {
            return Ok(SearchOutcome::Timeout);
        }
        if Self::matches_any(&lowered, &self.search.no_results_markers) {
            return Ok(SearchOutcome::NoResults);
        }
        let overflowed = Self::matches_any(&lowered, &self.search.overflow_markers);

        let mut rows = Vec::new();
        for caps in self.row_re.captures_iter(body) {
            let href = caps.name("href").map(|m| m.as_str()).unwrap_or_default();
            let filed_text = caps
                .name("filed")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();

            let cell = |name: &str| {
                caps.name(name)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default()
            };
            let optional_cell = |name: &str| {
                let value = cell(name);
                (!value.is_empty()).then_some(value)
            };

            rows.push(Case {
                case_number: cell("number"),
                court: cell("court"),
                case_type: optional_cell("kind"),
                status: optional_cell("status"),
                filing_date: form_date::parse(&filed_text).ok(),
                filing_date_text: filed_text,
                caption: cell("caption"),
                location: self
                    .loc_re
                    .captures(href)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                detail_location: self
                    .detail_loc_re
                    .captures(href)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                detail_url: (!href.is_empty()).then(|| self.absolute(href)),
                source_url: url.to_string(),
            });
        }

        if rows.is_empty() && !overflowed {
            // A success page with no recognizable table means the site's
            // markup contract changed; never retried
            return Err(SpiderError::UnexpectedContent {
                url: url.to_string(),
                details: "No result rows or terminal markers in response".to_string(),
            });
        }

        let next = self
            .next_re
            .captures(body)
            .and_then(|c| c.name("href"))
            .map(|m| self.absolute(m.as_str()));

        debug!("Parsed {} rows from {} (next page: {})", rows.len(), url, next.is_some());

        Ok(SearchOutcome::Rows(Page {
            rows,
            next,
            overflowed,
            url: url.to_string(),
        }))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn search(&self, session: &Session, query: &SearchQuery) -> Result<SearchOutcome> {
        let request = session
            .client()
            .post(self.search_url())
            .form(&self.search_form(query));
        self.exchange(session, request).await
    }

    async fn next_page(&self, session: &Session, page: &Page) -> Result<SearchOutcome> {
        let next = page.next.as_ref().ok_or_else(|| SpiderError::Internal {
            message: "next_page called on a page without a next link".to_string(),
        })?;
        let request = session.client().get(next);
        self.exchange(session, request).await
    }

    async fn renew_session(&self, session: &Session) -> Result<()> {
        let base = self.http.base_url.trim_end_matches('/');

        // Landing page sets the session cookie
        session
            .client()
            .get(base)
            .send()
            .await
            .map_err(|e| SpiderError::SessionRenewal {
                details: format!("Failed to reach landing page: {}", e),
            })?;

        // Accepting the disclaimer authenticates the session
        let response = session
            .client()
            .post(format!("{}{}", base, self.http.disclaimer_path))
            .form(&[("disclaimer", "Y"), ("action", "Continue")])
            .send()
            .await
            .map_err(|e| SpiderError::SessionRenewal {
                details: format!("Failed to accept disclaimer: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(SpiderError::SessionRenewal {
                details: format!("Disclaimer acceptance returned {}", response.status()),
            });
        }

        debug!(
            "Renewed session {} (established {})",
            session.id(),
            session.established()
        );
        Ok(())
    }
}
