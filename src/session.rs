//! # Session Pool Module
//!
//! ## Purpose
//! A fixed-size pool of authenticated session handles. Each session wraps a
//! cookie-carrying HTTP client so the transport can renew it transparently;
//! the pool only concerns itself with checkout/checkin.
//!
//! ## Input/Output Specification
//! - **Input**: HTTP settings, pool size (`concurrency`)
//! - **Output**: Scoped session guards; one session serves one in-flight
//!   query-and-pagination at a time
//! - **Blocking**: `checkout` suspends while the pool is empty
//!
//! ## Key Features
//! - RAII guard returns the session on every exit path, including panics
//! - Checkin is synchronous (unbounded channel), so `Drop` never blocks

use crate::config::HttpConfig;
use crate::errors::{Result, SpiderError};
use chrono::{DateTime, Utc};
use std::ops::Deref;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// One authenticated session against the search site.
///
/// The wrapped client owns the cookie store, so server-side session renewal
/// performed through it is invisible to everything holding the handle.
#[derive(Debug)]
pub struct Session {
    id: usize,
    client: reqwest::Client,
    established: DateTime<Utc>,
}

impl Session {
    pub fn new(id: usize, http: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(http.timeout_seconds))
            .user_agent(http.user_agent.clone())
            .build()
            .map_err(|e| SpiderError::Network {
                details: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            id,
            client,
            established: Utc::now(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn established(&self) -> DateTime<Utc> {
        self.established
    }
}

/// Fixed-size pool of sessions with checkout/checkin semantics
pub struct SessionPool {
    checkin: mpsc::UnboundedSender<Session>,
    available: Mutex<mpsc::UnboundedReceiver<Session>>,
    size: usize,
}

impl SessionPool {
    /// Build a pool of `size` sessions
    pub fn new(http: &HttpConfig, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SpiderError::Config {
                message: "Session pool size must be greater than zero".to_string(),
            });
        }

        let (checkin, available) = mpsc::unbounded_channel();
        for id in 0..size {
            let session = Session::new(id, http)?;
            checkin.send(session).map_err(|_| SpiderError::PoolClosed)?;
        }

        Ok(Self {
            checkin,
            available: Mutex::new(available),
            size,
        })
    }

    /// Check out a session, waiting until one is free
    pub async fn checkout(&self) -> Result<SessionGuard> {
        let mut available = self.available.lock().await;
        let session = available.recv().await.ok_or(SpiderError::PoolClosed)?;
        tracing::trace!("Checked out session {}", session.id);
        Ok(SessionGuard {
            session: Some(session),
            checkin: self.checkin.clone(),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Scoped session handle; returns the session to the pool on drop
pub struct SessionGuard {
    session: Option<Session>,
    checkin: mpsc::UnboundedSender<Session>,
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        // Always Some until drop
        self.session.as_ref().unwrap()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::trace!("Checked in session {}", session.id);
            // Send only fails if the pool itself is gone
            let _ = self.checkin.send(session);
        }
    }
}
