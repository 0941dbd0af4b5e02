//! # Server Directory
//!
//! Tracks the known set of front-end endpoints and their health, and
//! selects candidates for (re)connection.
//!
//! The directory is the sole owner of server health state. The client
//! only reads selection results and reports outcomes through
//! [`ServerDirectory::mark_bad`] / [`ServerDirectory::mark_good`].
//!
//! Selection policy: entries never marked bad come first in original list
//! order; failed entries follow, oldest failure first. Recently-failed
//! servers are simply deprioritized rather than rotated through, which
//! gives an implicit backoff without extra bookkeeping.

pub mod discovery;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CmError, Result};
use crate::transport::{Endpoint, TransportKind};

pub use discovery::{DiscoveryProvider, DnsDiscovery, StaticDiscovery};

/// One known front-end endpoint plus its mutable health state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub endpoint: Endpoint,
    /// When this endpoint last failed a connect or handshake
    pub last_bad: Option<Instant>,
    /// Consecutive failures since the last success
    pub failures: u32,
}

impl ServerRecord {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            last_bad: None,
            failures: 0,
        }
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    records: Vec<ServerRecord>,
    index: HashMap<SocketAddr, usize>,
    last_refresh: Option<Instant>,
}

impl DirectoryState {
    fn insert(&mut self, endpoint: Endpoint) {
        if self.index.contains_key(&endpoint.addr) {
            return;
        }
        self.index.insert(endpoint.addr, self.records.len());
        self.records.push(ServerRecord::new(endpoint));
    }
}

/// The component tracking known endpoints and their health.
///
/// Internally synchronized; `mark_bad`/`mark_good`/`get_servers` may be
/// called concurrently from the io task and the application.
pub struct ServerDirectory {
    state: Mutex<DirectoryState>,
    provider: Box<dyn DiscoveryProvider>,
}

impl ServerDirectory {
    /// Directory seeded with a bootstrap list and a discovery provider for
    /// fallback refreshes.
    pub fn new(seed: Vec<Endpoint>, provider: Box<dyn DiscoveryProvider>) -> Self {
        let mut state = DirectoryState::default();
        for endpoint in seed {
            state.insert(endpoint);
        }
        Self {
            state: Mutex::new(state),
            provider,
        }
    }

    /// Directory backed only by a static bootstrap list.
    pub fn from_static(seed: Vec<Endpoint>) -> Self {
        Self::new(seed.clone(), Box::new(StaticDiscovery::new(seed)))
    }

    /// Snapshot of candidates, healthiest first.
    ///
    /// Never-marked-bad entries precede all failed entries and keep their
    /// original order; failed entries are ordered oldest-failure-first;
    /// all ties break by original list order.
    pub fn get_servers(&self, filter: Option<TransportKind>) -> Vec<ServerRecord> {
        let state = self.state.lock().expect("directory lock poisoned");

        let mut candidates: Vec<ServerRecord> = state
            .records
            .iter()
            .filter(|r| filter.map_or(true, |kind| r.endpoint.kind == kind))
            .cloned()
            .collect();

        // None sorts before Some, so healthy entries lead; the stable sort
        // breaks ties by original list order.
        candidates.sort_by_key(|r| r.last_bad);
        candidates
    }

    /// Record a connect or handshake failure against an endpoint.
    pub fn mark_bad(&self, endpoint: &Endpoint) {
        let mut state = self.state.lock().expect("directory lock poisoned");
        if let Some(&i) = state.index.get(&endpoint.addr) {
            let record = &mut state.records[i];
            record.last_bad = Some(Instant::now());
            record.failures += 1;
            debug!(addr = %endpoint.addr, failures = record.failures, "marked server bad");
        }
    }

    /// Clear failure state after a successful session.
    pub fn mark_good(&self, endpoint: &Endpoint) {
        let mut state = self.state.lock().expect("directory lock poisoned");
        if let Some(&i) = state.index.get(&endpoint.addr) {
            let record = &mut state.records[i];
            record.last_bad = None;
            record.failures = 0;
            debug!(addr = %endpoint.addr, "marked server good");
        }
    }

    /// Whether the list is empty or older than `max_age`.
    pub fn is_stale(&self, max_age: std::time::Duration) -> bool {
        let state = self.state.lock().expect("directory lock poisoned");
        if state.records.is_empty() {
            return true;
        }
        match state.last_refresh {
            Some(at) => at.elapsed() > max_age,
            None => false, // seeded list, never refreshed
        }
    }

    /// Refresh the known list from the discovery provider.
    ///
    /// New endpoints are appended; existing ones keep their health state.
    ///
    /// # Errors
    /// Discovery failure is an error only when no cached list exists;
    /// otherwise the stale list is kept and the failure logged.
    pub async fn resolve_fallback(&self) -> Result<()> {
        match self.provider.discover().await {
            Ok(endpoints) => {
                let mut state = self.state.lock().expect("directory lock poisoned");
                let before = state.records.len();
                for endpoint in endpoints {
                    state.insert(endpoint);
                }
                state.last_refresh = Some(Instant::now());
                info!(
                    known = state.records.len(),
                    added = state.records.len() - before,
                    "refreshed server list"
                );
                Ok(())
            }
            Err(e) => {
                let cached = !self.state.lock().expect("directory lock poisoned").records.is_empty();
                if cached {
                    warn!(error = %e, "discovery failed, keeping cached server list");
                    Ok(())
                } else {
                    Err(CmError::Discovery(format!(
                        "discovery failed with no cached servers: {e}"
                    )))
                }
            }
        }
    }

    /// Current endpoints, for embedders that persist the list between runs.
    pub fn endpoints_snapshot(&self) -> Vec<Endpoint> {
        let state = self.state.lock().expect("directory lock poisoned");
        state.records.iter().map(|r| r.endpoint.clone()).collect()
    }
}
