mod request_executor_actor;
mod request_executor_builder;
mod request_executor_error;
mod request_executor_handle;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use url::Url;
use uuid::Uuid;

pub use request_executor_builder::RequestExecutorBuilder;
pub use request_executor_error::{AggregateFailure, RequestExecutorError, ServerErrorBody};
pub use request_executor_handle::RequestExecutor;

use crate::commands::ClientConfiguration;
use crate::conventions::{Conventions, ReadBalanceBehavior};
use crate::events::ExecutorEvent;
use crate::node_selector::NodeSelector;
use crate::response_cache::ResponseCache;

/// Marker for "no request has gone through yet".
const NEVER: u64 = u64::MAX;

pub(crate) enum RequestExecutorMessage {
    /// Schedule a best-effort topology refresh.
    RefreshTopology { force: bool },
    /// Schedule a best-effort client configuration refresh.
    RefreshClientConfiguration,
    /// The stored bootstrap failed; start a fresh one from the last known
    /// URLs instead of reusing the poisoned result.
    RearmBootstrap,
    /// A caller wanted the fastest node but none has converged.
    SpeedTestRequested,
    /// The speed test crowned a fastest node; re-arm the revisit timer.
    SpeedTestConcluded,
}

/// Progress of the first topology update. All callers await the same state;
/// only the actor replaces it.
#[derive(Clone, Debug)]
pub(crate) enum BootstrapState {
    Pending,
    Ready,
    Failed(BootstrapFailure),
}

/// The two bootstrap outcomes that reproduce on every node, kept cloneable so
/// every waiting caller can raise them.
#[derive(Clone, Debug)]
pub(crate) enum BootstrapFailure {
    BadAuthorization,
    DatabaseDoesNotExist(String),
}

impl BootstrapFailure {
    pub(crate) fn classify(error: &RequestExecutorError) -> Option<Self> {
        match error {
            RequestExecutorError::BadAuthorization => Some(Self::BadAuthorization),
            RequestExecutorError::DatabaseDoesNotExist(database) => {
                Some(Self::DatabaseDoesNotExist(database.clone()))
            }
            _ => None,
        }
    }

    pub(crate) fn to_error(&self) -> RequestExecutorError {
        match self {
            Self::BadAuthorization => RequestExecutorError::BadAuthorization,
            Self::DatabaseDoesNotExist(database) => {
                RequestExecutorError::DatabaseDoesNotExist(database.clone())
            }
        }
    }
}

/// State shared between the executor handle (request paths) and the actor
/// (timers, topology swaps, speed tests). Request paths only read the
/// selector and cache through their own synchronization; the actor is the
/// single writer for topology and configuration.
pub(crate) struct ExecutorShared {
    pub(crate) application_id: Uuid,
    pub(crate) database: String,
    pub(crate) conventions: Conventions,
    pub(crate) client: reqwest::Client,
    pub(crate) selector: NodeSelector,
    pub(crate) cache: ResponseCache,
    /// One permit: concurrent refreshers collapse into a single in-flight
    /// topology fetch.
    pub(crate) refresh_gate: Semaphore,
    pub(crate) bootstrap: watch::Sender<BootstrapState>,
    pub(crate) events: broadcast::Sender<ExecutorEvent>,
    pub(crate) sender: mpsc::Sender<RequestExecutorMessage>,
    created_at: Instant,
    last_traffic_ms: AtomicU64,
    topology_source: Mutex<Option<Url>>,
    last_known_urls: Mutex<Vec<Url>>,
    client_configuration: Mutex<Option<ClientConfiguration>>,
}

impl ExecutorShared {
    pub(crate) fn new(
        database: String,
        conventions: Conventions,
        client: reqwest::Client,
        bootstrap: watch::Sender<BootstrapState>,
        sender: mpsc::Sender<RequestExecutorMessage>,
    ) -> Self {
        let cache = ResponseCache::new(conventions.cache_max_weight());
        let (events, _) = broadcast::channel(64);
        Self {
            application_id: Uuid::new_v4(),
            database,
            conventions,
            client,
            selector: NodeSelector::new(crate::topology::Topology::empty()),
            cache,
            refresh_gate: Semaphore::new(1),
            bootstrap,
            events,
            sender,
            created_at: Instant::now(),
            last_traffic_ms: AtomicU64::new(NEVER),
            topology_source: Mutex::new(None),
            last_known_urls: Mutex::new(Vec::new()),
            client_configuration: Mutex::new(None),
        }
    }

    /// Records that a request reached a server just now.
    pub(crate) fn touch_traffic(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_traffic_ms.store(elapsed, Ordering::SeqCst);
    }

    /// True when no request has gone through within the idle window, which is
    /// when the background refresh is worth its round trip.
    pub(crate) fn is_idle(&self) -> bool {
        let last = self.last_traffic_ms.load(Ordering::SeqCst);
        if last == NEVER {
            return true;
        }
        let now = self.created_at.elapsed().as_millis() as u64;
        now.saturating_sub(last) >= self.conventions.traffic_idle_window().as_millis() as u64
    }

    pub(crate) fn set_topology_source(&self, url: Url) {
        *self
            .topology_source
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(url);
    }

    pub(crate) fn topology_source(&self) -> Option<Url> {
        self.topology_source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn remember_urls(&self, urls: &[Url]) {
        *self
            .last_known_urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = urls.to_vec();
    }

    pub(crate) fn last_known_urls(&self) -> Vec<Url> {
        self.last_known_urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs a newer client configuration. Returns whether it was applied;
    /// an applied configuration marks all cached responses possibly stale.
    pub(crate) fn apply_client_configuration(&self, configuration: ClientConfiguration) -> bool {
        {
            let mut guard = self
                .client_configuration
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = *guard {
                if configuration.etag <= current.etag {
                    return false;
                }
            }
            *guard = Some(configuration);
        }
        self.cache.invalidate_all();
        true
    }

    /// The read-balance behavior in force: the server-pushed configuration
    /// wins unless it is disabled or silent on the subject.
    pub(crate) fn effective_read_balance(&self) -> ReadBalanceBehavior {
        let guard = self
            .client_configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *guard {
            Some(configuration) if !configuration.disabled => configuration
                .read_balance_behavior
                .unwrap_or_else(|| self.conventions.read_balance_behavior()),
            _ => self.conventions.read_balance_behavior(),
        }
    }

    pub(crate) fn set_bootstrap_state(&self, state: BootstrapState) {
        // send_replace updates the value even while nobody is waiting on it
        self.bootstrap.send_replace(state);
    }
}
