use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{instrument, Span};
use url::Url;
use uuid::Uuid;

use crate::cluster_command::{ClusterCommand, SessionInfo};
use crate::commands::{GetDatabaseTopologyCommand, HealthCheckCommand};
use crate::conventions::ReadBalanceBehavior;
use crate::events::ExecutorEvent;
use crate::node_selector::NodeStatistics;
use crate::server_node::ServerNode;
use crate::topology::Topology;

use super::request_executor_actor::{run_request_executor_actor, RequestExecutorActor};
use super::request_executor_builder::{ExecutorInitialConfiguration, RequestExecutorBuilder};
use super::request_executor_error::{AggregateFailure, ServerErrorBody};
use super::{BootstrapState, ExecutorShared, RequestExecutorError, RequestExecutorMessage};

/**
Handle to the request-execution layer for one database.

Cloning is cheap and shares the topology, the node selector, and the response
cache; create one executor per database cluster and hand clones to whoever
needs to run commands. The backing actor task keeps the topology fresh in the
background and stops when the last handle is dropped.
*/
#[derive(Clone)]
pub struct RequestExecutor {
    inner: Arc<ExecutorShared>,
}

/// How one attempt against one node ended. The retry loop matches on this
/// instead of unwinding through errors, so every control path is spelled out.
enum Outcome {
    /// The command has its result (or a deliberate empty result).
    Done,
    /// Worth trying another node.
    Retryable {
        error: RequestExecutorError,
        /// True for 410: the node answered but no longer owns the data.
        gone: bool,
    },
    /// Deterministic failure; retrying any node would reproduce it.
    Fatal(RequestExecutorError),
}

/// Failure bookkeeping for one logical `execute` call chain.
///
/// The failed-node set only grows, except for a single clearing when the
/// topology etag advances past the watermark recorded at the first failure: a
/// fresh topology forgives nodes that failed under a superseded membership,
/// without allowing an infinite failover loop.
struct FailoverState {
    failures: Vec<(ServerNode, RequestExecutorError)>,
    watermark: Option<i64>,
    forgiven: bool,
    saw_gone: bool,
    forced_refresh: bool,
}

impl FailoverState {
    fn new() -> Self {
        Self {
            failures: Vec::new(),
            watermark: None,
            forgiven: false,
            saw_gone: false,
            forced_refresh: false,
        }
    }

    fn record(&mut self, node: ServerNode, error: RequestExecutorError, etag: i64, gone: bool) {
        if self.watermark.is_none() {
            self.watermark = Some(etag);
        }
        self.saw_gone |= gone;
        self.failures.push((node, error));
    }

    fn forgive_if_topology_advanced(&mut self, etag: i64) {
        if self.forgiven || self.failures.is_empty() {
            return;
        }
        if let Some(watermark) = self.watermark {
            if etag > watermark {
                self.failures.clear();
                self.forgiven = true;
            }
        }
    }

    fn distinct_nodes(&self) -> usize {
        self.failures
            .iter()
            .map(|(node, _)| node)
            .collect::<HashSet<_>>()
            .len()
    }

    /// The error surfaced at exhaustion: the bare underlying error when only
    /// one node was involved, an aggregate naming every node otherwise.
    fn into_error(mut self, topology_source: Option<Url>) -> RequestExecutorError {
        if self.failures.len() == 1 {
            let (_, error) = self.failures.remove(0);
            return error;
        }
        RequestExecutorError::AllNodesFailed(AggregateFailure {
            failures: self.failures,
            topology_source,
        })
    }
}

impl RequestExecutor {
    pub fn builder() -> RequestExecutorBuilder {
        RequestExecutorBuilder::default()
    }

    pub(crate) fn new(configuration: ExecutorInitialConfiguration) -> Self {
        let (sender, receiver) = mpsc::channel(8);
        let (bootstrap, _) = watch::channel(BootstrapState::Pending);
        let inner = Arc::new(ExecutorShared::new(
            configuration.database,
            configuration.conventions,
            configuration.client,
            bootstrap,
            sender,
        ));
        inner.remember_urls(&configuration.urls);

        let actor =
            RequestExecutorActor::new(Arc::clone(&inner), receiver, configuration.urls);
        tokio::spawn(run_request_executor_actor(actor));

        Self { inner }
    }

    pub(crate) fn from_shared(inner: Arc<ExecutorShared>) -> Self {
        Self { inner }
    }

    /// Runs a command against the cluster, with node selection, caching, and
    /// failover. The command holds its parsed result afterwards.
    #[instrument(
        level = "debug",
        name = "Execute command",
        skip(self, command, session_info),
        fields(correlation_id, database = %self.inner.database)
    )]
    pub async fn execute<C: ClusterCommand>(
        &self,
        command: &mut C,
        session_info: Option<&SessionInfo>,
    ) -> Result<(), RequestExecutorError> {
        let correlation_id = Uuid::new_v4().to_string();
        Span::current().record("correlation_id", correlation_id.as_str());
        self.ensure_bootstrapped().await?;
        let (index, node) = self.choose_node(command, session_info)?;
        self.execute_on_node(node, Some(index), command, true, session_info)
            .await
    }

    /// Lower-level entry point for callers that already know which node to
    /// target. With `should_retry` false the first transient failure is
    /// returned instead of failing over.
    pub async fn execute_on_node<C: ClusterCommand>(
        &self,
        node: ServerNode,
        node_index: Option<usize>,
        command: &mut C,
        should_retry: bool,
        session_info: Option<&SessionInfo>,
    ) -> Result<(), RequestExecutorError> {
        let mut current_node = node;
        let mut current_index = node_index;
        let mut failover = FailoverState::new();

        loop {
            failover.forgive_if_topology_advanced(self.inner.selector.topology_etag());

            match self
                .send_attempt(&current_node, current_index, command, session_info)
                .await
            {
                Outcome::Done => {
                    if let Some(index) = current_index {
                        self.inner.selector.restore_node(index);
                    }
                    let _ = self.inner.events.send(ExecutorEvent::RequestSucceeded {
                        url: current_node.url.to_string(),
                    });
                    return Ok(());
                }
                Outcome::Fatal(error) => {
                    let _ = self.inner.events.send(ExecutorEvent::RequestFailed {
                        url: current_node.url.to_string(),
                    });
                    return Err(error);
                }
                Outcome::Retryable { error, gone } => {
                    tracing::warn!(
                        "Request to `{}` failed. Caused by: {}",
                        current_node.url,
                        error
                    );
                    if let Some(index) = current_index {
                        self.inner.selector.record_failure(index);
                    }
                    let _ = self.inner.events.send(ExecutorEvent::RequestFailed {
                        url: current_node.url.to_string(),
                    });
                    failover.record(
                        current_node.clone(),
                        error,
                        self.inner.selector.topology_etag(),
                        gone,
                    );

                    if !should_retry {
                        return Err(failover.into_error(self.inner.topology_source()));
                    }

                    if failover.distinct_nodes() >= self.inner.selector.node_count() {
                        if failover.saw_gone && !failover.forced_refresh {
                            // every addressed node disowned the data; only a
                            // fresh topology can still save this request
                            failover.forced_refresh = true;
                            let wait = self.inner.conventions.request_timeout();
                            if let Err(refresh_error) = self.update_topology(true, wait).await {
                                tracing::warn!(
                                    "Forced topology refresh failed. Caused by: {}",
                                    refresh_error
                                );
                            }
                        } else {
                            return Err(failover.into_error(self.inner.topology_source()));
                        }
                    }

                    let (next_index, next_node) = self.choose_node(command, session_info)?;
                    current_index = Some(next_index);
                    current_node = next_node;
                }
            }
        }
    }

    /// Validates that a single node is reachable, without failover.
    pub async fn health_check(&self, node: &ServerNode) -> Result<(), RequestExecutorError> {
        let mut command = HealthCheckCommand::new();
        self.execute_on_node(node.clone(), None, &mut command, false, None)
            .await
    }

    /// Best-effort topology refresh, collapsed with any refresh already in
    /// flight. Waits up to `wait` for the single-flight gate and returns
    /// `Ok(false)` without refreshing when it stays busy; refresh is an
    /// optimization, never a requirement the caller must block on.
    #[instrument(level = "debug", skip(self))]
    pub async fn update_topology(
        &self,
        force: bool,
        wait: Duration,
    ) -> Result<bool, RequestExecutorError> {
        let permit = match tokio::time::timeout(wait, self.inner.refresh_gate.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => return Ok(false),
        };

        let (index, node) = self.inner.selector.preferred_node()?;
        let mut command = GetDatabaseTopologyCommand::new(
            self.inner.database.clone(),
            self.inner.application_id,
        );
        match self.send_attempt(&node, Some(index), &mut command, None).await {
            Outcome::Done => {
                self.inner.selector.restore_node(index);
            }
            Outcome::Retryable { error, .. } => {
                self.inner.selector.record_failure(index);
                return Err(error);
            }
            Outcome::Fatal(error) => return Err(error),
        }

        let topology = command
            .into_result()
            .ok_or_else(|| anyhow!("The topology response contained no topology"))?;
        let etag = topology.etag;
        let urls: Vec<Url> = topology.nodes.iter().map(|n| n.url.clone()).collect();

        let changed = self.inner.selector.on_topology_update(topology, force);
        if changed {
            self.inner.set_topology_source(node.url.clone());
            self.inner.remember_urls(&urls);
            let _ = self
                .inner
                .events
                .send(ExecutorEvent::TopologyUpdated { etag });
            tracing::debug!("Topology updated to etag {}", etag);
        }

        drop(permit);
        Ok(true)
    }

    /// Snapshot of the topology currently routing requests.
    pub fn topology(&self) -> Topology {
        self.inner.selector.topology()
    }

    /// Per-node failure and request counters for operational tooling.
    pub fn node_statistics(&self) -> Vec<NodeStatistics> {
        self.inner.selector.node_statistics()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.inner.events.subscribe()
    }

    /// Marks every cached response possibly stale without walking the cache.
    pub fn invalidate_cached_responses(&self) {
        self.inner.cache.invalidate_all();
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    /// Blocks until the first topology update finished, re-arming it once if
    /// the stored attempt already failed.
    async fn ensure_bootstrapped(&self) -> Result<(), RequestExecutorError> {
        let mut receiver = self.inner.bootstrap.subscribe();
        let mut rearmed = false;
        loop {
            let state = receiver.borrow_and_update().clone();
            match state {
                BootstrapState::Ready => return Ok(()),
                BootstrapState::Pending => {
                    if receiver.changed().await.is_err() {
                        return Err(anyhow!("The request executor task has been killed").into());
                    }
                }
                BootstrapState::Failed(failure) => {
                    if rearmed {
                        return Err(failure.to_error());
                    }
                    rearmed = true;
                    let _ = self
                        .inner
                        .sender
                        .send(RequestExecutorMessage::RearmBootstrap)
                        .await;
                    if receiver.changed().await.is_err() {
                        return Err(failure.to_error());
                    }
                }
            }
        }
    }

    fn choose_node<C: ClusterCommand>(
        &self,
        command: &C,
        session_info: Option<&SessionInfo>,
    ) -> Result<(usize, ServerNode), RequestExecutorError> {
        let selector = &self.inner.selector;

        if let Some(tag) = command.selected_node_tag() {
            if let Some(found) = selector.requested_node(tag) {
                return Ok(found);
            }
            return selector.preferred_node();
        }

        if !command.is_read_request() {
            // writes stick to the preferred node and are never fanned out
            return selector.preferred_node();
        }

        match self.inner.effective_read_balance() {
            ReadBalanceBehavior::None => selector.preferred_node(),
            ReadBalanceBehavior::RoundRobin => selector.node_for_session(
                session_info.map(|session| session.session_id).unwrap_or(0),
            ),
            ReadBalanceBehavior::FastestNode => match selector.fastest_node() {
                Some(found) => Ok(found),
                None => {
                    if selector.begin_speed_test() {
                        let _ = self
                            .inner
                            .sender
                            .try_send(RequestExecutorMessage::SpeedTestRequested);
                    }
                    selector.preferred_node()
                }
            },
        }
    }

    /// One attempt against one node: cache consultation, the network call
    /// under a fresh timeout, and status interpretation.
    async fn send_attempt<C: ClusterCommand>(
        &self,
        node: &ServerNode,
        index: Option<usize>,
        command: &mut C,
        session_info: Option<&SessionInfo>,
    ) -> Outcome {
        let inner = &self.inner;

        let parts = match command.build_request(node) {
            Ok(parts) => parts,
            Err(error) => return Outcome::Fatal(error),
        };
        let request_url = parts.url.to_string();

        let no_caching = session_info.map(|session| session.no_caching).unwrap_or(false);
        let cache_eligible = command.is_read_request() && command.is_cacheable() && !no_caching;
        let cached = if cache_eligible {
            inner.cache.get(&request_url)
        } else {
            None
        };

        if let Some(cached_response) = &cached {
            if command.is_aggressively_cacheable()
                && !cached_response.might_be_stale()
                && cached_response.age() < inner.conventions.aggressive_cache_window()
            {
                return match cached_response.payload() {
                    Some(payload) => match command.parse_response(payload, true) {
                        Ok(()) => Outcome::Done,
                        Err(error) => Outcome::Fatal(error),
                    },
                    // cached "not found": the empty result stands
                    None => Outcome::Done,
                };
            }
        }

        let mut request = inner.client.request(parts.method, parts.url);
        request = request.header("Topology-Etag", inner.selector.topology_etag().to_string());
        if let Some(session) = session_info {
            if let Some(watermark) = session.last_cluster_write_etag {
                request = request.header("Cluster-Write-Etag", watermark.to_string());
            }
        }
        for (name, value) in &parts.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = parts.body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }
        if let Some(cached_response) = &cached {
            request = request.header(IF_NONE_MATCH, cached_response.token());
        }

        if let Some(index) = index {
            inner.selector.record_request(index);
        }

        let timeout = inner.conventions.request_timeout();
        let response = match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => {
                return Outcome::Retryable {
                    error: RequestExecutorError::RequestTimeout {
                        url: request_url,
                        timeout_ms: timeout.as_millis() as u64,
                    },
                    gone: false,
                }
            }
            Ok(Err(source)) => {
                return Outcome::Retryable {
                    error: RequestExecutorError::ConnectionFailed {
                        url: request_url,
                        source,
                    },
                    gone: false,
                }
            }
            Ok(Ok(response)) => response,
        };

        inner.touch_traffic();
        self.honor_refresh_signals(&response);

        let status = response.status();
        if status.is_success() {
            let change_token = response
                .headers()
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim_matches('"').to_string());
            let body = match response.text().await {
                Ok(body) => body,
                Err(source) => {
                    return Outcome::Retryable {
                        error: RequestExecutorError::ConnectionFailed {
                            url: request_url,
                            source,
                        },
                        gone: false,
                    }
                }
            };
            if cache_eligible {
                if let Some(token) = &change_token {
                    inner.cache.set(&request_url, token, &body);
                }
            }
            return match command.parse_response(&body, false) {
                Ok(()) => Outcome::Done,
                Err(error) => Outcome::Fatal(error),
            };
        }

        match status {
            StatusCode::NOT_MODIFIED => match cached {
                Some(cached_response) => {
                    inner.cache.confirm_not_modified(&cached_response);
                    match cached_response.payload() {
                        Some(payload) => match command.parse_response(payload, true) {
                            Ok(()) => Outcome::Done,
                            Err(error) => Outcome::Fatal(error),
                        },
                        // a revalidated "not found"; the empty result stands
                        None => Outcome::Done,
                    }
                }
                None => Outcome::Fatal(
                    anyhow!(
                        "Server answered 304 Not Modified for `{}` but nothing was cached locally",
                        request_url
                    )
                    .into(),
                ),
            },
            StatusCode::NOT_FOUND => {
                if cache_eligible {
                    inner.cache.set_not_found(&request_url);
                }
                // a read that found nothing is an empty result, not an error
                Outcome::Done
            }
            StatusCode::FORBIDDEN => Outcome::Fatal(RequestExecutorError::BadAuthorization),
            StatusCode::CONFLICT => {
                let body = response.text().await.unwrap_or_default();
                let message = match ServerErrorBody::decode(&body) {
                    Some(decoded) => decoded.message.unwrap_or(body),
                    None => body,
                };
                Outcome::Fatal(RequestExecutorError::Conflict {
                    url: request_url,
                    message,
                })
            }
            StatusCode::GONE => Outcome::Retryable {
                error: RequestExecutorError::NodeGone { url: request_url },
                gone: true,
            },
            StatusCode::REQUEST_TIMEOUT
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => {
                let body = response.text().await.unwrap_or_default();
                if ServerErrorBody::decode(&body)
                    .map(|decoded| decoded.is_database_missing())
                    .unwrap_or(false)
                {
                    return Outcome::Fatal(RequestExecutorError::DatabaseDoesNotExist(
                        inner.database.clone(),
                    ));
                }
                Outcome::Retryable {
                    error: RequestExecutorError::server_error(status, &body),
                    gone: false,
                }
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                match command.on_non_success_response(status, &body) {
                    Ok(()) => Outcome::Done,
                    Err(error) => Outcome::Fatal(error),
                }
            }
        }
    }

    fn honor_refresh_signals(&self, response: &reqwest::Response) {
        let header_is_true = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        if header_is_true("Refresh-Topology") {
            let _ = self
                .inner
                .sender
                .try_send(RequestExecutorMessage::RefreshTopology { force: false });
        }
        if header_is_true("Refresh-Client-Configuration") {
            let _ = self
                .inner
                .sender
                .try_send(RequestExecutorMessage::RefreshClientConfiguration);
        }
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("database", &self.inner.database)
            .finish_non_exhaustive()
    }
}
