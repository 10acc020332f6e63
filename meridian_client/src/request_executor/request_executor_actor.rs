use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;
use url::Url;

use crate::commands::{GetClientConfigurationCommand, GetDatabaseTopologyCommand};
use crate::conventions::ReadBalanceBehavior;
use crate::node_selector::SpeedTestStatus;
use crate::server_node::ServerNode;
use crate::topology::{Topology, UNKNOWN_TOPOLOGY_ETAG};

use super::request_executor_handle::RequestExecutor;
use super::{BootstrapFailure, BootstrapState, ExecutorShared, RequestExecutorMessage};

/// Interval at which fastest-node status is revisited once converged.
const SPEED_TEST_REVISIT_INTERVAL: Duration = Duration::from_secs(60);

/// Owner of everything time-driven: the first topology update, the periodic
/// refresh, speed tests, and configuration refreshes. Request paths never
/// touch timers; they send this actor a message and move on.
pub(crate) struct RequestExecutorActor {
    inner: Arc<ExecutorShared>,
    receiver: mpsc::Receiver<RequestExecutorMessage>,
    initial_urls: Vec<Url>,
    speed_test_task: Option<JoinHandle<()>>,
}

impl RequestExecutorActor {
    pub(crate) fn new(
        inner: Arc<ExecutorShared>,
        receiver: mpsc::Receiver<RequestExecutorMessage>,
        initial_urls: Vec<Url>,
    ) -> Self {
        Self {
            inner,
            receiver,
            initial_urls,
            speed_test_task: None,
        }
    }

    async fn handle_message(&mut self, message: RequestExecutorMessage) {
        match message {
            RequestExecutorMessage::RefreshTopology { force } => {
                if self.inner.conventions.disable_topology_updates() {
                    return;
                }
                let executor = RequestExecutor::from_shared(Arc::clone(&self.inner));
                tokio::spawn(async move {
                    if let Err(error) = executor.update_topology(force, Duration::ZERO).await {
                        tracing::debug!("Topology refresh failed. Caused by: {}", error);
                    }
                });
            }
            RequestExecutorMessage::RefreshClientConfiguration => {
                tokio::spawn(refresh_client_configuration(Arc::clone(&self.inner)));
            }
            RequestExecutorMessage::RearmBootstrap => {
                // a Failed state means no bootstrap is in flight: a started
                // one flips the state to Pending before anything else
                let failed = matches!(
                    &*self.inner.bootstrap.borrow(),
                    BootstrapState::Failed(_)
                );
                if failed {
                    let mut urls = self.inner.last_known_urls();
                    if urls.is_empty() {
                        urls = self.initial_urls.clone();
                    }
                    self.start_bootstrap(urls);
                }
            }
            RequestExecutorMessage::SpeedTestRequested => self.spawn_speed_test(),
            // re-arming the revisit timer happens in the run loop
            RequestExecutorMessage::SpeedTestConcluded => {}
        }
    }

    fn start_bootstrap(&mut self, urls: Vec<Url>) {
        self.inner.set_bootstrap_state(BootstrapState::Pending);
        tokio::spawn(first_topology_update(Arc::clone(&self.inner), urls));
    }

    fn on_topology_timer(&self) {
        if self.inner.conventions.disable_topology_updates() {
            return;
        }
        if !self.inner.is_idle() {
            // normal traffic already proves liveness; don't pile on
            return;
        }
        let executor = RequestExecutor::from_shared(Arc::clone(&self.inner));
        tokio::spawn(async move {
            if let Err(error) = executor.update_topology(false, Duration::ZERO).await {
                tracing::debug!("Periodic topology refresh failed. Caused by: {}", error);
            }
        });
    }

    fn on_speed_test_timer(&mut self) {
        if self.inner.effective_read_balance() != ReadBalanceBehavior::FastestNode {
            return;
        }
        if self.inner.selector.node_count() < 2 {
            return;
        }
        if self.inner.selector.begin_speed_test() {
            self.spawn_speed_test();
        }
    }

    fn spawn_speed_test(&mut self) {
        let running = self
            .speed_test_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);
        if running {
            return;
        }
        self.speed_test_task = Some(tokio::spawn(run_speed_test(Arc::clone(&self.inner))));
    }
}

#[instrument(level = "debug", name = "Running Request Executor Actor", skip(actor))]
pub(crate) async fn run_request_executor_actor(mut actor: RequestExecutorActor) {
    let urls = actor.initial_urls.clone();
    actor.start_bootstrap(urls);

    let refresh_interval = actor.inner.conventions.topology_refresh_interval();
    let mut topology_timer =
        tokio::time::interval_at(tokio::time::Instant::now() + refresh_interval, refresh_interval);
    topology_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut speed_test_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + SPEED_TEST_REVISIT_INTERVAL,
        SPEED_TEST_REVISIT_INTERVAL,
    );
    speed_test_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = topology_timer.tick() => actor.on_topology_timer(),
            _ = speed_test_timer.tick() => actor.on_speed_test_timer(),
            message = actor.receiver.recv() => match message {
                None => break,
                Some(RequestExecutorMessage::SpeedTestConcluded) => speed_test_timer.reset(),
                Some(message) => actor.handle_message(message).await,
            },
        }
    }
}

/// Tries each seed URL in order until one yields a topology. When every seed
/// fails, installs a synthetic topology built from the seeds themselves so
/// the client stays usable, degraded — unless the failure was one that will
/// reproduce on every node, which poisons the bootstrap immediately.
#[instrument(level = "debug", skip(inner, initial_urls))]
async fn first_topology_update(inner: Arc<ExecutorShared>, initial_urls: Vec<Url>) {
    let database = inner.database.clone();

    if inner.conventions.disable_topology_updates() {
        install_seed_topology(&inner, &initial_urls);
        inner.set_bootstrap_state(BootstrapState::Ready);
        return;
    }

    let executor = RequestExecutor::from_shared(Arc::clone(&inner));
    let mut server_errors = Vec::new();

    for url in &initial_urls {
        let node = ServerNode::new(url.clone(), database.clone());
        let mut command =
            GetDatabaseTopologyCommand::new(database.clone(), inner.application_id);
        match executor
            .execute_on_node(node, None, &mut command, false, None)
            .await
        {
            Ok(()) => match command.into_result() {
                Some(topology) => {
                    inner.selector.on_topology_update(topology, false);
                    inner.set_topology_source(url.clone());
                    let node_urls: Vec<Url> = inner
                        .selector
                        .topology()
                        .nodes
                        .iter()
                        .map(|node| node.url.clone())
                        .collect();
                    inner.remember_urls(&node_urls);
                    inner.set_bootstrap_state(BootstrapState::Ready);
                    tracing::info!("Initial topology update complete");
                    return;
                }
                None => server_errors.push((
                    url.clone(),
                    anyhow::anyhow!("The topology response contained no topology").into(),
                )),
            },
            Err(error) => {
                if let Some(failure) = BootstrapFailure::classify(&error) {
                    tracing::error!(
                        "First topology update cannot succeed on any node. Caused by: {}",
                        error
                    );
                    inner.set_bootstrap_state(BootstrapState::Failed(failure));
                    return;
                }
                server_errors.push((url.clone(), error));
            }
        }
    }

    for (url, error) in &server_errors {
        tracing::warn!(
            "Could not fetch an initial topology from `{}`. Caused by: {}",
            url,
            error
        );
    }

    install_seed_topology(&inner, &initial_urls);
    inner.set_bootstrap_state(BootstrapState::Ready);
}

fn install_seed_topology(inner: &ExecutorShared, urls: &[Url]) {
    let nodes = urls
        .iter()
        .map(|url| {
            ServerNode::new(url.clone(), inner.database.clone()).with_cluster_tag("!")
        })
        .collect();
    inner
        .selector
        .on_topology_update(Topology::new(UNKNOWN_TOPOLOGY_ETAG, nodes), true);
    inner.remember_urls(urls);
}

async fn refresh_client_configuration(inner: Arc<ExecutorShared>) {
    let executor = RequestExecutor::from_shared(Arc::clone(&inner));
    let (index, node) = match inner.selector.preferred_node() {
        Ok(found) => found,
        Err(error) => {
            tracing::debug!(
                "Skipping client configuration refresh. Caused by: {}",
                error
            );
            return;
        }
    };
    let mut command = GetClientConfigurationCommand::new(inner.database.clone());
    match executor
        .execute_on_node(node, Some(index), &mut command, false, None)
        .await
    {
        Ok(()) => {
            if let Some(configuration) = command.into_result() {
                if inner.apply_client_configuration(configuration) {
                    tracing::debug!(
                        "Applied client configuration etag {}",
                        configuration.etag
                    );
                }
            }
        }
        Err(error) => {
            tracing::debug!("Client configuration refresh failed. Caused by: {}", error);
        }
    }
}

/// Races a health probe against every node, one round per vote; the first
/// responder of each round gets the vote. Ends when the selector converges or
/// the round budget runs out.
#[instrument(level = "debug", skip(inner))]
async fn run_speed_test(inner: Arc<ExecutorShared>) {
    tracing::debug!("Starting a node speed test");
    let node_count = inner.selector.node_count();
    if node_count == 0 {
        inner.selector.end_speed_test();
        return;
    }

    let max_rounds = 10 * node_count + 5;
    for _ in 0..max_rounds {
        if !inner.selector.in_speed_test() {
            return;
        }
        let topology = inner.selector.topology();
        if topology.nodes.is_empty() {
            break;
        }

        let mut order: Vec<(usize, ServerNode)> =
            topology.nodes.iter().cloned().enumerate().collect();
        order.shuffle(&mut rand::thread_rng());

        let (probe_tx, mut probe_rx) = mpsc::channel(order.len());
        let mut probes = Vec::new();
        for (index, node) in order {
            let client = inner.client.clone();
            let probe_tx = probe_tx.clone();
            let timeout = inner.conventions.request_timeout();
            probes.push(tokio::spawn(async move {
                let Ok(url) = node.url.join("healthcheck") else {
                    return;
                };
                if let Ok(Ok(response)) = tokio::time::timeout(timeout, client.get(url).send()).await
                {
                    if response.status().is_success() {
                        let _ = probe_tx.send((index, node)).await;
                    }
                }
            }));
        }
        drop(probe_tx);

        let winner = probe_rx.recv().await;
        for probe in &probes {
            probe.abort();
        }

        match winner {
            Some((index, node)) => {
                match inner.selector.record_speed_test_vote(index, &node) {
                    SpeedTestStatus::Converged(fastest) => {
                        tracing::debug!("Speed test converged on node index {}", fastest);
                        let _ = inner
                            .sender
                            .try_send(RequestExecutorMessage::SpeedTestConcluded);
                        return;
                    }
                    SpeedTestStatus::Recorded => {}
                    SpeedTestStatus::Ignored => {
                        if !inner.selector.in_speed_test() {
                            return;
                        }
                    }
                }
            }
            // nobody answered this round; give the cluster a beat
            None => tokio::time::sleep(Duration::from_millis(500)).await,
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::debug!("Speed test did not converge within its round budget");
    inner.selector.end_speed_test();
}
