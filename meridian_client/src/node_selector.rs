use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::request_executor::RequestExecutorError;
use crate::server_node::{ServerNode, ServerRole};
use crate::topology::Topology;

/// Corroborating speed-test votes one node needs before it is crowned fastest.
const SPEED_TEST_VOTES_TO_WIN: u32 = 10;

/// Marker stored in `fastest_index` while no fastest node is known.
const FASTEST_UNSET: usize = usize::MAX;

/// Chooses which cluster node a request should go to.
///
/// The selector holds the current [`Topology`] together with the state derived
/// from it: one failure counter and one speed-test vote counter per node, the
/// index of the node currently believed fastest, and the speed-test-mode flag.
/// A topology update swaps the entire derived state in one atomic reference
/// swap, so readers never block and never observe counters that belong to a
/// different node ordering. Counters themselves are independent atomics and
/// are safe to bump from any number of in-flight requests.
pub struct NodeSelector {
    state: RwLock<Arc<SelectorState>>,
}

pub(crate) struct SelectorState {
    topology: Topology,
    failures: Vec<AtomicU32>,
    requests_sent: Vec<AtomicU64>,
    speed_test_votes: Vec<AtomicU32>,
    total_speed_test_votes: AtomicU32,
    fastest_index: AtomicUsize,
    in_speed_test: AtomicBool,
}

impl SelectorState {
    fn derive(topology: Topology) -> Arc<Self> {
        let len = topology.nodes.len();
        Arc::new(Self {
            topology,
            failures: (0..len).map(|_| AtomicU32::new(0)).collect(),
            requests_sent: (0..len).map(|_| AtomicU64::new(0)).collect(),
            speed_test_votes: (0..len).map(|_| AtomicU32::new(0)).collect(),
            total_speed_test_votes: AtomicU32::new(0),
            fastest_index: AtomicUsize::new(FASTEST_UNSET),
            in_speed_test: AtomicBool::new(false),
        })
    }

    fn is_healthy(&self, index: usize) -> bool {
        self.failures
            .get(index)
            .map(|f| f.load(Ordering::SeqCst) == 0)
            .unwrap_or(false)
    }

    fn crown(&self, index: usize) {
        self.fastest_index.store(index, Ordering::SeqCst);
        self.in_speed_test.store(false, Ordering::SeqCst);
    }
}

/// What [`NodeSelector::record_speed_test_vote`] did with a vote.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpeedTestStatus {
    /// The vote was counted but no node has won yet.
    Recorded,
    /// The node at the contained index is now the fastest node and the
    /// speed-test phase is over.
    Converged(usize),
    /// The vote was dropped: no speed test is running, or the node at that
    /// index is no longer the node the vote was cast for.
    Ignored,
}

/// Per-node counters exposed for operational tooling.
#[derive(Clone, Debug)]
pub struct NodeStatistics {
    pub node: ServerNode,
    pub failures: u32,
    pub requests_sent: u64,
}

impl NodeSelector {
    pub fn new(topology: Topology) -> Self {
        Self {
            state: RwLock::new(SelectorState::derive(topology)),
        }
    }

    pub(crate) fn state(&self) -> Arc<SelectorState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the currently held topology.
    pub fn topology(&self) -> Topology {
        self.state().topology.clone()
    }

    pub fn topology_etag(&self) -> i64 {
        self.state().topology.etag
    }

    pub fn node_count(&self) -> usize {
        self.state().topology.nodes.len()
    }

    /// The first node with no recorded failures.
    ///
    /// When every node has failures this still returns node 0 so the caller
    /// can make an attempt and surface a real error instead of hanging.
    pub fn preferred_node(&self) -> Result<(usize, ServerNode), RequestExecutorError> {
        let state = self.state();
        let nodes = &state.topology.nodes;
        if nodes.is_empty() {
            return Err(RequestExecutorError::EmptyTopology);
        }
        for (index, node) in nodes.iter().enumerate() {
            if state.is_healthy(index) {
                return Ok((index, node.clone()));
            }
        }
        Ok((0, nodes[0].clone()))
    }

    /// Round-robin selection keyed by session id.
    ///
    /// Starts scanning at `session_id mod node_count`, wraps, and skips nodes
    /// with failures or without the `Member` role. Falls back to
    /// [`NodeSelector::preferred_node`] when the scan finds nothing.
    pub fn node_for_session(
        &self,
        session_id: i64,
    ) -> Result<(usize, ServerNode), RequestExecutorError> {
        let state = self.state();
        let nodes = &state.topology.nodes;
        if nodes.is_empty() {
            return Err(RequestExecutorError::EmptyTopology);
        }
        let start = session_id.rem_euclid(nodes.len() as i64) as usize;
        for offset in 0..nodes.len() {
            let index = (start + offset) % nodes.len();
            if state.is_healthy(index) && nodes[index].server_role == ServerRole::Member {
                return Ok((index, nodes[index].clone()));
            }
        }
        self.preferred_node()
    }

    /// The healthy node carrying `cluster_tag`, if the topology has one.
    pub fn requested_node(&self, cluster_tag: &str) -> Option<(usize, ServerNode)> {
        let state = self.state();
        state
            .topology
            .nodes
            .iter()
            .enumerate()
            .find(|(index, node)| node.cluster_tag == cluster_tag && state.is_healthy(*index))
            .map(|(index, node)| (index, node.clone()))
    }

    /// The node currently believed fastest, when it is known and healthy.
    ///
    /// Returns `None` when no fastest node has converged yet or the recorded
    /// one has failures; the caller should begin a speed test and use
    /// [`NodeSelector::preferred_node`] for the current request.
    pub fn fastest_node(&self) -> Option<(usize, ServerNode)> {
        let state = self.state();
        let index = state.fastest_index.load(Ordering::SeqCst);
        if index == FASTEST_UNSET || index >= state.topology.nodes.len() {
            return None;
        }
        if !state.is_healthy(index) {
            return None;
        }
        Some((index, state.topology.nodes[index].clone()))
    }

    /// Flags the start of a speed-test phase. Returns `true` when this call
    /// began the phase, `false` when one was already running.
    pub(crate) fn begin_speed_test(&self) -> bool {
        !self.state().in_speed_test.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn end_speed_test(&self) {
        self.state().in_speed_test.store(false, Ordering::SeqCst);
    }

    pub fn in_speed_test(&self) -> bool {
        self.state().in_speed_test.load(Ordering::SeqCst)
    }

    /// Counts one speed-test vote for the node at `index`.
    ///
    /// The vote only counts while a speed test is running and while `node` is
    /// still the node at that index, which guards against votes that arrive
    /// after a topology swap. Ten corroborating votes crown a fastest node.
    /// As a safety valve, once the total vote count exceeds ten per node the
    /// current leader is crowned regardless, which bounds convergence cost
    /// under high concurrency.
    pub fn record_speed_test_vote(&self, index: usize, node: &ServerNode) -> SpeedTestStatus {
        let state = self.state();
        if !state.in_speed_test.load(Ordering::SeqCst) {
            return SpeedTestStatus::Ignored;
        }
        if state.topology.nodes.get(index) != Some(node) {
            return SpeedTestStatus::Ignored;
        }

        let total = state.total_speed_test_votes.fetch_add(1, Ordering::SeqCst) + 1;
        let votes = state.speed_test_votes[index].fetch_add(1, Ordering::SeqCst) + 1;

        if votes >= SPEED_TEST_VOTES_TO_WIN {
            state.crown(index);
            return SpeedTestStatus::Converged(index);
        }

        let cap = SPEED_TEST_VOTES_TO_WIN * state.topology.nodes.len() as u32;
        if total >= cap {
            let leader = state
                .speed_test_votes
                .iter()
                .enumerate()
                .max_by_key(|(_, votes)| votes.load(Ordering::SeqCst))
                .map(|(i, _)| i)
                .unwrap_or(index);
            state.crown(leader);
            return SpeedTestStatus::Converged(leader);
        }

        SpeedTestStatus::Recorded
    }

    /// Increments the failure counter of one node. Never touches any other
    /// node and never removes a node from the topology.
    pub fn record_failure(&self, index: usize) {
        let state = self.state();
        if let Some(counter) = state.failures.get(index) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Resets one node's failure counter after a request succeeded through it.
    pub fn restore_node(&self, index: usize) {
        let state = self.state();
        if let Some(counter) = state.failures.get(index) {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub(crate) fn record_request(&self, index: usize) {
        let state = self.state();
        if let Some(counter) = state.requests_sent.get(index) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn failure_count(&self, index: usize) -> u32 {
        let state = self.state();
        state
            .failures
            .get(index)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn node_statistics(&self) -> Vec<NodeStatistics> {
        let state = self.state();
        state
            .topology
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| NodeStatistics {
                node: node.clone(),
                failures: state.failures[index].load(Ordering::SeqCst),
                requests_sent: state.requests_sent[index].load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Applies a freshly fetched topology.
    ///
    /// Delegates the version check to [`Topology::replace`] and, when the
    /// topology changed, swaps in an entirely new derived state. Counters
    /// never carry over because node ordering and identity may have shifted.
    pub fn on_topology_update(&self, candidate: Topology, force: bool) -> bool {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let current = guard.topology.clone();
        let (next, changed) = Topology::replace(current, candidate, force);
        if changed {
            *guard = SelectorState::derive(next);
        }
        changed
    }
}

impl std::fmt::Debug for NodeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("NodeSelector")
            .field("etag", &state.topology.etag)
            .field("nodes", &state.topology.nodes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;

    fn node(url: &str) -> ServerNode {
        ServerNode::new(Url::parse(url).unwrap(), "orders".to_string())
            .with_server_role(ServerRole::Member)
    }

    fn selector(urls: &[&str]) -> NodeSelector {
        let nodes = urls.iter().map(|u| node(u)).collect();
        NodeSelector::new(Topology::new(1, nodes))
    }

    #[test]
    fn preferred_node_skips_failed_nodes() {
        let selector = selector(&["http://a.example.com", "http://b.example.com"]);
        assert_eq!(selector.preferred_node().unwrap().0, 0);

        selector.record_failure(0);
        assert_eq!(selector.preferred_node().unwrap().0, 1);
    }

    #[test]
    fn preferred_node_returns_node_zero_when_everything_failed() {
        let selector = selector(&["http://a.example.com", "http://b.example.com"]);
        selector.record_failure(0);
        selector.record_failure(1);
        assert_eq!(selector.preferred_node().unwrap().0, 0);
    }

    #[test]
    fn preferred_node_fails_on_empty_topology() {
        let selector = NodeSelector::new(Topology::empty());
        assert!(matches!(
            selector.preferred_node(),
            Err(RequestExecutorError::EmptyTopology)
        ));
    }

    #[test]
    fn failures_are_isolated_per_node() {
        let selector = selector(&["http://a.example.com", "http://b.example.com"]);
        selector.record_failure(0);
        selector.record_failure(0);
        assert_eq!(selector.failure_count(0), 2);
        assert_eq!(selector.failure_count(1), 0);

        selector.record_failure(1);
        selector.restore_node(0);
        assert_eq!(selector.failure_count(0), 0);
        assert_eq!(selector.failure_count(1), 1);
    }

    #[test]
    fn session_routing_wraps_and_skips_failures() {
        let selector = selector(&["http://a.example.com", "http://b.example.com"]);

        // session 3 on a two-node topology starts at index 1
        assert_eq!(selector.node_for_session(3).unwrap().0, 1);

        selector.record_failure(1);
        assert_eq!(selector.node_for_session(3).unwrap().0, 0);
    }

    #[test]
    fn session_routing_skips_non_members() {
        let nodes = vec![
            node("http://a.example.com"),
            node("http://b.example.com").with_server_role(ServerRole::Rehab),
        ];
        let selector = NodeSelector::new(Topology::new(1, nodes));
        assert_eq!(selector.node_for_session(1).unwrap().0, 0);
    }

    #[test]
    fn ten_votes_converge_on_a_fastest_node() {
        let selector = selector(&["http://a.example.com", "http://b.example.com"]);
        let voted_for = selector.topology().nodes[1].clone();
        assert!(selector.begin_speed_test());

        for _ in 0..9 {
            assert_eq!(
                selector.record_speed_test_vote(1, &voted_for),
                SpeedTestStatus::Recorded
            );
        }
        assert_eq!(
            selector.record_speed_test_vote(1, &voted_for),
            SpeedTestStatus::Converged(1)
        );
        assert!(!selector.in_speed_test());
        assert_eq!(selector.fastest_node().unwrap().0, 1);
    }

    #[test]
    fn fastest_node_with_failures_is_not_returned() {
        let selector = selector(&["http://a.example.com", "http://b.example.com"]);
        let voted_for = selector.topology().nodes[1].clone();
        selector.begin_speed_test();
        for _ in 0..10 {
            selector.record_speed_test_vote(1, &voted_for);
        }
        selector.record_failure(1);
        assert!(selector.fastest_node().is_none());
    }

    #[test]
    fn votes_for_a_replaced_node_are_ignored() {
        let selector = selector(&["http://a.example.com", "http://b.example.com"]);
        selector.begin_speed_test();
        let stale = node("http://elsewhere.example.com");
        assert_eq!(
            selector.record_speed_test_vote(1, &stale),
            SpeedTestStatus::Ignored
        );
    }

    #[test]
    fn alternating_votes_still_converge() {
        let selector = selector(&["http://a.example.com", "http://b.example.com"]);
        let topology = selector.topology();
        selector.begin_speed_test();

        let mut winner = None;
        for i in 0..40 {
            let index = i % 2;
            if let SpeedTestStatus::Converged(index) =
                selector.record_speed_test_vote(index, &topology.nodes[index])
            {
                winner = Some(index);
                break;
            }
        }
        assert_eq!(winner, Some(0));
        assert!(!selector.in_speed_test());
    }

    #[test]
    fn topology_update_resets_derived_state() {
        let selector = selector(&["http://a.example.com", "http://b.example.com"]);
        selector.record_failure(0);

        let newer = Topology::new(
            2,
            vec![node("http://a.example.com"), node("http://b.example.com")],
        );
        assert!(selector.on_topology_update(newer, false));
        assert_eq!(selector.failure_count(0), 0);

        let older = Topology::new(0, vec![node("http://c.example.com")]);
        assert!(!selector.on_topology_update(older, false));
        assert_eq!(selector.topology_etag(), 2);
    }
}
