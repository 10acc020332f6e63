use serde::Deserialize;

use crate::server_node::ServerNode;

/// Etag a topology carries before anything has been fetched from the cluster.
/// Synthetic topologies built from seed URLs also use this value so that the
/// first real fetch always wins the version check.
pub const UNKNOWN_TOPOLOGY_ETAG: i64 = -1;

/// A version-stamped, ordered list of the cluster nodes known to the client.
///
/// Topologies are immutable; an update produces a new value via
/// [`Topology::replace`] rather than mutating in place, so concurrent readers
/// never observe a half-built node list.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    pub etag: i64,
    pub nodes: Vec<ServerNode>,
}

impl Topology {
    pub fn new(etag: i64, nodes: Vec<ServerNode>) -> Self {
        Self { etag, nodes }
    }

    pub fn empty() -> Self {
        Self {
            etag: UNKNOWN_TOPOLOGY_ETAG,
            nodes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Decides whether `candidate` supersedes `current`.
    ///
    /// `candidate` wins only when its etag is strictly greater, or when the
    /// caller forces replacement. The asymmetry keeps a slow background
    /// refresh from clobbering a newer topology another path already
    /// installed. Pure function; returns the topology to hold on to and
    /// whether it changed.
    pub fn replace(current: Topology, candidate: Topology, force: bool) -> (Topology, bool) {
        if force || candidate.etag > current.etag {
            (candidate, true)
        } else {
            (current, false)
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::empty()
    }
}
