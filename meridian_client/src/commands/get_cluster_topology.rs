use std::collections::HashMap;

use anyhow::Context;
use reqwest::Method;
use serde::Deserialize;
use url::Url;

use crate::cluster_command::{ClusterCommand, CommandRequest};
use crate::request_executor::RequestExecutorError;
use crate::server_node::{ServerNode, ServerRole};

/// Raw cluster-level topology as the server reports it: every node the
/// cluster knows about, keyed by tag, regardless of database.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterTopologyInfo {
    pub topology: ClusterTopology,
    pub etag: i64,
    #[serde(default)]
    pub leader: String,
    #[serde(default)]
    pub node_tag: String,
    #[serde(default)]
    pub current_term: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterTopology {
    #[serde(default)]
    pub topology_id: String,
    #[serde(default)]
    pub members: HashMap<String, Url>,
    #[serde(default)]
    pub promotables: HashMap<String, Url>,
    #[serde(default)]
    pub watchers: HashMap<String, Url>,
}

impl ClusterTopologyInfo {
    /// Flattens the tag→URL maps into [`ServerNode`]s for one database.
    /// Watchers carry no role the executor routes by.
    pub fn server_nodes(&self, database: &str) -> Vec<ServerNode> {
        let mut nodes = Vec::new();
        for (role, group) in [
            (ServerRole::Member, &self.topology.members),
            (ServerRole::Promotable, &self.topology.promotables),
            (ServerRole::None, &self.topology.watchers),
        ] {
            let mut tagged: Vec<_> = group.iter().collect();
            tagged.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (tag, url) in tagged {
                nodes.push(
                    ServerNode::new(url.clone(), database.to_string())
                        .with_cluster_tag(tag.clone())
                        .with_server_role(role),
                );
            }
        }
        nodes
    }
}

/// Fetches the cluster-wide topology from the addressed node.
#[derive(Debug, Default)]
pub struct GetClusterTopologyCommand {
    result: Option<ClusterTopologyInfo>,
}

impl GetClusterTopologyCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result(&self) -> Option<&ClusterTopologyInfo> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<ClusterTopologyInfo> {
        self.result
    }
}

impl ClusterCommand for GetClusterTopologyCommand {
    fn is_read_request(&self) -> bool {
        true
    }

    fn is_cacheable(&self) -> bool {
        true
    }

    fn build_request(&self, node: &ServerNode) -> Result<CommandRequest, RequestExecutorError> {
        let url = node
            .url
            .join("cluster/topology")
            .context("Failed to build the cluster topology URL")?;
        Ok(CommandRequest::new(Method::GET, url))
    }

    fn parse_response(
        &mut self,
        body: &str,
        _from_cache: bool,
    ) -> Result<(), RequestExecutorError> {
        let info: ClusterTopologyInfo = serde_json::from_str(body)
            .map_err(|source| RequestExecutorError::MalformedResponse { source })?;
        self.result = Some(info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_flattens_the_cluster_shape() {
        let body = r#"{
            "Etag": 12,
            "Leader": "A",
            "NodeTag": "B",
            "CurrentTerm": 3,
            "Topology": {
                "TopologyId": "f9a3f1f2",
                "Members": {
                    "A": "http://db1.example.com:8080",
                    "B": "http://db2.example.com:8080"
                },
                "Promotables": {
                    "C": "http://db3.example.com:8080"
                },
                "Watchers": {}
            }
        }"#;

        let mut command = GetClusterTopologyCommand::new();
        command.parse_response(body, false).unwrap();
        let info = command.into_result().unwrap();
        assert_eq!(info.etag, 12);
        assert_eq!(info.leader, "A");

        let nodes = info.server_nodes("orders");
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].cluster_tag, "A");
        assert_eq!(nodes[0].server_role, ServerRole::Member);
        assert_eq!(nodes[2].server_role, ServerRole::Promotable);
    }
}
