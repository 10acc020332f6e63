use anyhow::Context;
use reqwest::Method;
use uuid::Uuid;

use crate::cluster_command::{ClusterCommand, CommandRequest};
use crate::request_executor::RequestExecutorError;
use crate::server_node::ServerNode;
use crate::topology::Topology;

/// Fetches the database-group topology the addressed node currently holds.
///
/// Refresh and bootstrap run this internally; it is public so operational
/// tooling can ask a specific node for its view of the cluster. Responses are
/// cacheable, so an unchanged topology costs a 304 instead of a payload.
#[derive(Debug)]
pub struct GetDatabaseTopologyCommand {
    database: String,
    application_id: Uuid,
    result: Option<Topology>,
}

impl GetDatabaseTopologyCommand {
    pub fn new(database: impl Into<String>, application_id: Uuid) -> Self {
        Self {
            database: database.into(),
            application_id,
            result: None,
        }
    }

    pub fn result(&self) -> Option<&Topology> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<Topology> {
        self.result
    }
}

impl ClusterCommand for GetDatabaseTopologyCommand {
    fn is_read_request(&self) -> bool {
        true
    }

    fn is_cacheable(&self) -> bool {
        true
    }

    fn build_request(&self, node: &ServerNode) -> Result<CommandRequest, RequestExecutorError> {
        let mut url = node
            .url
            .join("topology")
            .context("Failed to build the topology URL")?;
        url.set_query(Some(&format!(
            "name={}&applicationIdentifier={}",
            self.database, self.application_id
        )));
        Ok(CommandRequest::new(Method::GET, url))
    }

    fn parse_response(
        &mut self,
        body: &str,
        _from_cache: bool,
    ) -> Result<(), RequestExecutorError> {
        let topology: Topology = serde_json::from_str(body)
            .map_err(|source| RequestExecutorError::MalformedResponse { source })?;
        self.result = Some(topology);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use crate::server_node::ServerRole;

    use super::*;

    #[test]
    fn builds_a_topology_request_for_the_node() {
        let node = ServerNode::new(
            Url::parse("http://db1.example.com:8080").unwrap(),
            "orders".to_string(),
        );
        let command = GetDatabaseTopologyCommand::new("orders", Uuid::nil());
        let request = command.build_request(&node).unwrap();

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url.path(), "/topology");
        assert!(request.url.query().unwrap().contains("name=orders"));
    }

    #[test]
    fn parses_the_wire_topology() {
        let body = r#"{
            "Etag": 7,
            "Nodes": [
                {
                    "Url": "http://db1.example.com:8080",
                    "Database": "orders",
                    "ClusterTag": "A",
                    "ServerRole": "Member"
                },
                {
                    "Url": "http://db2.example.com:8080",
                    "Database": "orders",
                    "ClusterTag": "B",
                    "ServerRole": "Promotable"
                }
            ]
        }"#;

        let mut command = GetDatabaseTopologyCommand::new("orders", Uuid::nil());
        command.parse_response(body, false).unwrap();

        let topology = command.into_result().unwrap();
        assert_eq!(topology.etag, 7);
        assert_eq!(topology.nodes.len(), 2);
        assert_eq!(topology.nodes[0].cluster_tag, "A");
        assert_eq!(topology.nodes[1].server_role, ServerRole::Promotable);
    }

    #[test]
    fn rejects_a_malformed_body() {
        let mut command = GetDatabaseTopologyCommand::new("orders", Uuid::nil());
        assert!(matches!(
            command.parse_response("not json", false),
            Err(RequestExecutorError::MalformedResponse { .. })
        ));
    }
}
