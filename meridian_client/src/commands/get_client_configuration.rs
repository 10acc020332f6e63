use anyhow::Context;
use reqwest::Method;
use serde::Deserialize;

use crate::cluster_command::{ClusterCommand, CommandRequest};
use crate::conventions::ReadBalanceBehavior;
use crate::request_executor::RequestExecutorError;
use crate::server_node::ServerNode;

/// Server-pushed overrides for client behavior, versioned by etag. A node
/// signals a new configuration through the `Refresh-Client-Configuration`
/// response header; the executor then runs this command out of band.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfiguration {
    pub etag: i64,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub read_balance_behavior: Option<ReadBalanceBehavior>,
}

/// Fetches the database's current client configuration. Never cached; a
/// stale configuration defeats the point of fetching it.
#[derive(Debug)]
pub struct GetClientConfigurationCommand {
    database: String,
    result: Option<ClientConfiguration>,
}

impl GetClientConfigurationCommand {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            result: None,
        }
    }

    pub fn result(&self) -> Option<&ClientConfiguration> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<ClientConfiguration> {
        self.result
    }
}

impl ClusterCommand for GetClientConfigurationCommand {
    fn is_read_request(&self) -> bool {
        true
    }

    fn build_request(&self, node: &ServerNode) -> Result<CommandRequest, RequestExecutorError> {
        let url = node
            .url
            .join(&format!(
                "databases/{}/configuration/client",
                self.database
            ))
            .context("Failed to build the client configuration URL")?;
        Ok(CommandRequest::new(Method::GET, url))
    }

    fn parse_response(
        &mut self,
        body: &str,
        _from_cache: bool,
    ) -> Result<(), RequestExecutorError> {
        let configuration: ClientConfiguration = serde_json::from_str(body)
            .map_err(|source| RequestExecutorError::MalformedResponse { source })?;
        self.result = Some(configuration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_configuration_payload() {
        let body = r#"{
            "Etag": 4,
            "Disabled": false,
            "ReadBalanceBehavior": "RoundRobin"
        }"#;
        let mut command = GetClientConfigurationCommand::new("orders");
        command.parse_response(body, false).unwrap();

        let configuration = command.into_result().unwrap();
        assert_eq!(configuration.etag, 4);
        assert_eq!(
            configuration.read_balance_behavior,
            Some(ReadBalanceBehavior::RoundRobin)
        );
    }

    #[test]
    fn absent_fields_default() {
        let mut command = GetClientConfigurationCommand::new("orders");
        command.parse_response(r#"{"Etag": 1}"#, false).unwrap();
        let configuration = command.into_result().unwrap();
        assert!(!configuration.disabled);
        assert!(configuration.read_balance_behavior.is_none());
    }
}
