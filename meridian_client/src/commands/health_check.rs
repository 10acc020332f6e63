use anyhow::Context;
use reqwest::Method;

use crate::cluster_command::{ClusterCommand, CommandRequest};
use crate::request_executor::RequestExecutorError;
use crate::server_node::ServerNode;

/// No-op probe validating that a single node answers at all. Runs without
/// failover so the answer is about that node, not about the cluster.
#[derive(Debug, Default)]
pub struct HealthCheckCommand;

impl HealthCheckCommand {
    pub fn new() -> Self {
        Self
    }
}

impl ClusterCommand for HealthCheckCommand {
    fn is_read_request(&self) -> bool {
        true
    }

    fn build_request(&self, node: &ServerNode) -> Result<CommandRequest, RequestExecutorError> {
        let url = node
            .url
            .join("healthcheck")
            .context("Failed to build the health check URL")?;
        Ok(CommandRequest::new(Method::GET, url))
    }

    fn parse_response(
        &mut self,
        _body: &str,
        _from_cache: bool,
    ) -> Result<(), RequestExecutorError> {
        Ok(())
    }
}
