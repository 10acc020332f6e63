/*!
meridian_client is the cluster-aware request-execution layer of a client for
the Meridian document database. Given a logical operation (a
[`ClusterCommand`]) it decides which cluster node receives the request, sends
it, transparently fails over to other nodes, keeps a local [`Topology`] of the
cluster fresh, and maintains a bounded [`ResponseCache`] keyed by change
tokens so unchanged responses cost a 304 instead of a payload.

This library requires tokio and async, and uses the actor pattern: one
background task per [`RequestExecutor`] owns the timers and topology swaps,
while any number of cloned handles run commands concurrently. Create one
executor per database cluster and reuse it; the handle is cheap to clone.

# Example
```no_run
use meridian_client::commands::GetClusterTopologyCommand;
use meridian_client::RequestExecutor;

# async fn demo() -> Result<(), meridian_client::RequestExecutorError> {
let executor = RequestExecutor::builder()
    .set_urls(&["http://localhost:8080"])
    .set_database("orders")
    .build()?;

let mut command = GetClusterTopologyCommand::new();
executor.execute(&mut command, None).await?;
println!("{:#?}", command.result());
# Ok(())
# }
```
*/

mod cluster_command;
mod conventions;
mod events;
mod node_selector;
mod request_executor;
mod response_cache;
mod server_node;
mod topology;

pub mod commands;

pub use cluster_command::{ClusterCommand, CommandRequest, SessionInfo};
pub use conventions::{Conventions, ReadBalanceBehavior};
pub use events::ExecutorEvent;
pub use node_selector::{NodeSelector, NodeStatistics, SpeedTestStatus};
pub use request_executor::{
    AggregateFailure, RequestExecutor, RequestExecutorBuilder, RequestExecutorError,
    ServerErrorBody,
};
pub use response_cache::{CachedResponse, ResponseCache, NOT_FOUND_CHANGE_TOKEN};
pub use server_node::{ServerNode, ServerRole};
pub use topology::{Topology, UNKNOWN_TOPOLOGY_ETAG};

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}
