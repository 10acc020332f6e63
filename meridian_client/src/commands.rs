//! Commands the executor itself depends on: topology discovery, client
//! configuration, and the node health probe. Everything else a caller might
//! run through the executor lives with that caller; these four are shipped
//! here because refresh and bootstrap invoke them internally.

mod get_client_configuration;
mod get_cluster_topology;
mod get_database_topology;
mod health_check;

pub use get_client_configuration::{ClientConfiguration, GetClientConfigurationCommand};
pub use get_cluster_topology::{ClusterTopology, ClusterTopologyInfo, GetClusterTopologyCommand};
pub use get_database_topology::GetDatabaseTopologyCommand;
pub use health_check::HealthCheckCommand;
