use std::fmt;

use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::error_chain_fmt;
use crate::server_node::ServerNode;

#[derive(thiserror::Error)]
pub enum RequestExecutorError {
    #[error("Invalid authorization, ensure a valid certificate or credentials were supplied")]
    BadAuthorization,
    #[error("Database `{0}` does not exist")]
    DatabaseDoesNotExist(String),
    #[error("No URLs were supplied and a request executor can't exist without at least one")]
    MissingUrls,
    #[error("No database name was supplied")]
    MissingDatabase,
    #[error("Invalid seed URL `{url}`: {reason}")]
    InvalidSeedUrl { url: String, reason: String },
    #[error("The current topology contains no nodes")]
    EmptyTopology,
    #[error("Failed to send request to `{url}`")]
    ConnectionFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Request to `{url}` did not complete within {timeout_ms} ms")]
    RequestTimeout { url: String, timeout_ms: u64 },
    #[error("The server at `{url}` reported a conflict: {message}")]
    Conflict { url: String, message: String },
    #[error("The node at `{url}` no longer owns the requested data")]
    NodeGone { url: String },
    #[error("Server returned status {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("Failed to decode server response")]
    MalformedResponse {
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    AllNodesFailed(AggregateFailure),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

impl std::fmt::Debug for RequestExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl RequestExecutorError {
    pub(crate) fn server_error(status: StatusCode, body: &str) -> Self {
        let message = ServerErrorBody::decode(body)
            .and_then(|e| e.message)
            .unwrap_or_else(|| excerpt(body));
        RequestExecutorError::ServerError {
            status: status.as_u16(),
            message,
        }
    }

    /// Errors that will reproduce on every node; the bootstrap gives up on
    /// them instead of falling back to a synthetic topology.
    pub(crate) fn is_fatal_for_bootstrap(&self) -> bool {
        matches!(
            self,
            RequestExecutorError::BadAuthorization | RequestExecutorError::DatabaseDoesNotExist(_)
        )
    }
}

/// Every node was tried without success; names each node and what went wrong
/// on it, so an operator can see the cluster's shape in the failure itself.
pub struct AggregateFailure {
    pub failures: Vec<(ServerNode, RequestExecutorError)>,
    /// Where the topology in use was last fetched from, if it ever was.
    pub topology_source: Option<Url>,
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Tried all {} topology nodes without success",
            self.failures.len()
        )?;
        for (node, error) in &self.failures {
            writeln!(
                f,
                "  `{}` (tag `{}`, role {:?}): {}",
                node.url, node.cluster_tag, node.server_role, error
            )?;
        }
        match &self.topology_source {
            Some(url) => write!(f, "Topology was last fetched from `{}`", url),
            None => write!(f, "Topology was never fetched from the cluster"),
        }
    }
}

impl fmt::Debug for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The structured error body Meridian servers attach to non-success
/// responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerErrorBody {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "Type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerErrorBody {
    pub fn decode(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    /// True when the error type names the database-does-not-exist condition,
    /// which is deterministic across nodes and therefore never retried.
    pub fn is_database_missing(&self) -> bool {
        self.error_type
            .as_deref()
            .map(|t| t.contains("DatabaseDoesNotExist"))
            .unwrap_or(false)
    }
}

fn excerpt(body: &str) -> String {
    let line = body.lines().next().unwrap_or_default();
    if line.is_empty() {
        "<empty response body>".to_string()
    } else if line.chars().count() > 256 {
        let mut excerpt: String = line.chars().take(256).collect();
        excerpt.push('…');
        excerpt
    } else {
        line.to_string()
    }
}
