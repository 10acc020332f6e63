use reqwest::{Method, StatusCode};
use url::Url;

use crate::request_executor::RequestExecutorError;
use crate::server_node::ServerNode;

/// The wire-level pieces of one HTTP request, produced by a command for a
/// specific node. The executor owns everything else: conditional headers,
/// topology etag, timeouts, and retries.
#[derive(Debug)]
pub struct CommandRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl CommandRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A single logical operation against the cluster.
///
/// The executor is agnostic to what a command does; it only needs to know how
/// to route it (read vs. write, optional node tag), whether its responses may
/// be cached, how to build the request for a chosen node, and how to hand the
/// response body back. A command that succeeded keeps its parsed result
/// internally; callers read it from the command after
/// [`RequestExecutor::execute`](crate::RequestExecutor::execute) returns.
pub trait ClusterCommand: Send {
    /// Reads are eligible for read balancing and for the response cache.
    /// Writes always target the preferred node and are never fanned out, so a
    /// non-idempotent operation cannot be applied twice.
    fn is_read_request(&self) -> bool;

    fn is_cacheable(&self) -> bool {
        false
    }

    /// Aggressively cacheable responses may be served straight from the cache
    /// within the configured window, without a round trip.
    fn is_aggressively_cacheable(&self) -> bool {
        false
    }

    /// Pins the command to the node carrying this cluster tag.
    fn selected_node_tag(&self) -> Option<&str> {
        None
    }

    fn build_request(&self, node: &ServerNode) -> Result<CommandRequest, RequestExecutorError>;

    /// Decodes a successful response body. `from_cache` is true when the body
    /// came from the response cache (an aggressive-cache hit or a 304
    /// revalidation) rather than off the wire.
    fn parse_response(&mut self, body: &str, from_cache: bool)
        -> Result<(), RequestExecutorError>;

    /// Hook for commands that understand statuses outside the executor's
    /// standard table. Returning `Ok(())` means the command handled the
    /// response; the default turns it into a server error.
    fn on_non_success_response(
        &mut self,
        status: StatusCode,
        body: &str,
    ) -> Result<(), RequestExecutorError> {
        Err(RequestExecutorError::server_error(status, body))
    }
}

/// Per-call routing hints supplied by the session layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionInfo {
    /// Keys round-robin read balancing so one session sticks to one node.
    pub session_id: i64,
    /// Bypasses the response cache for this call.
    pub no_caching: bool,
    /// Forwarded to the server so it can wait until this cluster-write etag
    /// is visible on the addressed node.
    pub last_cluster_write_etag: Option<i64>,
}

impl SessionInfo {
    pub fn new(session_id: i64) -> Self {
        Self {
            session_id,
            ..Self::default()
        }
    }
}
