/// Notifications broadcast by a request executor.
///
/// Subscribe through [`RequestExecutor::subscribe`](crate::RequestExecutor::subscribe);
/// events are fire-and-forget and lagging subscribers miss old ones.
#[derive(Clone, Debug)]
pub enum ExecutorEvent {
    /// A new topology was installed.
    TopologyUpdated { etag: i64 },
    /// An attempt against one node failed; the request may still succeed on
    /// another node.
    RequestFailed { url: String },
    RequestSucceeded { url: String },
}
