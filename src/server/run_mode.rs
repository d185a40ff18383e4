//! Connection scheduling models.
//!
//! The daemon can drive accepted connections through either a fixed pool of
//! long-lived worker tasks (the default) or a fresh task per connection.
//! Both pull from the same pending-connection queue; only how that queue is
//! drained differs.

/// Selects how accepted connections are scheduled onto tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// A fixed number of worker tasks (sized by
    /// [`ServerLimits::max_connections`](crate::limits::ServerLimits::max_connections))
    /// repeatedly pull connections off the queue and handle them in a loop,
    /// reusing the same [`HttpConnection`](crate::server::connection::HttpConnection)
    /// (and its parse buffer) across connections.
    #[default]
    WorkerPool,
    /// Every accepted connection gets its own task, spawned on demand and
    /// torn down when the connection ends. Avoids the fixed pool's upfront
    /// buffer allocation at the cost of a `tokio::spawn` per connection.
    ThreadPerConnection,
}
