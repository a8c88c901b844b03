//! Bounded fan-out helper.
//!
//! Runs a batch of futures with a fixed concurrency ceiling and waits for the
//! whole batch; a failing branch does not short-circuit its siblings. Used by
//! DAG dispatch and by the flow manager's bulk-recovery pass.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Execute `futures` with at most `limit` running concurrently, collecting
/// every output before returning.
pub async fn bounded<T, F>(limit: usize, futures: Vec<F>) -> Vec<T>
where
    F: Future<Output = T> + Send,
    T: Send,
{
    stream::iter(futures)
        .buffer_unordered(limit.max(1))
        .collect()
        .await
}
