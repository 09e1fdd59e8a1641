use std::collections::VecDeque;
use std::sync::Arc;

use tokio::task::JoinSet;

/// Drain `items` with at most `concurrency` operations in flight.
///
/// Items are started in FIFO order; results come back in completion order. Each
/// item is handed to `operation` exactly once, so `operation` is expected to turn
/// its own failures into values, panics included. A join error is still logged
/// and skipped here so one bad item never stops the remaining ones.
pub async fn run_pool<T, R, F, Fut>(items: Vec<T>, concurrency: usize, operation: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    let operation = Arc::new(operation);
    let mut queue = VecDeque::from(items);
    let mut results = Vec::with_capacity(queue.len());
    let mut set = JoinSet::new();

    loop {
        while set.len() < concurrency {
            let Some(item) = queue.pop_front() else {
                break;
            };
            let operation = operation.clone();
            set.spawn(async move { operation(item).await });
        }

        let Some(joined) = set.join_next().await else {
            break;
        };
        match joined {
            Ok(result) => results.push(result),
            Err(err) => tracing::error!("pool worker failed: {err}"),
        }
    }

    results
}
