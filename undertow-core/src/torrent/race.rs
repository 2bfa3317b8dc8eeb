//! Bounded-concurrency race returning the first successful worker result

use std::future::Future;

use tokio::task::JoinSet;

/// Runs `worker` over `items` with at most `concurrency` tasks in flight and
/// returns the first `Some` result.
///
/// Items are launched in order as slots free up. Once a worker succeeds every
/// other task is aborted, dropping whatever connections it owned. Workers
/// returning `None`, panicking or being cancelled count as failures. Returns
/// `None` after every item failed. A concurrency of 0 is treated as 1.
///
/// Which of several near-simultaneous successes wins is unspecified.
pub async fn first_success<I, T, F, Fut>(items: Vec<I>, concurrency: usize, worker: F) -> Option<T>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Option<T>> + Send + 'static,
    T: Send + 'static,
{
    let concurrency = concurrency.max(1);
    let mut queue = items.into_iter();
    let mut tasks = JoinSet::new();

    for item in queue.by_ref().take(concurrency) {
        tasks.spawn(worker(item));
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(result)) => {
                tasks.abort_all();
                return Some(result);
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("race worker did not finish: {e}"),
        }

        if let Some(item) = queue.next() {
            tasks.spawn(worker(item));
        }
    }

    None
}
