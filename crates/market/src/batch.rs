use std::future::Future;

use tokio::task::JoinSet;
use tracing::warn;

/// Runs `work` over every item with at most `batch_size` tasks in flight,
/// waiting for each batch to drain before starting the next. Output order
/// matches input order; an item whose task panics is dropped from the result.
pub async fn run_batches<T, F, Fut>(items: Vec<T>, batch_size: usize, work: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let batch_size = batch_size.max(1);
    let total = items.len();
    let mut slots: Vec<Option<T>> = Vec::new();
    slots.resize_with(total, || None);

    let mut entries = items.into_iter().enumerate();
    loop {
        let mut set = JoinSet::new();
        for (index, item) in entries.by_ref().take(batch_size) {
            let fut = work(item);
            set.spawn(async move { (index, fut.await) });
        }
        if set.is_empty() {
            break;
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, item)) => slots[index] = Some(item),
                Err(error) => warn!(error = %error, "batch task failed"),
            }
        }
    }

    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::run_batches;

    #[tokio::test]
    async fn preserves_input_order() {
        let items: Vec<u32> = (0..10).collect();
        let out = run_batches(items.clone(), 3, |item| async move {
            // Later items finish first so completion order is reversed.
            tokio::time::sleep(Duration::from_millis(u64::from(30 - item))).await;
            item
        })
        .await;
        assert_eq!(out, items);
    }

    #[tokio::test]
    async fn never_exceeds_the_batch_size() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<u32> = (0..12).collect();
        let out = run_batches(items, 4, {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |item| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    item
                }
            }
        })
        .await;

        assert_eq!(out.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn zero_batch_size_is_treated_as_one() {
        let out = run_batches(vec![1, 2, 3], 0, |item| async move { item * 2 }).await;
        assert_eq!(out, vec![2, 4, 6]);
    }
}
