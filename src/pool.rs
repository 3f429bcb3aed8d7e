//! Bounded parallel execution for batch operations.
//!
//! Batch start and batch dispatch are subprocess-latency bound, so a small
//! pool of blocking threads is enough. Results come back in input order;
//! a panicking item is reported as an error, not propagated.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Run `f` over `items` with at most `workers` threads.
pub fn run_parallel<T, R, F>(items: Vec<T>, workers: usize, f: F) -> Vec<anyhow::Result<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> anyhow::Result<R> + Sync,
{
    let workers = workers.clamp(1, 100).min(items.len().max(1));
    let total = items.len();
    let slots: Mutex<Vec<Option<anyhow::Result<R>>>> =
        Mutex::new((0..total).map(|_| None).collect());
    let work: Vec<Mutex<Option<T>>> = items.into_iter().map(|i| Mutex::new(Some(i))).collect();
    let next = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                if index >= total {
                    break;
                }
                let Some(item) = work[index].lock().unwrap().take() else {
                    continue;
                };
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(item)))
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("task panicked")));
                slots.lock().unwrap()[index] = Some(result);
            });
        }
    });

    slots
        .into_inner()
        .unwrap()
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(anyhow::anyhow!("task dropped"))))
        .collect()
}
