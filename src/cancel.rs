//! Worker thread plumbing: dedicated threads with their own runtimes, and
//! the cooperative cancellation flag shared with the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use futures::prelude::*;
use tokio::task::LocalSet;
use tokio::time::{self, Duration};

/// Granularity of cancel checks while sleeping out a crawl delay.
const MICRO_SLEEP: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag. Cancelling is idempotent; workers poll
/// it between pipeline stages, never mid-fetch.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Sleeps for `delay` in short slices, giving up early when cancelled.
/// Returns `false` if the sleep was cut short.
pub async fn sleep_cancellable(delay: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + delay;

    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        time::sleep((deadline - now).min(MICRO_SLEEP)).await;
    }

    false
}

/// Runs a future on a fresh named thread with its own current-thread
/// runtime. Note that `Fut` need not be `Send`; a panic inside it is
/// captured by the returned handle.
pub fn spawn_onto_thread<F, Fut>(name: String, f: F) -> JoinHandle<()>
where
    F: 'static + Send + FnOnce() -> Fut,
    Fut: 'static + Future<Output = ()>,
{
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("can always init runtime");

            LocalSet::new().block_on(&runtime, f());
        })
        .expect("can always spawn")
}
