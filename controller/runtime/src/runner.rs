use crate::limit::TokenBucket;
use std::{future::Future, sync::Arc};
use tokio::{
    sync::Notify,
    time::{self, Duration, Instant},
};

/// Runs a function when triggered, no more often than once per
/// `min_interval` (after an initial burst) and at least once per
/// `max_interval`.
///
/// Triggers that arrive while the function runs are collapsed into a single
/// follow-up run.
#[derive(Copy, Clone, Debug)]
pub struct BoundedFrequency {
    min_interval: Duration,
    max_interval: Duration,
    burst: u32,
}

impl BoundedFrequency {
    pub const fn new(min_interval: Duration, max_interval: Duration, burst: u32) -> Self {
        Self {
            min_interval,
            max_interval,
            burst,
        }
    }

    pub async fn run<F, Fut>(self, trigger: Arc<Notify>, shutdown: drain::Watch, mut f: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let rate = 1.0 / self.min_interval.as_secs_f64();
        let mut bucket = TokenBucket::new(rate, self.burst, Instant::now());
        let mut last_run = Instant::now();

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => return,
                _ = trigger.notified() => {}
                _ = time::sleep_until(last_run + self.max_interval) => {}
            }

            let wait = bucket.reserve(Instant::now());
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return,
                    _ = time::sleep(wait) => {}
                }
            }

            f().await;
            last_run = Instant::now();
        }
    }
}
