use std::time::Duration;

use tokio::time::Instant;

/// Exponential backoff parameters shared by every retry loop in this crate.
///
/// Hand-rolled rather than pulled in as a dependency so the attempt-count and overall-deadline
/// semantics stay exact and easy to reason about.
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl BackoffConfig {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    /// Delay to use before the `attempt`-th retry (0-indexed), clamped to `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let scaled = self.initial.as_secs_f64() * factor;
        let capped = scaled.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Outcome of a single attempt in a bounded retry loop.
pub enum Attempt<T, E> {
    Done(T),
    Retry(E),
}

/// Retries `op` with exponential backoff until it succeeds, `max_attempts` is exhausted, or
/// `deadline` passes, whichever comes first. `should_retry` classifies whether a given error is
/// worth retrying at all; a non-retriable error returns immediately.
///
/// This is the shared engine behind the topic-creation retry loop, the config-fetch-with-retry
/// path, the partition offset fetcher's per-partition retries, and the delete-with-retry loop.
pub async fn retry_with_backoff<T, E, Op, Fut, ShouldRetry>(
    config: BackoffConfig,
    max_attempts: u32,
    deadline: Instant,
    mut op: Op,
    should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: std::future::Future<Output = Attempt<T, E>>,
    ShouldRetry: Fn(&E) -> bool,
{
    let mut last_err = None;

    // The first attempt always runs regardless of `deadline`, even if it has already passed by
    // the time this function is called; only attempts after the first are deadline-gated. This
    // keeps `last_err` guaranteed to hold a value by the time the loop ends.
    for attempt in 0..max_attempts.max(1) {
        match op().await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry(err) => {
                if !should_retry(&err) {
                    return Err(err);
                }

                last_err = Some(err);

                if attempt + 1 >= max_attempts {
                    break;
                }

                if Instant::now() >= deadline {
                    break;
                }

                let delay = config.delay_for(attempt);
                let sleep_until = Instant::now() + delay;

                if sleep_until >= deadline {
                    break;
                }

                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_err.expect("at least one attempt is always made"))
}

/// Maximum value the consumer-recreation cadence (in poll iterations) is allowed to reach.
pub const MAX_RECREATION_CADENCE: u32 = 100;

/// Computes the next consumer-recreation cadence in the delete-polling loop: starts at 5
/// iterations, doubles each recreation, and clamps at [`MAX_RECREATION_CADENCE`]. Guards against
/// `u32` overflow turning the doubled value negative; in an unsigned type this manifests as
/// wraparound, which this function detects via `checked_mul` and replaces with the cap.
pub fn next_recreation_cadence(current: u32) -> u32 {
    match current.checked_mul(2) {
        Some(doubled) if doubled <= MAX_RECREATION_CADENCE => doubled,
        _ => MAX_RECREATION_CADENCE,
    }
}
