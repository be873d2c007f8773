//! Bounded polling policies.
//!
//! Every wait in this crate is a bounded poll, never an unconditional wait,
//! so a run always terminates within its configured ceiling. Controllers
//! parameterize these policies per operation instead of hand-rolling loops.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// A bounded poll: probe, then sleep `interval`, until `budget` is spent.
///
/// The probe runs at least once even with a zero budget, and transient
/// probe failures are expressed as `None` so they count against the budget
/// instead of escaping the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub budget: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(budget: Duration, interval: Duration) -> Self {
        Self { budget, interval }
    }

    /// A policy expressed as a fixed number of attempts.
    pub fn attempts(count: u32, interval: Duration) -> Self {
        Self {
            budget: interval * count.saturating_sub(1),
            interval,
        }
    }

    /// Poll `probe` until it yields a value or the budget is exhausted.
    pub async fn run<T, F, Fut>(&self, mut probe: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let mut waited = Duration::ZERO;
        loop {
            if let Some(value) = probe().await {
                return Some(value);
            }
            if waited >= self.budget {
                return None;
            }
            sleep(self.interval).await;
            waited += self.interval;
        }
    }

    /// Poll a boolean probe; `true` ends the loop.
    pub async fn run_until<F, Fut>(&self, mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.run(|| {
            let fut = probe();
            async move {
                if fut.await {
                    Some(())
                } else {
                    None
                }
            }
        })
        .await
        .is_some()
    }
}

/// An unconditional settle delay followed by a bounded poll.
///
/// Suggestion panels are debounce-driven and can re-render mid-flight;
/// polling too early risks acting on a stale render, so the first phase
/// always waits out the minimum delay.
#[derive(Debug, Clone, Copy)]
pub struct TwoPhaseWait {
    pub settle: Duration,
    pub poll: PollPolicy,
}

impl TwoPhaseWait {
    pub fn new(settle: Duration, budget: Duration, interval: Duration) -> Self {
        Self {
            settle,
            poll: PollPolicy::new(budget, interval),
        }
    }

    pub async fn run<T, F, Fut>(&self, probe: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        sleep(self.settle).await;
        self.poll.run(probe).await
    }
}
