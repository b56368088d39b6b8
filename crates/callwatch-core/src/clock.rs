//! Injectable time source
//!
//! Every deadline in the core is an absolute wall-clock time. [`SystemClock`]
//! sleeps on the tokio timer; [`ManualClock`] only moves when told to and is
//! what tests and simulations drive escalation timers with.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Source of the current time and of deadline sleeps
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once `now() >= deadline`. Must never resolve early.
    fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'static, ()>;
}

/// Wall clock backed by `tokio::time`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            // The tokio timer may round down, so re-check against the wall clock
            loop {
                let remaining = deadline - Utc::now();
                match remaining.to_std() {
                    Ok(d) if !d.is_zero() => tokio::time::sleep(d).await,
                    _ => break,
                }
            }
        })
    }
}

/// Clock that advances only through [`ManualClock::advance`] or [`ManualClock::set`]
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

struct ManualInner {
    now: Mutex<DateTime<Utc>>,
    tick: watch::Sender<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let (tick, _) = watch::channel(start);
        Self {
            inner: Arc::new(ManualInner {
                now: Mutex::new(start),
                tick,
            }),
        }
    }

    /// Move time forward and wake every sleeper whose deadline has passed
    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let next = {
            let mut now = self.inner.now.lock();
            *now += step;
            *now
        };
        self.inner.tick.send_replace(next);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.inner.now.lock() = to;
        self.inner.tick.send_replace(to);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.now.lock()
    }

    fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'static, ()> {
        let mut rx = self.inner.tick.subscribe();
        Box::pin(async move {
            loop {
                if *rx.borrow_and_update() >= deadline {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Clock dropped, time will never reach the deadline
                    futures::future::pending::<()>().await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_manual_clock_wakes_only_at_deadline() {
        let clock = ManualClock::default();
        let deadline = clock.now() + chrono::Duration::seconds(30);
        let mut sleep = clock.sleep_until(deadline);

        assert!((&mut sleep).now_or_never().is_none());

        clock.advance(Duration::from_secs(29));
        tokio::task::yield_now().await;
        assert!((&mut sleep).now_or_never().is_none());

        clock.advance(Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(1), sleep)
            .await
            .expect("sleeper should wake at the deadline");
    }

    #[tokio::test]
    async fn test_past_deadline_resolves_immediately() {
        let clock = ManualClock::default();
        let past = clock.now() - chrono::Duration::seconds(5);
        assert!(clock.sleep_until(past).now_or_never().is_some());

        let system = SystemClock;
        let past = system.now() - chrono::Duration::seconds(5);
        tokio::time::timeout(Duration::from_millis(100), system.sleep_until(past))
            .await
            .expect("past deadline should not sleep");
    }
}
