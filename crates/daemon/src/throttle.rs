//! Trailing-edge throttling of a side-effecting action.
//!
//! Used for progress emission and cache write-back. Any number of
//! [`Throttler::trigger`] calls collapse into executions spaced at least
//! `interval` apart, and a trigger is never lost: one that arrives while an
//! execution is running schedules exactly one more.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

type Action = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct ThrottleState {
    /// A run is spawned and has not started yet.
    scheduled: bool,
    /// The action is executing.
    running: bool,
    /// Triggered while running.
    rerun: bool,
    last_started: Option<Instant>,
}

struct Inner {
    interval: Duration,
    action: Action,
    state: Mutex<ThrottleState>,
    runtime: Handle,
}

impl Inner {
    fn delay_since(&self, last_started: Option<Instant>) -> Duration {
        match last_started {
            Some(at) => self.interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }
}

/// Rate limiter guaranteeing a trailing execution after a burst of triggers.
#[derive(Clone)]
pub struct Throttler {
    inner: Arc<Inner>,
}

impl Throttler {
    /// Wrap `action`. Must be called from within a tokio runtime; executions
    /// are spawned onto that runtime.
    pub fn new<F, Fut>(interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action: Action = Box::new(move || Box::pin(action()));
        Self {
            inner: Arc::new(Inner {
                interval,
                action,
                state: Mutex::new(ThrottleState::default()),
                runtime: Handle::current(),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Request an execution. Never blocks and never runs the action inline.
    pub fn trigger(&self) {
        let delay = {
            let mut state = self.inner.state.lock();
            if state.scheduled {
                return;
            }
            if state.running {
                state.rerun = true;
                return;
            }
            state.scheduled = true;
            self.inner.delay_since(state.last_started)
        };

        let inner = self.inner.clone();
        self.inner.runtime.spawn(run(inner, delay));
    }
}

async fn run(inner: Arc<Inner>, mut delay: Duration) {
    loop {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = inner.state.lock();
            state.scheduled = false;
            state.running = true;
            state.last_started = Some(Instant::now());
        }

        (inner.action)().await;

        let mut state = inner.state.lock();
        state.running = false;
        if !state.rerun {
            return;
        }
        state.rerun = false;
        state.scheduled = true;
        delay = inner.delay_since(state.last_started);
    }
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("interval", &self.inner.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_throttler(
        interval: Duration,
        work: Duration,
    ) -> (Throttler, Arc<Mutex<Vec<std::time::Instant>>>) {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let recorded = starts.clone();
        let throttler = Throttler::new(interval, move || {
            let recorded = recorded.clone();
            async move {
                recorded.lock().push(std::time::Instant::now());
                if !work.is_zero() {
                    tokio::time::sleep(work).await;
                }
            }
        });
        (throttler, starts)
    }

    #[tokio::test]
    async fn test_single_trigger_runs_once() {
        let (throttler, starts) = recording_throttler(Duration::from_millis(50), Duration::ZERO);
        throttler.trigger();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(starts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_burst_coalesces() {
        let (throttler, starts) = recording_throttler(Duration::from_millis(100), Duration::ZERO);
        for _ in 0..200 {
            throttler.trigger();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        // The first trigger runs immediately; everything after it was
        // absorbed by that scheduled run.
        assert_eq!(starts.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_executions_are_spaced_and_trailing() {
        let interval = Duration::from_millis(40);
        let (throttler, starts) = recording_throttler(interval, Duration::from_millis(5));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let throttler = throttler.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..30 {
                    throttler.trigger();
                    tokio::time::sleep(Duration::from_millis(3)).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let last_trigger = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let starts = starts.lock().clone();
        assert!(starts.len() >= 2);
        for pair in starts.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(
                gap + Duration::from_millis(2) >= interval,
                "executions started {:?} apart, interval is {:?}",
                gap,
                interval
            );
        }
        // No starvation: a run began at or after the final trigger's window.
        let last_start = *starts.last().unwrap();
        assert!(last_start + interval >= last_trigger);
    }

    #[tokio::test]
    async fn test_trigger_during_execution_schedules_one_more() {
        let count = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        let counted = count.clone();
        let gate = release.clone();
        let throttler = Throttler::new(Duration::from_millis(20), move || {
            let counted = counted.clone();
            let gate = gate.clone();
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    gate.notified().await;
                }
            }
        });

        throttler.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Running now: these must collapse into exactly one follow-up run.
        throttler.trigger();
        throttler.trigger();
        throttler.trigger();
        release.notify_one();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
