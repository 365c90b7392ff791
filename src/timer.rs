//! Cancellable repeating timer.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Runs a callback every period until the callback returns false or the
/// timer is dropped.
///
/// The first tick fires one period after start.
#[derive(Debug)]
pub struct RepeatingTimer {
    task: JoinHandle<()>,
}

impl RepeatingTimer {
    /// Start a timer on `runtime`.
    pub fn start<F>(runtime: &Handle, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let task = runtime.spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if !tick() {
                    break;
                }
            }
        });

        Self { task }
    }

    /// Whether the timer stopped on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timer_stops_when_callback_declines() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let timer = RepeatingTimer::start(&Handle::current(), Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst) < 2
        });

        for _ in 0..200 {
            if timer.is_finished() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }

        assert!(timer.is_finished());
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_cancels_timer() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let timer = RepeatingTimer::start(&Handle::current(), Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        time::sleep(Duration::from_millis(30)).await;
        drop(timer);

        // Let an in-flight tick settle before sampling.
        time::sleep(Duration::from_millis(10)).await;
        let after_drop = ticks.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(50)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
    }
}
