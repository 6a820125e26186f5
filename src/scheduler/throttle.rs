use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{self, Instant},
};

use super::Action;

/// Leading-edge throttle with one coalesced trailing run: the action runs at
/// most once per `interval`.
pub struct Throttle<A> {
    inner: Arc<ThrottleInner<A>>,
}

struct ThrottleInner<A> {
    name: String,
    interval: Duration,
    action: Action<A>,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    last_run: Option<Instant>,
    trailing: Option<JoinHandle<()>>,
    /// Bumped on every schedule so a superseded trailing task that already
    /// woke up cannot fire.
    generation: u64,
}

impl<A> Clone for Throttle<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Send + 'static> ThrottleInner<A> {
    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<A: Send + 'static> Throttle<A> {
    pub fn new(name: impl Into<String>, interval: Duration, action: Action<A>) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                name: name.into(),
                interval,
                action,
                state: Mutex::new(ThrottleState::default()),
            }),
        }
    }

    /// Runs now when cold, otherwise (re)schedules the trailing run at the
    /// interval boundary. Must be called from within a tokio runtime.
    pub fn call(&self, args: A) {
        let mut state = self.inner.state();
        if let Some(handle) = state.trailing.take() {
            handle.abort();
        }
        state.generation = state.generation.wrapping_add(1);

        let now = Instant::now();
        match state.last_run {
            Some(last) if now < last + self.inner.interval => {
                let run_at = last + self.inner.interval;
                let generation = state.generation;
                let inner = Arc::clone(&self.inner);
                state.trailing = Some(tokio::spawn(async move {
                    time::sleep_until(run_at).await;
                    {
                        let mut state = inner.state();
                        if state.generation != generation {
                            return;
                        }
                        state.last_run = Some(run_at);
                        state.trailing = None;
                    }
                    log::debug!("throttled {} firing (trailing)", inner.name);
                    tokio::spawn((inner.action)(args));
                }));
            }
            _ => {
                state.last_run = Some(now);
                log::debug!("throttled {} firing (leading)", self.inner.name);
                tokio::spawn((self.inner.action)(args));
            }
        }
    }

    pub fn has_trailing(&self) -> bool {
        self.inner
            .state()
            .trailing
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::action;

    fn recording(interval: Duration) -> (Throttle<u32>, Arc<Mutex<Vec<(Duration, u32)>>>) {
        let start = Instant::now();
        let runs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&runs);
        let throttle = Throttle::new(
            "test",
            interval,
            action(move |value: u32| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push((Instant::now() - start, value));
                }
            }),
        );
        (throttle, runs)
    }

    #[tokio::test(start_paused = true)]
    async fn cold_call_runs_immediately() {
        let (throttle, runs) = recording(Duration::from_secs(15));

        throttle.call(1);
        tokio::task::yield_now().await;

        let runs = runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0.as_secs(), 0);
        assert_eq!(runs[0].1, 1);
        assert!(!throttle.has_trailing());
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_calls_run_once_per_interval() {
        let interval = Duration::from_secs(15);
        let (throttle, runs) = recording(interval);

        // Calls every 4s for 56s: runs at 0, 15, 30 and 45.
        let mut value = 0;
        loop {
            throttle.call(value);
            if value == 14 {
                break;
            }
            value += 1;
            time::sleep(Duration::from_secs(4)).await;
        }
        time::sleep(Duration::from_secs(1)).await;

        let runs = runs.lock().unwrap().clone();
        let instants: Vec<u64> = runs.iter().map(|(at, _)| at.as_secs()).collect();
        assert_eq!(instants, vec![0, 15, 30, 45]);
        assert_eq!(runs.len(), (56 / 15) + 1);
        // Trailing runs carry the latest arguments seen before the boundary.
        assert_eq!(runs[1].1, 3);
        assert_eq!(runs[2].1, 7);
        assert!(throttle.has_trailing());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_single_trailing_run() {
        let (throttle, runs) = recording(Duration::from_secs(10));

        throttle.call(0);
        for value in 1..6 {
            time::sleep(Duration::from_secs(1)).await;
            throttle.call(value);
        }
        time::sleep(Duration::from_secs(20)).await;

        let runs: Vec<(u64, u32)> = runs
            .lock()
            .unwrap()
            .iter()
            .map(|(at, value)| (at.as_secs(), *value))
            .collect();
        assert_eq!(runs, vec![(0, 0), (10, 5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_past_interval_runs_leading_again() {
        let (throttle, runs) = recording(Duration::from_secs(10));

        throttle.call(1);
        time::sleep(Duration::from_secs(12)).await;
        throttle.call(2);
        tokio::task::yield_now().await;

        let instants: Vec<u64> = runs.lock().unwrap().iter().map(|(at, _)| at.as_secs()).collect();
        assert_eq!(instants, vec![0, 12]);
    }
}
