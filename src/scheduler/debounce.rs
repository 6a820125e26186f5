use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{task::JoinHandle, time};

use super::Action;

/// Trailing-edge debounce: every call pushes the run back by `delay`, and the
/// arguments of the last call win.
pub struct Debounce<A> {
    inner: Arc<DebounceInner<A>>,
}

struct DebounceInner<A> {
    name: String,
    delay: Duration,
    action: Action<A>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl<A> Clone for Debounce<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Send + 'static> Debounce<A> {
    pub fn new(name: impl Into<String>, delay: Duration, action: Action<A>) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                name: name.into(),
                delay,
                action,
                pending: Mutex::new(None),
            }),
        }
    }

    /// Replaces any pending call with this one. Must be called from within a
    /// tokio runtime.
    pub fn call(&self, args: A) {
        let mut pending = self.pending();
        if let Some(handle) = pending.take() {
            handle.abort();
        }

        let delay = self.inner.delay;
        let action = Arc::clone(&self.inner.action);
        let name = self.inner.name.clone();
        *pending = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            log::debug!("debounced {} firing", name);
            // Detach so a later call() cannot abort a run that already started.
            tokio::spawn(action(args));
        }));
    }

    /// Drops the pending call, if any.
    pub fn cancel(&self) {
        if let Some(handle) = self.pending().take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn pending(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
