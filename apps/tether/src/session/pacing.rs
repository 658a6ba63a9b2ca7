//! Debounce and throttle primitives for layout-driven resends.
//!
//! Both are cancel-and-replace: a new event always supersedes a pending
//! un-fired callback instead of stacking another timer behind it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Runs the most recent callback once the input has been quiet for the
/// configured window.
pub struct Debouncer {
    window: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Debouncer {
            window,
            pending: Mutex::new(None),
        }
    }

    pub fn call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let window = self.window;
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            f();
        });
        if let Some(previous) = self.pending.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(task) = self.pending.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct ThrottleState {
    last_fire: Option<Instant>,
    trailing: Option<JoinHandle<()>>,
}

/// Fires immediately when idle, then at most once per window; calls
/// landing inside the window collapse into one trailing invocation
/// carrying the latest callback.
pub struct Throttle {
    window: Duration,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Throttle {
            window,
            state: Arc::new(Mutex::new(ThrottleState {
                last_fire: None,
                trailing: None,
            })),
        }
    }

    pub fn call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let mut state = self.state.lock();
        let due = match state.last_fire {
            Some(last) => now.duration_since(last) >= self.window,
            None => true,
        };
        if due {
            state.last_fire = Some(now);
            drop(state);
            f();
            return;
        }

        let remaining = self
            .window
            .saturating_sub(now.duration_since(state.last_fire.unwrap_or(now)));
        let shared = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            shared.lock().last_fire = Some(Instant::now());
            f();
        });
        if let Some(previous) = state.trailing.replace(task) {
            previous.abort();
        }
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().trailing.take() {
            task.abort();
        }
    }
}
