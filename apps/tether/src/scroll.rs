//! Animated vertical scrolling toward daemon-requested positions.
//!
//! One animation at a time: starting a new glide cancels the running
//! one mid-flight and takes over from the current position, so remote
//! scroll targets arriving in quick succession never fight each other.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::host::HostWindow;

/// Time between animation frames.
pub const SCROLL_TICK: Duration = Duration::from_millis(100);
/// Glide duration bounds; in between, one millisecond per pixel of
/// distance.
pub const SCROLL_DURATION_MIN_MS: f64 = 400.0;
pub const SCROLL_DURATION_MAX_MS: f64 = 2000.0;

fn ease_in_out_quint(p: f64) -> f64 {
    if p < 0.5 {
        16.0 * p.powi(5)
    } else {
        let q = p - 1.0;
        1.0 + 16.0 * q.powi(5)
    }
}

pub struct ScrollAnimator {
    window: Arc<dyn HostWindow>,
    active: Mutex<Option<JoinHandle<()>>>,
}

impl ScrollAnimator {
    pub fn new(window: Arc<dyn HostWindow>) -> Self {
        ScrollAnimator {
            window,
            active: Mutex::new(None),
        }
    }

    /// Glide the document to vertical position `target`, keeping the
    /// horizontal position where it is. Replaces any running glide.
    pub fn scroll_to_y(&self, target: f64) {
        let (start_x, start_y) = self.window.scroll_pos();
        let delta = target - start_y;
        if delta == 0.0 {
            self.cancel();
            return;
        }

        let duration_ms = delta.abs().clamp(SCROLL_DURATION_MIN_MS, SCROLL_DURATION_MAX_MS);
        let window = Arc::clone(&self.window);
        let task = tokio::spawn(async move {
            let mut elapsed_ms = 0.0;
            loop {
                sleep(SCROLL_TICK).await;
                elapsed_ms += SCROLL_TICK.as_millis() as f64;
                if elapsed_ms >= duration_ms {
                    window.scroll_to(start_x, target);
                    return;
                }
                let eased = ease_in_out_quint(elapsed_ms / duration_ms);
                window.scroll_to(start_x, start_y + delta * eased);
            }
        });
        if let Some(previous) = self.active.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(task) = self.active.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ScrollAnimator {
    fn drop(&mut self) {
        self.cancel();
    }
}
