//! Gap timeout thread.
//!
//! The timer watches a single flag and raises another: while a gap is open
//! it sleeps for the configured timeout and then requests retirement via
//! [`Sequencer::trigger_timeout`]. It never reads or mutates window state,
//! so the ingress thread stays the sole writer of the window. Retirement
//! happens on the ingress thread at its next observation, which bounds the
//! effective timeout at one sleep granularity past the configured value.

use std::sync::atomic::{AtomicBool, Ordering::Acquire, Ordering::Release};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cpu;
use crate::sequencer::Sequencer;

pub const DEFAULT_GAP_TIMEOUT: Duration = Duration::from_millis(5);

pub struct GapTimer {
    enabled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl GapTimer {
    /// Spawn the timer thread. `pin_cpu` is advisory; pinning or priority
    /// failures are reported and ignored.
    pub fn spawn(sequencer: Arc<Sequencer>, timeout: Duration, pin_cpu: Option<usize>) -> Self {
        let enabled = Arc::new(AtomicBool::new(true));
        let enabled_in_thread = Arc::clone(&enabled);

        let handle = thread::Builder::new()
            .name("gap-timer".into())
            .spawn(move || {
                if let Some(id) = pin_cpu {
                    if let Err(err) = cpu::pin_to_cpu(id) {
                        warn!(cpu = id, %err, "failed to pin gap timer");
                    }
                    if let Err(err) = cpu::raise_priority() {
                        warn!(%err, "failed to raise gap timer priority");
                    }
                }
                // Re-check cadence while no gap is open.
                let idle = (timeout / 10).max(Duration::from_micros(100));
                debug!(?timeout, "gap timer running");

                while enabled_in_thread.load(Acquire) {
                    if sequencer.gap_exists() {
                        thread::sleep(timeout);
                        sequencer.trigger_timeout();
                    } else {
                        thread::sleep(idle);
                    }
                }
            })
            .expect("failed to spawn gap-timer thread");

        GapTimer { enabled, handle }
    }

    /// Cooperative shutdown: clear the run flag and join.
    pub fn stop(self) {
        self.enabled.store(false, Release);
        if self.handle.join().is_err() {
            warn!("gap timer panicked");
        }
    }
}
