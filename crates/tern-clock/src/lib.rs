//! A time source that can be substituted in tests.
//!
//! Components that expire cache entries or enforce deadlines take an
//! `Arc<dyn Clock>` rather than reading the system time directly.
//! Production code passes `SystemClock`; tests pass a `ManualClock`
//! and move time forward explicitly with `ManualClock::advance`.
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic time, used for expiry and deadlines
    fn now(&self) -> Instant;

    /// Wall clock time, used where a timestamp is recorded
    /// somewhere outside the process, such as a file name
    fn system_time(&self) -> SystemTime;

    /// Returns a future that resolves once `duration` has elapsed.
    /// The deadline is computed when this method is called, not when
    /// the returned future is first polled.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// The real clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        // tokio::time::sleep captures its deadline at construction
        Box::pin(tokio::time::sleep(duration))
    }
}

struct Timer {
    deadline: Duration,
    seq: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    next_seq: u64,
    timers: Vec<Timer>,
}

/// A clock that only moves when told to.
///
/// Monotonic time starts at the `Instant` the clock was created and
/// wall time starts at the UNIX epoch; both advance together.
pub struct ManualClock {
    base: Instant,
    state: Mutex<ManualState>,
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.state.lock();
        fmt.debug_struct("ManualClock")
            .field("elapsed", &state.elapsed)
            .field("pending_timers", &state.timers.len())
            .finish()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Total simulated time since the clock was created
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Number of sleeps that have not yet fired and are still
    /// being waited on
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .iter()
            .filter(|timer| !timer.tx.is_closed())
            .count()
    }

    /// Move time forward by `duration`, waking every sleeper whose
    /// deadline has now been reached, earliest first.
    pub fn advance(&self, duration: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.elapsed += duration;
            let now = state.elapsed;

            let mut due = vec![];
            let mut idx = 0;
            while idx < state.timers.len() {
                if state.timers[idx].deadline <= now {
                    due.push(state.timers.swap_remove(idx));
                } else {
                    idx += 1;
                }
            }
            due.sort_by_key(|timer| (timer.deadline, timer.seq));
            due
        };

        for timer in due {
            // The sleeper may have been dropped; that's fine
            timer.tx.send(()).ok();
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.state.lock().elapsed
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.state.lock().elapsed
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            return Box::pin(async {});
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            // Forget sleeps that were abandoned before they fired
            state.timers.retain(|timer| !timer.tx.is_closed());
            let deadline = state.elapsed + duration;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.timers.push(Timer { deadline, seq, tx });
        }
        Box::pin(async move {
            // A closed channel means the clock itself went away,
            // in which case nothing will ever wake us; treat it
            // as having fired.
            rx.await.ok();
        })
    }
}
