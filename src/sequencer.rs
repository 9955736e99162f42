//! Test-only scheduling hooks.
//!
//! Named checkpoints in the implementation call [`at`]; in normal
//! operation that is a single relaxed atomic load and nothing more. Tests
//! that need a deterministic interleaving install an ordered schedule of
//! point names with [`enable`]: each `at(point)` then blocks until its
//! name reaches the front of the schedule.
//!
//! A blocked point gives up after a bounded wait so a mis-written
//! schedule turns into a noisy test failure instead of a hang.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex};

/// One allocation inside a long-record chain write.
pub const LONG_RECORD_ALLOCATE: &str = "LONG_RECORD_ALLOCATE";

/// One page handed to the volume free chain by cleanup.
pub const CLEANUP_FREE_PAGE: &str = "CLEANUP_FREE_PAGE";

/// Upper bound a point will wait for its turn.
const POINT_TIMEOUT: Duration = Duration::from_secs(5);

struct SequencerState {
    enabled: AtomicBool,
    schedule: Mutex<Vec<&'static str>>,
    turn: Condvar,
}

fn state() -> &'static SequencerState {
    static STATE: OnceLock<SequencerState> = OnceLock::new();
    STATE.get_or_init(|| SequencerState {
        enabled: AtomicBool::new(false),
        schedule: Mutex::new(Vec::new()),
        turn: Condvar::new(),
    })
}

/// A named scheduling point. No-op unless a schedule is installed.
pub fn at(point: &'static str) {
    let state = state();
    if !state.enabled.load(Ordering::Relaxed) {
        return;
    }

    let mut schedule = state.schedule.lock();
    let deadline = std::time::Instant::now() + POINT_TIMEOUT;
    loop {
        match schedule.first() {
            None => return,
            Some(&front) if front == point => {
                schedule.remove(0);
                state.turn.notify_all();
                return;
            }
            Some(_) => {
                if state.turn.wait_until(&mut schedule, deadline).timed_out() {
                    warn!("sequencer point {:?} timed out waiting for its turn", point);
                    return;
                }
            }
        }
    }
}

/// Install an ordered schedule and enable the hooks.
pub fn enable(schedule: Vec<&'static str>) {
    let state = state();
    *state.schedule.lock() = schedule;
    state.enabled.store(true, Ordering::Relaxed);
}

/// Drop any schedule and disable the hooks.
pub fn disable() {
    let state = state();
    state.enabled.store(false, Ordering::Relaxed);
    state.schedule.lock().clear();
    state.turn.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_disabled_is_noop() {
        disable();
        at(LONG_RECORD_ALLOCATE); // returns immediately
    }

    #[test]
    fn test_schedule_orders_two_threads() {
        enable(vec![CLEANUP_FREE_PAGE, LONG_RECORD_ALLOCATE]);

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = Arc::clone(&order);
        let order_b = Arc::clone(&order);

        let a = thread::spawn(move || {
            at(LONG_RECORD_ALLOCATE); // must wait for the free-page point
            order_a.lock().push("allocate");
        });
        let b = thread::spawn(move || {
            order_b.lock().push("free");
            at(CLEANUP_FREE_PAGE);
        });

        a.join().unwrap();
        b.join().unwrap();
        disable();

        assert_eq!(*order.lock(), vec!["free", "allocate"]);
    }
}
