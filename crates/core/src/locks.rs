//! Mutual exclusion over the DDC/CI channel.
//!
//! A per-display lock is held around every hardware write or poll read of a
//! display. Refresh takes the global lock, which waits until no display lock
//! is held and blocks new display locks while it is pending or held.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

#[derive(Default)]
struct LockState {
    displays: BTreeSet<String>,
    global: bool,
    global_waiters: usize,
}

impl LockState {
    fn display_blocked(&self, stable_id: &str) -> bool {
        self.global || self.global_waiters > 0 || self.displays.contains(stable_id)
    }
}

pub struct LockRegistry {
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Takes the display lock without waiting. Used by polling, which skips
    /// busy displays.
    pub fn try_lock_display(&self, stable_id: &str) -> Option<DisplayLockGuard<'_>> {
        let mut state = self.state.lock();
        if state.display_blocked(stable_id) {
            return None;
        }
        state.displays.insert(stable_id.to_string());
        Some(DisplayLockGuard { registry: self, stable_id: stable_id.to_string() })
    }

    /// Waits up to `timeout` for the display lock.
    pub fn lock_display(&self, stable_id: &str, timeout: Duration) -> Option<DisplayLockGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.display_blocked(stable_id) {
            if self.released.wait_until(&mut state, deadline).timed_out() && state.display_blocked(stable_id) {
                return None;
            }
        }
        state.displays.insert(stable_id.to_string());
        Some(DisplayLockGuard { registry: self, stable_id: stable_id.to_string() })
    }

    /// Waits until every display lock is released, then holds the channel
    /// exclusively. On timeout returns the ids still locked.
    pub fn lock_global(&self, deadline: Instant) -> Result<GlobalLockGuard<'_>, Vec<String>> {
        let mut state = self.state.lock();
        state.global_waiters += 1;
        while state.global || !state.displays.is_empty() {
            if self.released.wait_until(&mut state, deadline).timed_out() && (state.global || !state.displays.is_empty()) {
                state.global_waiters -= 1;
                let held = state.displays.iter().cloned().collect();
                drop(state);
                self.released.notify_all();
                return Err(held);
            }
        }
        state.global_waiters -= 1;
        state.global = true;
        Ok(GlobalLockGuard { registry: self })
    }

    pub fn held_displays(&self) -> Vec<String> {
        self.state.lock().displays.iter().cloned().collect()
    }

    pub fn is_display_locked(&self, stable_id: &str) -> bool {
        self.state.lock().displays.contains(stable_id)
    }

    pub fn is_global_held(&self) -> bool {
        self.state.lock().global
    }

    fn release_display(&self, stable_id: &str) {
        self.state.lock().displays.remove(stable_id);
        self.released.notify_all();
    }

    fn release_global(&self) {
        self.state.lock().global = false;
        self.released.notify_all();
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use = "the display is unlocked when the guard is dropped"]
pub struct DisplayLockGuard<'a> {
    registry: &'a LockRegistry,
    stable_id: String,
}

impl DisplayLockGuard<'_> {
    pub fn stable_id(&self) -> &str {
        &self.stable_id
    }
}

impl Drop for DisplayLockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release_display(&self.stable_id);
    }
}

#[must_use = "the channel is released when the guard is dropped"]
pub struct GlobalLockGuard<'a> {
    registry: &'a LockRegistry,
}

impl Drop for GlobalLockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release_global();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn display_locks_are_exclusive_per_display() {
        let locks = LockRegistry::new();
        let a = locks.try_lock_display("a").unwrap();
        assert!(locks.try_lock_display("a").is_none());
        assert!(locks.try_lock_display("b").is_some());
        drop(a);
        assert!(locks.try_lock_display("a").is_some());
    }

    #[test]
    fn global_lock_excludes_display_locks() {
        let locks = LockRegistry::new();
        let global = locks.lock_global(Instant::now() + Duration::from_millis(10)).unwrap();
        assert!(locks.try_lock_display("a").is_none());
        assert!(locks.lock_display("a", Duration::from_millis(20)).is_none());
        drop(global);
        assert!(locks.try_lock_display("a").is_some());
    }

    #[test]
    fn global_lock_reports_held_displays_on_timeout() {
        let locks = LockRegistry::new();
        let _a = locks.try_lock_display("a").unwrap();
        let err = locks.lock_global(Instant::now() + Duration::from_millis(30)).err().unwrap();
        assert_eq!(err, vec!["a".to_string()]);
        // A failed global wait must not keep blocking displays
        assert!(locks.try_lock_display("b").is_some());
    }

    #[test]
    fn global_lock_waits_for_release() {
        let locks = Arc::new(LockRegistry::new());
        let guard_locks = Arc::clone(&locks);
        let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
        let holder = thread::spawn(move || {
            let _guard = guard_locks.try_lock_display("a").unwrap();
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
        });
        locked_rx.recv().unwrap();

        let global = locks.lock_global(Instant::now() + Duration::from_secs(5));
        assert!(global.is_ok());
        assert!(locks.held_displays().is_empty());
        holder.join().unwrap();
    }
}
