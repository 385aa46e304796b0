//! Activation state for the feedback loop.
//!
//! The state lives in memory for fast reads and is mirrored to the
//! store on every change, so a restarted process resumes an in-flight
//! ramp instead of forgetting its floor.

use std::sync::Arc;

use parking_lot::Mutex;

use tracing::{debug, error, warn};

use crate::store::{AtomicStore, PersistedLoopState};

const INACTIVE: PersistedLoopState = PersistedLoopState {
    active: false,
    previous_limit: 0,
    target_limit: 0,
    activated_at: 0,
};

pub struct LoopStateManager {
    store: Arc<dyn AtomicStore>,
    state: Mutex<PersistedLoopState>,
}

impl LoopStateManager {
    /// Build the manager, restoring any persisted state. A store outage
    /// at startup reads as no prior state.
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        let restored = match store.load_loop_state() {
            Ok(Some(state)) => {
                if state.active {
                    debug!(
                        previous_limit = state.previous_limit,
                        target_limit = state.target_limit,
                        "restored active feedback loop state"
                    );
                }
                state
            }
            Ok(None) => INACTIVE,
            Err(e) => {
                error!(error = %e, "loop state restore failed, starting inactive");
                INACTIVE
            }
        };
        Self {
            store,
            state: Mutex::new(restored),
        }
    }

    /// Activate the loop with the given floor. Idempotent: a second
    /// scale-out while active returns the existing state untouched.
    pub fn activate_on_scale_out(&self, current_limit: u32, now_ms: u64) -> PersistedLoopState {
        let mut state = self.state.lock();
        if state.active {
            warn!(activated_at = state.activated_at, "feedback loop already active");
            return *state;
        }
        *state = PersistedLoopState {
            active: true,
            previous_limit: current_limit,
            target_limit: 0,
            activated_at: now_ms,
        };
        if let Err(e) = self.store.save_loop_state(&state) {
            error!(error = %e, "loop state persist failed");
        }
        debug!(floor = current_limit, "feedback loop activated");
        *state
    }

    pub fn set_target_limit(&self, target: u32) {
        self.state.lock().target_limit = target;
        if let Err(e) = self.store.save_target_limit(target) {
            error!(error = %e, target, "target limit persist failed");
        }
        debug!(target, "target limit set");
    }

    pub fn deactivate(&self) {
        if let Err(e) = self.store.clear_loop_state() {
            error!(error = %e, "loop state clear failed");
        }
        *self.state.lock() = INACTIVE;
        debug!("feedback loop deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn previous_limit(&self) -> u32 {
        self.state.lock().previous_limit
    }

    pub fn target_limit(&self) -> u32 {
        self.state.lock().target_limit
    }

    pub fn snapshot(&self) -> PersistedLoopState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn activation_is_idempotent() {
        let manager = LoopStateManager::new(Arc::new(MemoryStore::new()));
        assert!(!manager.is_active());

        let first = manager.activate_on_scale_out(15, 1_000);
        assert!(first.active);
        assert_eq!(first.previous_limit, 15);
        assert_eq!(first.target_limit, 0);

        // A later scale-out does not move the floor
        let second = manager.activate_on_scale_out(40, 2_000);
        assert_eq!(second.previous_limit, 15);
        assert_eq!(second.activated_at, 1_000);
    }

    #[test]
    fn state_survives_a_restart() {
        let store = Arc::new(MemoryStore::new());
        {
            let manager = LoopStateManager::new(store.clone());
            manager.activate_on_scale_out(15, 1_000);
            manager.set_target_limit(30);
        }
        let restored = LoopStateManager::new(store);
        assert!(restored.is_active());
        assert_eq!(restored.previous_limit(), 15);
        assert_eq!(restored.target_limit(), 30);
    }

    #[test]
    fn deactivate_clears_memory_and_store() {
        let store = Arc::new(MemoryStore::new());
        let manager = LoopStateManager::new(store.clone());
        manager.activate_on_scale_out(15, 1_000);
        manager.deactivate();
        assert!(!manager.is_active());
        assert_eq!(manager.snapshot(), super::INACTIVE);
        assert!(store.load_loop_state().unwrap().is_none());
    }
}
