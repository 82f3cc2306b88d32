use std::sync::Mutex;

use crate::record::ActivationState;
use crate::storage::{BundleStore, StorageError};

/// Handle to the persisted [`ActivationState`].
///
/// Passed explicitly into the activation manager and resolver so tests and
/// hosts can swap the backing store.
pub trait StateStore: Send + Sync {
    /// # Errors
    /// Returns an error if the state exists but cannot be read.
    fn load(&self) -> Result<ActivationState, StorageError>;

    /// Replace the state. Implementations must be atomic: after a failure the
    /// previous state is still what `load` returns.
    ///
    /// # Errors
    /// Returns an error if the state cannot be written.
    fn store(&self, state: &ActivationState) -> Result<(), StorageError>;
}

impl StateStore for BundleStore {
    fn load(&self) -> Result<ActivationState, StorageError> {
        self.read_activation_state()
    }

    fn store(&self, state: &ActivationState) -> Result<(), StorageError> {
        self.write_activation_state(state)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<ActivationState>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn snapshot(&self) -> ActivationState {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<ActivationState, StorageError> {
        Ok(self.snapshot())
    }

    fn store(&self, state: &ActivationState) -> Result<(), StorageError> {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryStateStore, StateStore};
    use crate::record::ActivationState;

    #[test]
    fn memory_store_returns_last_stored_state() {
        let store = MemoryStateStore::default();
        assert_eq!(
            store.load().expect("state should load"),
            ActivationState::default()
        );

        let state = ActivationState {
            active_bundle_id: Some("v2".to_string()),
            ..ActivationState::default()
        };
        store.store(&state).expect("state should store");

        assert_eq!(store.load().expect("state should load"), state);
    }
}
