use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use thiserror::Error;

use crate::record::{ActivationState, BundleRecord, BundleStatus};
use crate::state::StateStore;
use crate::storage::{BundleStore, StorageError};

/// Failed launches tolerated before a bundle is rolled back.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;
pub const DEFAULT_MAX_BLOCKED_IDS: usize = 16;

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("no verified bundle is waiting for activation")]
    NoVerifiedCandidate,
    #[error("unknown bundle: {id}")]
    UnknownBundle { id: String },
    #[error("active bundle {id} is missing its payload")]
    CorruptActiveState { id: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Owns every change to which bundle is active.
///
/// All transitions run under one in-process mutex plus the store's
/// cross-process lock, so state reads and writes never interleave.
pub struct ActivationManager {
    store: Arc<BundleStore>,
    state: Arc<dyn StateStore>,
    failure_threshold: u32,
    max_blocked_ids: usize,
    guard: Mutex<()>,
}

impl ActivationManager {
    #[must_use]
    pub fn new(store: Arc<BundleStore>, state: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            state,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            max_blocked_ids: DEFAULT_MAX_BLOCKED_IDS,
            guard: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_blocked_ids(mut self, limit: usize) -> Self {
        self.max_blocked_ids = limit.max(1);
        self
    }

    fn transaction<T>(
        &self,
        body: impl FnOnce(&mut ActivationState) -> Result<T, ActivationError>,
    ) -> Result<T, ActivationError> {
        let _local = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = self.store.lock()?;

        let mut state = self.state.load()?;
        let before = state.clone();
        let result = body(&mut state)?;
        if state != before {
            self.state.store(&state)?;
        }
        Ok(result)
    }

    /// Promote the most recently downloaded `Verified` bundle.
    ///
    /// Candidates whose payload has vanished are marked `Corrupt` and
    /// skipped. The previously active bundle is retired.
    ///
    /// # Errors
    /// Returns [`ActivationError::NoVerifiedCandidate`] when nothing is
    /// waiting, leaving the current activation untouched.
    pub fn activate_newest_verified(&self) -> Result<BundleRecord, ActivationError> {
        self.transaction(|state| {
            let records = self.store.list_all()?;

            let mut candidates: Vec<&BundleRecord> = records
                .iter()
                .filter(|record| record.status == BundleStatus::Verified)
                .collect();
            candidates.sort_by(|a, b| b.recency_key().cmp(&a.recency_key()));

            let mut chosen = None;
            for candidate in candidates {
                if self.store.payload_exists(candidate) {
                    chosen = Some(candidate.clone());
                    break;
                }
                warn!("Verified bundle {} lost its payload", candidate.id);
                self.store.transition(&candidate.id, BundleStatus::Corrupt)?;
            }
            let Some(mut chosen) = chosen else {
                return Err(ActivationError::NoVerifiedCandidate);
            };

            for previous in records
                .iter()
                .filter(|record| record.status == BundleStatus::Active)
            {
                debug!("Retiring previously active bundle {}", previous.id);
                self.store.transition(&previous.id, BundleStatus::Retired)?;
            }

            chosen.failure_count = 0;
            self.store
                .transition_record(&mut chosen, BundleStatus::Active)?;
            state.active_bundle_id = Some(chosen.id.clone());
            state.pending_launch_id = None;
            info!("Activated bundle {}", chosen.id);

            if let Err(error) = self.store.prune_locked(state) {
                warn!("Bundle pruning after activation failed: {error}");
            }
            Ok(chosen)
        })
    }

    /// Record how a launch of bundle `id` went.
    ///
    /// A success clears the failure count and makes the bundle the
    /// last-known-good. A failure that pushes the count past the threshold
    /// rolls the bundle back.
    ///
    /// # Errors
    /// Returns [`ActivationError::UnknownBundle`] if `id` is not stored.
    pub fn report_launch_outcome(&self, id: &str, success: bool) -> Result<(), ActivationError> {
        self.transaction(|state| {
            let current = match self.store.get(id) {
                Ok(record) => record,
                Err(StorageError::NotFound { .. }) => {
                    return Err(ActivationError::UnknownBundle { id: id.to_string() });
                }
                Err(error) => return Err(error.into()),
            };
            if state.pending_launch_id.as_deref() == Some(id) {
                state.pending_launch_id = None;
            }

            if success {
                let record = self.store.set_failure_count(id, 0)?;
                if record.status == BundleStatus::Active {
                    debug!("Bundle {id} launched successfully");
                    state.last_known_good_id = Some(record.id);
                }
                return Ok(());
            }

            let mut record = self
                .store
                .set_failure_count(id, current.failure_count.saturating_add(1))?;
            warn!(
                "Bundle {id} failed to launch ({} of {} allowed)",
                record.failure_count, self.failure_threshold
            );

            if record.status == BundleStatus::Active
                && record.failure_count > self.failure_threshold
            {
                warn!("Rolling back bundle {id}");
                self.store
                    .transition_record(&mut record, BundleStatus::RolledBack)?;
                state.block(id, self.max_blocked_ids);
                self.fall_back(state, id)?;
            }
            Ok(())
        })
    }

    /// The active bundle whose payload went missing is marked `Corrupt` and
    /// activation falls back to the last-known-good bundle or to none.
    ///
    /// # Errors
    /// Returns an error if the records or state cannot be updated.
    pub fn rollback_corrupt_active(
        &self,
        id: &str,
    ) -> Result<Option<BundleRecord>, ActivationError> {
        self.transaction(|state| {
            if state.active_bundle_id.as_deref() != Some(id) {
                return Ok(None);
            }
            match self.store.get(id) {
                Ok(mut record) if record.status.can_transition_to(BundleStatus::Corrupt) => {
                    self.store
                        .transition_record(&mut record, BundleStatus::Corrupt)?;
                }
                Ok(_) | Err(StorageError::NotFound { .. }) => {}
                Err(error) => return Err(error.into()),
            }
            warn!("Active bundle {id} is corrupt, rolling back");
            self.fall_back(state, id)
        })
    }

    fn fall_back(
        &self,
        state: &mut ActivationState,
        failed_id: &str,
    ) -> Result<Option<BundleRecord>, ActivationError> {
        state.pending_launch_id = None;
        if state.last_known_good_id.as_deref() == Some(failed_id) {
            state.last_known_good_id = None;
        }

        let target = match state.last_known_good_id.clone() {
            Some(good_id) => self.restorable(&good_id)?,
            None => None,
        };

        match target {
            Some(mut record) => {
                if record.status != BundleStatus::Active {
                    self.store
                        .transition_record(&mut record, BundleStatus::Active)?;
                }
                info!("Restored last-known-good bundle {}", record.id);
                state.active_bundle_id = Some(record.id.clone());
                Ok(Some(record))
            }
            None => {
                state.last_known_good_id = None;
                state.active_bundle_id = None;
                info!("No bundle to fall back to, using the embedded bundle");
                Ok(None)
            }
        }
    }

    fn restorable(&self, id: &str) -> Result<Option<BundleRecord>, ActivationError> {
        let record = match self.store.get(id) {
            Ok(record) => record,
            Err(StorageError::NotFound { .. }) => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        if !matches!(record.status, BundleStatus::Retired | BundleStatus::Active) {
            return Ok(None);
        }
        if !self.store.payload_exists(&record) {
            warn!("Last-known-good bundle {id} lost its payload");
            self.store.transition(id, BundleStatus::Corrupt)?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// # Errors
    /// Returns an error if the state or the active record cannot be read.
    pub fn current_active(&self) -> Result<Option<BundleRecord>, ActivationError> {
        let state = self.state.load()?;
        let Some(id) = state.active_bundle_id else {
            return Ok(None);
        };
        match self.store.get(&id) {
            Ok(record) if record.status == BundleStatus::Active => Ok(Some(record)),
            Ok(_) | Err(StorageError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Remember that bundle `id` was handed to the host, so a crash before
    /// any outcome is reported still counts against it.
    ///
    /// # Errors
    /// Returns an error if the state cannot be written.
    pub fn mark_launch_started(&self, id: &str) -> Result<(), ActivationError> {
        self.transaction(|state| {
            state.pending_launch_id = Some(id.to_string());
            Ok(())
        })
    }

    /// Count a launch that never reported its outcome as a failure.
    /// Returns the id it was charged to.
    ///
    /// # Errors
    /// Returns an error if the state or records cannot be updated.
    pub fn recover_unreported_launch(&self) -> Result<Option<String>, ActivationError> {
        let Some(id) = self.state.load()?.pending_launch_id else {
            return Ok(None);
        };

        warn!("Previous launch of bundle {id} never reported an outcome");
        match self.report_launch_outcome(&id, false) {
            Ok(()) => Ok(Some(id)),
            Err(ActivationError::UnknownBundle { .. }) => {
                self.transaction(|state| {
                    state.pending_launch_id = None;
                    Ok(())
                })?;
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}
