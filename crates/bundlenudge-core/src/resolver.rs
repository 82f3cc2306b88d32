use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};

use crate::activation::{ActivationError, ActivationManager};
use crate::record::{BundleRecord, BundleStatus};
use crate::state::StateStore;
use crate::storage::{BundleStore, StorageError};

/// Answers "which bundle should this launch run" on the startup path.
///
/// Reads the activation state and one record, and checks that the payload
/// file exists. Never touches the network and never fails: any problem
/// resolves to `None`, meaning the embedded bundle.
pub struct BundleResolver {
    store: Arc<BundleStore>,
    state: Arc<dyn StateStore>,
    activation: Arc<ActivationManager>,
}

impl BundleResolver {
    #[must_use]
    pub fn new(
        store: Arc<BundleStore>,
        state: Arc<dyn StateStore>,
        activation: Arc<ActivationManager>,
    ) -> Self {
        Self {
            store,
            state,
            activation,
        }
    }

    /// Path of the active bundle's payload, or `None` for the embedded bundle.
    ///
    /// An active bundle whose payload is missing triggers a rollback and
    /// this launch gets `None`.
    #[must_use]
    pub fn resolve(&self) -> Option<PathBuf> {
        match self.active_payload() {
            Ok(Some(record)) => {
                debug!("Resolved bundle {} at {}", record.id, record.file_path.display());
                Some(record.file_path)
            }
            Ok(None) => None,
            Err(ActivationError::CorruptActiveState { id }) => {
                warn!("Active bundle {id} is unusable, falling back to the embedded bundle");
                if let Err(error) = self.activation.rollback_corrupt_active(&id) {
                    warn!("Rollback of corrupt bundle {id} failed: {error}");
                }
                None
            }
            Err(error) => {
                warn!("Could not resolve active bundle: {error}");
                None
            }
        }
    }

    fn active_payload(&self) -> Result<Option<BundleRecord>, ActivationError> {
        let Some(id) = self.state.load()?.active_bundle_id else {
            return Ok(None);
        };

        let record = match self.store.get(&id) {
            Ok(record) => record,
            Err(StorageError::NotFound { .. }) => {
                return Err(ActivationError::CorruptActiveState { id });
            }
            Err(error) => return Err(error.into()),
        };

        if record.status != BundleStatus::Active {
            debug!("Bundle {id} is {}, not active", record.status);
            return Ok(None);
        }
        if !self.store.payload_exists(&record) {
            return Err(ActivationError::CorruptActiveState { id });
        }
        Ok(Some(record))
    }
}
