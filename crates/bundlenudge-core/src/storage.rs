use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use log::{debug, info, warn};
use tempfile::TempDir;
use thiserror::Error;

use crate::atomic::{sync_dir, write_atomic};
use crate::record::{ActivationState, BundleRecord, BundleStatus};
use crate::state::StateStore;
use crate::verify::StreamingDigest;

const PAYLOAD_FILE: &str = "main.jsbundle";
const RECORD_FILE: &str = "record.json";
const STATE_FILE: &str = "activation.json";
const STAGING_DIR: &str = ".staging";
const LOCK_FILE: &str = ".activation.lock";
const MAX_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Serde {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("bundle not found: {id}")]
    NotFound { id: String },
    #[error("invalid bundle id: {id:?}")]
    InvalidId { id: String },
    #[error("bundle already stored: {id}")]
    AlreadyExists { id: String },
    #[error("bundle {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: BundleStatus,
        to: BundleStatus,
    },
}

impl StorageError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::io(
            context,
            std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        )
    }

    fn serde(context: &'static str, source: serde_json::Error) -> Self {
        Self::Serde { context, source }
    }
}

/// Bundle ids double as directory names.
///
/// # Errors
/// Returns [`StorageError::InvalidId`] for empty, overlong, dot-prefixed, or
/// non-portable ids.
pub fn validate_id(id: &str) -> Result<(), StorageError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '+'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidId { id: id.to_string() })
    }
}

/// The on-device bundle directory.
///
/// Layout under `root`:
/// - `<id>/main.jsbundle` and `<id>/record.json` per bundle
/// - `activation.json` for [`ActivationState`]
/// - `.staging/` for writes that are not yet visible
/// - `.activation.lock` serializing activation across processes
#[derive(Debug)]
pub struct BundleStore {
    root: PathBuf,
    staging: PathBuf,
}

/// Held while an activation transition reads and rewrites state.
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl BundleStore {
    /// Open (creating if needed) the bundle directory at `root` and discard
    /// anything a previous process left half-done.
    ///
    /// # Errors
    /// Returns an error if the directories cannot be created or the recovery
    /// sweep fails to read them.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        std::fs::create_dir_all(&staging).map_err(|error| {
            StorageError::io_with_path("failed to create staging directory", &staging, &error)
        })?;

        let store = Self { root, staging };
        store.recover()?;
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.bundle_dir(id).join(RECORD_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    fn recover(&self) -> Result<(), StorageError> {
        if let Ok(entries) = std::fs::read_dir(&self.staging) {
            for entry in entries.flatten() {
                let path = entry.path();
                debug!("Removing stale staging entry: {}", path.display());
                let _ = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
            }
        }

        for record in self.list_all()? {
            if record.status == BundleStatus::Pending {
                warn!("Discarding unverified bundle {} left by a previous run", record.id);
                self.delete(&record.id)?;
            }
        }
        Ok(())
    }

    /// Start writing a payload for `id`. Nothing is visible to readers until
    /// [`StagedPayload::commit`]; dropping the stage deletes it.
    ///
    /// # Errors
    /// Returns an error for invalid or already-stored ids, or when the staging
    /// area cannot be written.
    pub fn stage(&self, id: &str) -> Result<StagedPayload, StorageError> {
        validate_id(id)?;
        if self.bundle_dir(id).exists() {
            return Err(StorageError::AlreadyExists { id: id.to_string() });
        }

        let dir = tempfile::Builder::new()
            .prefix(&format!("{id}."))
            .tempdir_in(&self.staging)
            .map_err(|error| StorageError::io("failed to create staging directory", error))?;
        let payload_path = dir.path().join(PAYLOAD_FILE);
        let file = File::create(&payload_path).map_err(|error| {
            StorageError::io_with_path("failed to create payload file", &payload_path, &error)
        })?;

        Ok(StagedPayload {
            id: id.to_string(),
            root: self.root.clone(),
            dir,
            file,
            digest: StreamingDigest::default(),
        })
    }

    /// Store the full contents of `payload` as a `Pending` record.
    ///
    /// # Errors
    /// Returns an error if staging, reading the payload, or the final rename
    /// fails. No record is left behind on error.
    pub fn put<R: Read>(&self, id: &str, mut payload: R) -> Result<BundleRecord, StorageError> {
        let mut staged = self.stage(id)?;
        let mut buffer = [0_u8; 8192];
        loop {
            let read = payload
                .read(&mut buffer)
                .map_err(|error| StorageError::io("failed to read payload", error))?;
            if read == 0 {
                break;
            }
            staged.write_chunk(&buffer[..read])?;
        }
        staged.commit()
    }

    /// # Errors
    /// Returns [`StorageError::NotFound`] if no record exists for `id`.
    pub fn get(&self, id: &str) -> Result<BundleRecord, StorageError> {
        validate_id(id)?;
        let path = self.record_path(id);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound { id: id.to_string() });
            }
            Err(error) => {
                return Err(StorageError::io_with_path(
                    "failed to read bundle record",
                    &path,
                    &error,
                ));
            }
        };
        let mut record: BundleRecord = serde_json::from_slice(&data)
            .map_err(|error| StorageError::serde("failed to parse bundle record", error))?;
        record.file_path = self.bundle_dir(id).join(PAYLOAD_FILE);
        Ok(record)
    }

    /// Every committed record, oldest download first.
    ///
    /// # Errors
    /// Returns an error if the root directory cannot be listed.
    pub fn list_all(&self) -> Result<Vec<BundleRecord>, StorageError> {
        let entries = std::fs::read_dir(&self.root).map_err(|error| {
            StorageError::io_with_path("failed to list bundle directory", &self.root, &error)
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str() else {
                continue;
            };
            if id.starts_with('.') || !entry.path().is_dir() || validate_id(id).is_err() {
                continue;
            }
            match self.get(id) {
                Ok(record) => records.push(record),
                Err(error) => warn!("Skipping unreadable bundle entry {id}: {error}"),
            }
        }

        records.sort_by(|a, b| a.recency_key().cmp(&b.recency_key()));
        Ok(records)
    }

    /// Remove a bundle. The directory is moved out of the root first so a
    /// concurrent `list_all` sees either the whole record or nothing.
    ///
    /// # Errors
    /// Returns an error if the bundle directory cannot be moved aside.
    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        validate_id(id)?;
        let dir = self.bundle_dir(id);
        if !dir.exists() {
            return Ok(());
        }

        let nonce = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let graveyard = self.staging.join(format!("{id}.deleted.{nonce}"));
        std::fs::rename(&dir, &graveyard).map_err(|error| {
            StorageError::io_with_path("failed to move bundle aside for deletion", &dir, &error)
        })?;
        if let Err(error) = std::fs::remove_dir_all(&graveyard) {
            warn!("Failed to remove deleted bundle {id}: {error}");
        }
        debug!("Deleted bundle {id}");
        Ok(())
    }

    /// Rewrite the launch failure counter of a stored record. Identity,
    /// digest, status, and timestamps are never touched here.
    ///
    /// # Errors
    /// Returns an error if the record does not exist or cannot be written.
    pub fn set_failure_count(
        &self,
        id: &str,
        failure_count: u32,
    ) -> Result<BundleRecord, StorageError> {
        let mut record = self.get(id)?;
        if record.failure_count != failure_count {
            record.failure_count = failure_count;
            self.write_record(&record)?;
        }
        Ok(record)
    }

    /// Move a record to `next`, enforcing the forward-only lifecycle.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidTransition`] for disallowed moves.
    pub fn transition(
        &self,
        id: &str,
        next: BundleStatus,
    ) -> Result<BundleRecord, StorageError> {
        let mut record = self.get(id)?;
        self.transition_record(&mut record, next)?;
        Ok(record)
    }

    /// Like [`BundleStore::transition`] for a record the caller already
    /// holds. Also persists its failure counter.
    pub(crate) fn transition_record(
        &self,
        record: &mut BundleRecord,
        next: BundleStatus,
    ) -> Result<(), StorageError> {
        if !record.status.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                id: record.id.clone(),
                from: record.status,
                to: next,
            });
        }
        if next == BundleStatus::Active && record.activated_at.is_none() {
            record.activated_at = Some(Utc::now());
        }
        debug!("Bundle {} {} -> {}", record.id, record.status, next);
        record.status = next;
        self.write_record(record)
    }

    #[cfg(test)]
    pub(crate) fn overwrite_record(&self, record: &BundleRecord) -> Result<(), StorageError> {
        self.write_record(record)
    }

    fn write_record(&self, record: &BundleRecord) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(record)
            .map_err(|error| StorageError::serde("failed to serialize bundle record", error))?;
        let path = self.record_path(&record.id);
        write_atomic(&path, &data).map_err(|error| {
            StorageError::io_with_path("failed to write bundle record", &path, &error)
        })
    }

    /// Lightweight existence check for a record's payload.
    #[must_use]
    pub fn payload_exists(&self, record: &BundleRecord) -> bool {
        std::fs::metadata(&record.file_path).is_ok_and(|meta| meta.is_file() && meta.len() > 0)
    }

    /// Missing state file reads as the default (embedded bundle).
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub fn read_activation_state(&self) -> Result<ActivationState, StorageError> {
        let path = self.state_path();
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data).unwrap_or_else(|error| {
                warn!("Ignoring unreadable activation state: {error}");
                ActivationState::default()
            })),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(ActivationState::default())
            }
            Err(error) => Err(StorageError::io_with_path(
                "failed to read activation state",
                &path,
                &error,
            )),
        }
    }

    /// # Errors
    /// Returns an error if the state cannot be serialized or written; the
    /// previous state file is left intact in that case.
    pub fn write_activation_state(&self, state: &ActivationState) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|error| StorageError::serde("failed to serialize activation state", error))?;
        let path = self.state_path();
        write_atomic(&path, &data).map_err(|error| {
            StorageError::io_with_path("failed to write activation state", &path, &error)
        })
    }

    /// Block until this process holds the cross-process activation lock.
    ///
    /// # Errors
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn lock(&self) -> Result<StoreLock, StorageError> {
        let path = self.root.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|error| {
                StorageError::io_with_path("failed to open activation lock", &path, &error)
            })?;
        file.lock_exclusive()
            .map_err(|error| StorageError::io("failed to acquire activation lock", error))?;
        Ok(StoreLock { file })
    }

    /// Delete everything except the active bundle, the last-known-good bundle,
    /// and the newest not-yet-active candidate. Returns the deleted ids.
    ///
    /// Waits for the activation lock and reads `state` under it, so a
    /// candidate an activation has already chosen is never removed.
    ///
    /// # Errors
    /// Returns an error if the lock or state cannot be obtained, the
    /// directory cannot be listed, or a bundle cannot be removed.
    pub fn prune(&self, state: &dyn StateStore) -> Result<Vec<String>, StorageError> {
        let _lock = self.lock()?;
        let state = state.load()?;
        self.prune_locked(&state)
    }

    /// [`BundleStore::prune`] for callers already holding [`StoreLock`].
    pub(crate) fn prune_locked(
        &self,
        state: &ActivationState,
    ) -> Result<Vec<String>, StorageError> {
        let records = self.list_all()?;

        let mut keep: HashSet<&str> = HashSet::new();
        keep.extend(state.active_bundle_id.as_deref());
        keep.extend(state.last_known_good_id.as_deref());
        keep.extend(
            records
                .iter()
                .filter(|record| record.status == BundleStatus::Active)
                .map(|record| record.id.as_str()),
        );
        if let Some(candidate) = records
            .iter()
            .filter(|record| {
                matches!(record.status, BundleStatus::Pending | BundleStatus::Verified)
            })
            .max_by(|a, b| a.recency_key().cmp(&b.recency_key()))
        {
            keep.insert(candidate.id.as_str());
        }

        let mut removed = Vec::new();
        for record in &records {
            if keep.contains(record.id.as_str()) {
                continue;
            }
            self.delete(&record.id)?;
            removed.push(record.id.clone());
        }

        if !removed.is_empty() {
            info!("Pruned {} stale bundle(s): {}", removed.len(), removed.join(", "));
        }
        Ok(removed)
    }
}

/// A payload being written into the staging area.
pub struct StagedPayload {
    id: String,
    root: PathBuf,
    dir: TempDir,
    file: File,
    digest: StreamingDigest,
}

impl StagedPayload {
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.digest.size()
    }

    /// # Errors
    /// Returns an error if the chunk cannot be written to the staging file.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        self.file
            .write_all(chunk)
            .map_err(|error| StorageError::io("failed to write payload data", error))?;
        self.digest.update(chunk);
        Ok(())
    }

    /// Make the payload visible as a `Pending` record under its final name.
    ///
    /// # Errors
    /// Returns an error if syncing, writing the record, or the final rename
    /// fails; the staged data is removed in that case.
    pub fn commit(self) -> Result<BundleRecord, StorageError> {
        let Self {
            id,
            root,
            dir,
            file,
            digest,
        } = self;

        file.sync_all()
            .map_err(|error| StorageError::io("failed to sync payload file", error))?;
        drop(file);

        let (checksum, size) = digest.finish();
        let final_dir = root.join(&id);
        let mut record = BundleRecord {
            id: id.clone(),
            file_path: final_dir.join(PAYLOAD_FILE),
            checksum,
            size,
            status: BundleStatus::Pending,
            downloaded_at: Utc::now(),
            activated_at: None,
            failure_count: 0,
        };

        let data = serde_json::to_vec_pretty(&record)
            .map_err(|error| StorageError::serde("failed to serialize bundle record", error))?;
        let record_path = dir.path().join(RECORD_FILE);
        File::create(&record_path)
            .and_then(|mut out| out.write_all(&data).and_then(|()| out.sync_all()))
            .map_err(|error| {
                StorageError::io_with_path("failed to write bundle record", &record_path, &error)
            })?;

        if final_dir.exists() {
            return Err(StorageError::AlreadyExists { id });
        }

        let staged_dir = dir.keep();
        if let Err(error) = std::fs::rename(&staged_dir, &final_dir) {
            let _ = std::fs::remove_dir_all(&staged_dir);
            return Err(StorageError::io_with_path(
                "failed to move staged bundle into place",
                &final_dir,
                &error,
            ));
        }
        sync_dir(&root);

        record.file_path = final_dir.join(PAYLOAD_FILE);
        info!("Stored bundle {id} ({size} bytes)");
        Ok(record)
    }
}
