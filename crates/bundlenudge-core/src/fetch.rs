use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::record::{BundleRecord, BundleStatus, Manifest};
use crate::state::StateStore;
use crate::storage::{BundleStore, StorageError};
use crate::transport::{BundleTransport, TransportError};
use crate::verify::{IntegrityVerifier, VerifyError};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[source] TransportError),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("bundle requires app version {required}, running {current}")]
    IncompatibleVersion { required: String, current: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("download cancelled")]
    Cancelled,
}

impl From<VerifyError> for FetchError {
    fn from(error: VerifyError) -> Self {
        match error {
            VerifyError::ChecksumMismatch { expected, actual } => {
                Self::ChecksumMismatch { expected, actual }
            }
            VerifyError::IncompatibleVersion { required, current } => {
                Self::IncompatibleVersion { required, current }
            }
            VerifyError::Read { context, source } => {
                Self::Storage(StorageError::Io { context, source })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    Available(Manifest),
    NoUpdateAvailable,
}

/// Checks the manifest endpoint and stages verified candidates on disk.
pub struct UpdateFetcher {
    store: Arc<BundleStore>,
    state: Arc<dyn StateStore>,
    transport: Arc<dyn BundleTransport>,
    verifier: IntegrityVerifier,
}

impl UpdateFetcher {
    #[must_use]
    pub fn new(
        store: Arc<BundleStore>,
        state: Arc<dyn StateStore>,
        transport: Arc<dyn BundleTransport>,
        verifier: IntegrityVerifier,
    ) -> Self {
        Self {
            store,
            state,
            transport,
            verifier,
        }
    }

    /// Ask the remote endpoint for its latest manifest and decide whether it
    /// names a bundle this device still needs.
    ///
    /// # Errors
    /// Returns [`FetchError::Network`] if the manifest cannot be fetched and
    /// [`FetchError::Storage`] if local records cannot be read.
    pub async fn check_for_update(&self) -> Result<UpdateCheck, FetchError> {
        let Some(manifest) = self
            .transport
            .fetch_manifest()
            .await
            .map_err(FetchError::Network)?
        else {
            return Ok(UpdateCheck::NoUpdateAvailable);
        };

        if self.state.load()?.is_blocked(&manifest.id) {
            debug!("Manifest names rolled-back bundle {}, ignoring", manifest.id);
            return Ok(UpdateCheck::NoUpdateAvailable);
        }

        match self.store.get(&manifest.id) {
            Ok(record) if record.status != BundleStatus::Corrupt => {
                debug!("Bundle {} already known ({})", record.id, record.status);
                Ok(UpdateCheck::NoUpdateAvailable)
            }
            Ok(_) | Err(StorageError::NotFound { .. }) => {
                info!("Update available: {}", manifest.id);
                Ok(UpdateCheck::Available(manifest))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Download the manifest's payload, verify it, and leave it on disk as a
    /// `Verified` record.
    ///
    /// On any failure, including cancellation through `cancel`, nothing from
    /// this attempt remains in storage.
    ///
    /// # Errors
    /// Returns the reason the candidate was rejected; see [`FetchError`].
    pub async fn download_and_stage(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<BundleRecord, FetchError> {
        self.verifier.check_compatibility(manifest)?;

        if let Ok(existing) = self.store.get(&manifest.id)
            && existing.status == BundleStatus::Corrupt
        {
            info!("Replacing corrupt copy of bundle {}", manifest.id);
            self.store.delete(&manifest.id)?;
        }

        let mut staged = self.store.stage(&manifest.id)?;

        info!("Downloading bundle {} from {}", manifest.id, manifest.download_url);
        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
            opened = self.transport.open_payload(&manifest.download_url) => {
                opened.map_err(FetchError::Network)?
            }
        };

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Download of bundle {} cancelled", manifest.id);
                    return Err(FetchError::Cancelled);
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => staged.write_chunk(&chunk)?,
                    Some(Err(error)) => return Err(FetchError::Network(error)),
                    None => break,
                }
            }
        }
        debug!(
            "Download of bundle {} complete: {} bytes",
            manifest.id,
            staged.bytes_written()
        );

        let record = staged.commit()?;
        match self.promote_to_verified(&record, manifest) {
            Ok(record) => {
                self.prune().await;
                Ok(record)
            }
            Err(error) => {
                warn!("Rejecting bundle {}: {error}", record.id);
                if let Err(cleanup) = self.store.delete(&record.id) {
                    warn!("Failed to remove rejected bundle {}: {cleanup}", record.id);
                }
                Err(error)
            }
        }
    }

    /// Check, then download if something new is available.
    ///
    /// # Errors
    /// See [`UpdateFetcher::check_for_update`] and
    /// [`UpdateFetcher::download_and_stage`].
    pub async fn check_and_stage(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<BundleRecord>, FetchError> {
        match self.check_for_update().await? {
            UpdateCheck::Available(manifest) => {
                self.download_and_stage(&manifest, cancel).await.map(Some)
            }
            UpdateCheck::NoUpdateAvailable => Ok(None),
        }
    }

    fn promote_to_verified(
        &self,
        record: &BundleRecord,
        manifest: &Manifest,
    ) -> Result<BundleRecord, FetchError> {
        self.verifier
            .verify_file(&record.file_path, &manifest.checksum)?;
        let verified = self.store.transition(&record.id, BundleStatus::Verified)?;
        info!("Bundle {} verified", verified.id);
        Ok(verified)
    }

    // Pruning blocks on the activation lock, so it runs off the async workers.
    async fn prune(&self) {
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        match tokio::task::spawn_blocking(move || store.prune(state.as_ref())).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => warn!("Bundle pruning after download failed: {error}"),
            Err(error) => warn!("Bundle pruning task failed: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use sha2::{Digest, Sha256};
    use tokio_util::sync::CancellationToken;

    use super::{FetchError, UpdateCheck, UpdateFetcher};
    use crate::record::{ActivationState, BundleStatus, Manifest};
    use crate::state::{MemoryStateStore, StateStore};
    use crate::storage::{BundleStore, StorageError};
    use crate::transport::{BundleTransport, PayloadStream, TransportError};
    use crate::verify::IntegrityVerifier;

    struct StubTransport {
        manifest: Option<Manifest>,
        chunks: Vec<Vec<u8>>,
        stall_after_chunks: bool,
        fail_mid_stream: bool,
    }

    impl StubTransport {
        fn serving(manifest: Option<Manifest>, payload: &[u8]) -> Self {
            Self {
                manifest,
                chunks: payload.chunks(4).map(<[u8]>::to_vec).collect(),
                stall_after_chunks: false,
                fail_mid_stream: false,
            }
        }
    }

    #[async_trait]
    impl BundleTransport for StubTransport {
        async fn fetch_manifest(&self) -> Result<Option<Manifest>, TransportError> {
            Ok(self.manifest.clone())
        }

        async fn open_payload(&self, _url: &str) -> Result<PayloadStream, TransportError> {
            let chunks = futures_util::stream::iter(
                self.chunks.clone().into_iter().map(Ok::<_, TransportError>),
            );
            if self.fail_mid_stream {
                let failure = futures_util::stream::once(async {
                    Err(TransportError::Stream("connection reset".to_string()))
                });
                return Ok(chunks.chain(failure).boxed());
            }
            if self.stall_after_chunks {
                return Ok(chunks.chain(futures_util::stream::pending()).boxed());
            }
            Ok(chunks.boxed())
        }
    }

    fn sha256_hex(payload: &[u8]) -> String {
        format!("{:x}", Sha256::digest(payload))
    }

    fn manifest(id: &str, payload: &[u8]) -> Manifest {
        Manifest {
            id: id.to_string(),
            download_url: format!("https://cdn.example/{id}.jsbundle"),
            checksum: sha256_hex(payload),
            min_app_version: None,
        }
    }

    fn fetcher(
        transport: StubTransport,
    ) -> (tempfile::TempDir, Arc<BundleStore>, Arc<MemoryStateStore>, UpdateFetcher) {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let store = Arc::new(BundleStore::open(temp.path().join("bundles")).expect("store opens"));
        let state = Arc::new(MemoryStateStore::default());
        let fetcher = UpdateFetcher::new(
            Arc::clone(&store),
            state.clone(),
            Arc::new(transport),
            IntegrityVerifier::new("2.0.0"),
        );
        (temp, store, state, fetcher)
    }

    fn staging_entries(store: &BundleStore) -> usize {
        std::fs::read_dir(store.root().join(".staging"))
            .expect("staging dir should exist")
            .count()
    }

    #[tokio::test]
    async fn check_reports_new_manifest() {
        let payload = b"console.log('v2')";
        let remote = manifest("v2", payload);
        let (_temp, _store, _state, fetcher) =
            fetcher(StubTransport::serving(Some(remote.clone()), payload));

        let check = fetcher.check_for_update().await.expect("check should succeed");
        assert_eq!(check, UpdateCheck::Available(remote));
    }

    #[tokio::test]
    async fn check_skips_known_and_blocked_bundles() {
        let payload = b"console.log('v2')";
        let (_temp, store, state, fetcher) =
            fetcher(StubTransport::serving(Some(manifest("v2", payload)), payload));

        store.put("v2", &payload[..]).expect("put should succeed");
        store
            .transition("v2", BundleStatus::Verified)
            .expect("record should verify");
        assert_eq!(
            fetcher.check_for_update().await.expect("check should succeed"),
            UpdateCheck::NoUpdateAvailable
        );

        store.delete("v2").expect("delete should succeed");
        let mut blocked = ActivationState::default();
        blocked.block("v2", 4);
        state.store(&blocked).expect("state should store");
        assert_eq!(
            fetcher.check_for_update().await.expect("check should succeed"),
            UpdateCheck::NoUpdateAvailable
        );
    }

    #[tokio::test]
    async fn check_offers_redownload_of_corrupt_bundle() {
        let payload = b"console.log('v2')";
        let (_temp, store, _state, fetcher) =
            fetcher(StubTransport::serving(Some(manifest("v2", payload)), payload));
        store.put("v2", &payload[..]).expect("put should succeed");
        store
            .transition("v2", BundleStatus::Corrupt)
            .expect("record should be marked corrupt");

        assert!(matches!(
            fetcher.check_for_update().await.expect("check should succeed"),
            UpdateCheck::Available(_)
        ));

        let record = fetcher
            .download_and_stage(&manifest("v2", payload), &CancellationToken::new())
            .await
            .expect("corrupt copy should be replaced");
        assert_eq!(record.status, BundleStatus::Verified);
    }

    #[tokio::test]
    async fn check_without_manifest_reports_no_update() {
        let (_temp, _store, _state, fetcher) = fetcher(StubTransport::serving(None, b""));
        assert_eq!(
            fetcher.check_for_update().await.expect("check should succeed"),
            UpdateCheck::NoUpdateAvailable
        );
    }

    #[tokio::test]
    async fn download_and_stage_verifies_payload() {
        let payload = b"console.log('hello from v2')";
        let remote = manifest("v2", payload);
        let (_temp, store, _state, fetcher) =
            fetcher(StubTransport::serving(Some(remote.clone()), payload));

        let record = fetcher
            .download_and_stage(&remote, &CancellationToken::new())
            .await
            .expect("download should succeed");

        assert_eq!(record.status, BundleStatus::Verified);
        assert_eq!(record.checksum, remote.checksum);
        assert_eq!(
            std::fs::read(&record.file_path).expect("payload should be readable"),
            payload
        );
        assert_eq!(store.get("v2").expect("record should load").status, BundleStatus::Verified);
    }

    #[tokio::test]
    async fn pruning_after_download_waits_for_activation() {
        let payload = b"console.log('v2')";
        let remote = manifest("v2", payload);
        let (_temp, store, state, fetcher) =
            fetcher(StubTransport::serving(Some(remote.clone()), payload));
        let fetcher = Arc::new(fetcher);
        store.put("v1", &b"console.log('v1')"[..]).expect("put should succeed");
        store
            .transition("v1", BundleStatus::Verified)
            .expect("record should verify");

        let held = store.lock().expect("lock should be acquired");
        let download = tokio::spawn({
            let fetcher = Arc::clone(&fetcher);
            async move {
                fetcher
                    .download_and_stage(&remote, &CancellationToken::new())
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!download.is_finished());
        // The activation holding the lock settles on v1.
        store
            .transition("v1", BundleStatus::Active)
            .expect("v1 should activate");
        state
            .store(&ActivationState {
                active_bundle_id: Some("v1".to_string()),
                ..ActivationState::default()
            })
            .expect("state should store");
        drop(held);

        let staged = download
            .await
            .expect("download task should finish")
            .expect("download should succeed");
        assert_eq!(staged.status, BundleStatus::Verified);
        assert_eq!(
            store.get("v1").expect("v1 should be kept").status,
            BundleStatus::Active
        );
    }

    #[tokio::test]
    async fn tampered_payload_fails_and_leaves_nothing() {
        let original = b"console.log('v3')";
        let remote = manifest("v3", original);
        let (_temp, store, _state, fetcher) = fetcher(StubTransport::serving(
            Some(remote.clone()),
            b"console.log('pwned')",
        ));

        let result = fetcher
            .download_and_stage(&remote, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FetchError::ChecksumMismatch { .. })));
        assert!(store.list_all().expect("list should succeed").is_empty());
        assert_eq!(staging_entries(&store), 0);
    }

    #[tokio::test]
    async fn truncated_payload_is_a_checksum_mismatch() {
        let original = b"console.log('complete bundle')";
        let remote = manifest("v3", original);
        let (_temp, store, _state, fetcher) = fetcher(StubTransport::serving(
            Some(remote.clone()),
            &original[..10],
        ));

        let result = fetcher
            .download_and_stage(&remote, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FetchError::ChecksumMismatch { .. })));
        assert!(matches!(store.get("v3"), Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn incompatible_bundle_is_rejected_before_download() {
        let payload = b"console.log('v4')";
        let mut remote = manifest("v4", payload);
        remote.min_app_version = Some("3.1".to_string());
        let (_temp, store, _state, fetcher) =
            fetcher(StubTransport::serving(Some(remote.clone()), payload));

        let result = fetcher
            .download_and_stage(&remote, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FetchError::IncompatibleVersion { .. })));
        assert!(store.list_all().expect("list should succeed").is_empty());
    }

    #[tokio::test]
    async fn stream_failure_surfaces_network_error_without_residue() {
        let payload = b"console.log('v5 payload')";
        let remote = manifest("v5", payload);
        let mut transport = StubTransport::serving(Some(remote.clone()), payload);
        transport.fail_mid_stream = true;
        let (_temp, store, _state, fetcher) = fetcher(transport);

        let result = fetcher
            .download_and_stage(&remote, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FetchError::Network(_))));
        assert!(store.list_all().expect("list should succeed").is_empty());
        assert_eq!(staging_entries(&store), 0);
    }

    #[tokio::test]
    async fn cancelled_download_leaves_nothing() {
        let payload = b"console.log('a long bundle')";
        let remote = manifest("v6", payload);
        let mut transport = StubTransport::serving(Some(remote.clone()), payload);
        transport.stall_after_chunks = true;
        let (_temp, store, _state, fetcher) = fetcher(transport);
        let cancel = CancellationToken::new();

        let (result, ()) = tokio::join!(fetcher.download_and_stage(&remote, &cancel), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert!(store.list_all().expect("list should succeed").is_empty());
        assert_eq!(staging_entries(&store), 0);
    }

    #[tokio::test]
    async fn check_and_stage_downloads_available_update() {
        let payload = b"console.log('v7')";
        let (_temp, _store, _state, fetcher) =
            fetcher(StubTransport::serving(Some(manifest("v7", payload)), payload));

        let staged = fetcher
            .check_and_stage(&CancellationToken::new())
            .await
            .expect("check and stage should succeed")
            .expect("an update should be staged");
        assert_eq!(staged.id, "v7");

        let again = fetcher
            .check_and_stage(&CancellationToken::new())
            .await
            .expect("second check should succeed");
        assert!(again.is_none());
    }
}
