//! Host-facing entry point for BundleNudge over-the-air updates.
//!
//! [`BundleNudge`] wires the core together for a host application:
//! - `bundle_url` runs the cold-start sequence once and names the bundle to
//!   load for the life of the process.
//! - `notify_app_ready` / `report_launch_failure` feed launch health back.
//! - `check_and_stage` / `spawn_update_check` fetch new bundles off the
//!   startup path.

mod logging;
mod settings;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use bundlenudge_core::{
    ActivationError, ActivationManager, BundleRecord, BundleResolver, BundleStore,
    BundleTransport, FetchError, IntegrityVerifier, ReqwestTransport, StateStore, StorageError,
    TransportError, UpdateFetcher,
};
use bundlenudge_platform::{NudgePaths, NudgePathsError};
use log::{debug, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use logging::init_logging;
pub use settings::NudgeSettings;

#[derive(Debug, Error)]
pub enum NudgeError {
    #[error("failed to resolve BundleNudge paths: {0}")]
    Paths(#[from] NudgePathsError),
    #[error("failed to create BundleNudge directories: {0}")]
    Dirs(#[source] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct BundleNudge {
    paths: NudgePaths,
    settings: NudgeSettings,
    state: Arc<dyn StateStore>,
    activation: Arc<ActivationManager>,
    resolver: BundleResolver,
    fetcher: Option<UpdateFetcher>,
    launch: OnceLock<Option<PathBuf>>,
}

impl BundleNudge {
    /// Open the subsystem in the platform's default location, loading
    /// settings from disk and installing the logger.
    ///
    /// # Errors
    /// Returns an error if the platform directories cannot be resolved or
    /// created, the bundle directory cannot be opened, or the HTTP client
    /// cannot be built.
    pub fn open() -> Result<Self, NudgeError> {
        let paths = NudgePaths::new()?;
        paths.ensure_dirs().map_err(NudgeError::Dirs)?;
        let settings = NudgeSettings::load(&paths);
        // Updates keep working without a log file.
        let _ = init_logging(&paths, &settings);

        let transport: Option<Arc<dyn BundleTransport>> = match &settings.manifest_url {
            Some(url) => Some(Arc::new(ReqwestTransport::with_timeouts(
                url.clone(),
                settings.http_timeout(),
                settings.connect_timeout(),
                settings.retry_delays(),
            )?)),
            None => None,
        };

        Self::with_parts(paths, settings, transport)
    }

    /// Assemble the subsystem from explicit parts. `transport` of `None`
    /// disables update checks; resolution still works.
    ///
    /// # Errors
    /// Returns an error if the bundle directory cannot be opened.
    pub fn with_parts(
        paths: NudgePaths,
        settings: NudgeSettings,
        transport: Option<Arc<dyn BundleTransport>>,
    ) -> Result<Self, NudgeError> {
        let store = Arc::new(BundleStore::open(paths.bundle_root.clone())?);
        let state: Arc<dyn StateStore> = store.clone();

        let activation = Arc::new(
            ActivationManager::new(Arc::clone(&store), Arc::clone(&state))
                .with_failure_threshold(settings.failure_threshold)
                .with_max_blocked_ids(settings.max_blocked_ids),
        );
        let resolver =
            BundleResolver::new(Arc::clone(&store), Arc::clone(&state), Arc::clone(&activation));
        let fetcher = transport.map(|transport| {
            UpdateFetcher::new(
                Arc::clone(&store),
                Arc::clone(&state),
                transport,
                IntegrityVerifier::new(settings.app_version.clone()),
            )
        });

        Ok(Self {
            paths,
            settings,
            state,
            activation,
            resolver,
            fetcher,
            launch: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &NudgeSettings {
        &self.settings
    }

    /// Directory holding downloaded bundles.
    #[must_use]
    pub fn bundle_nudge_path(&self) -> &Path {
        &self.paths.bundle_root
    }

    /// The bundle to load for this cold start, or `None` for the bundle
    /// embedded in the application package.
    ///
    /// The first call charges an unreported previous launch as a failure,
    /// promotes a newly verified bundle when auto-activation is on,
    /// resolves, and records the returned bundle as launching. Later calls
    /// on the same instance return that first answer. Never fails; problems
    /// are logged.
    #[must_use]
    pub fn bundle_url(&self) -> Option<PathBuf> {
        self.launch.get_or_init(|| self.cold_start()).clone()
    }

    fn cold_start(&self) -> Option<PathBuf> {
        match self.activation.recover_unreported_launch() {
            Ok(Some(id)) => info!("Counted unreported launch of bundle {id} as a failure"),
            Ok(None) => {}
            Err(error) => warn!("Crash detection skipped: {error}"),
        }

        if self.settings.auto_activate {
            match self.activation.activate_newest_verified() {
                Ok(record) => info!("Launching newly activated bundle {}", record.id),
                Err(ActivationError::NoVerifiedCandidate) => {}
                Err(error) => warn!("Activation skipped: {error}"),
            }
        }

        let path = self.resolver.resolve();
        match &path {
            Some(path) => {
                if let Some(id) = self.active_bundle_id()
                    && let Err(error) = self.activation.mark_launch_started(&id)
                {
                    warn!("Could not record launch of bundle {id}: {error}");
                }
                info!("Loading bundle from {}", path.display());
            }
            None => debug!("Loading embedded bundle"),
        }
        path
    }

    fn active_bundle_id(&self) -> Option<String> {
        self.state.load().ok()?.active_bundle_id
    }

    fn launching_bundle_id(&self) -> Option<String> {
        let state = self.state.load().ok()?;
        state.pending_launch_id.or(state.active_bundle_id)
    }

    /// The host finished starting on the bundle it was given.
    ///
    /// # Errors
    /// Returns an error if the outcome cannot be persisted.
    pub fn notify_app_ready(&self) -> Result<(), ActivationError> {
        let Some(id) = self.launching_bundle_id() else {
            return Ok(());
        };
        self.activation.report_launch_outcome(&id, true)
    }

    /// The host detected that the bundle it was given crashed or hung.
    ///
    /// # Errors
    /// Returns an error if the outcome cannot be persisted.
    pub fn report_launch_failure(&self) -> Result<(), ActivationError> {
        let Some(id) = self.launching_bundle_id() else {
            return Ok(());
        };
        self.activation.report_launch_outcome(&id, false)
    }

    /// # Errors
    /// Returns an error if the state or active record cannot be read.
    pub fn active_bundle(&self) -> Result<Option<BundleRecord>, ActivationError> {
        self.activation.current_active()
    }

    /// Check for an update and download it if one is available. Returns the
    /// newly verified record. The bundle is picked up at the next cold start.
    ///
    /// # Errors
    /// Returns the reason the check or download failed; the bundle directory
    /// is left as it was.
    pub async fn check_and_stage(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<BundleRecord>, FetchError> {
        let Some(fetcher) = &self.fetcher else {
            debug!("No manifest endpoint configured, skipping update check");
            return Ok(None);
        };
        fetcher.check_and_stage(cancel).await
    }

    /// Run [`BundleNudge::check_and_stage`] on the tokio runtime, logging
    /// the outcome. Cancel through `cancel` when the app is backgrounded.
    pub fn spawn_update_check(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let nudge = Arc::clone(self);
        tokio::spawn(async move {
            match nudge.check_and_stage(&cancel).await {
                Ok(Some(record)) => info!("Bundle {} staged for next launch", record.id),
                Ok(None) => debug!("No bundle update available"),
                Err(FetchError::Cancelled) => info!("Update check cancelled"),
                Err(error) => warn!("Update check failed: {error}"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use bundlenudge_platform::NudgePaths;

    use super::{BundleNudge, NudgeSettings};

    #[test]
    fn fresh_install_uses_embedded_bundle() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let nudge = BundleNudge::with_parts(
            NudgePaths::under(temp.path()),
            NudgeSettings::default(),
            None,
        )
        .expect("subsystem should open");

        assert!(nudge.bundle_url().is_none());
        assert!(nudge.bundle_nudge_path().is_dir());
        nudge
            .notify_app_ready()
            .expect("ready without a bundle is a no-op");
    }

    #[tokio::test]
    async fn check_without_transport_is_a_no_op() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let nudge = BundleNudge::with_parts(
            NudgePaths::under(temp.path()),
            NudgeSettings::default(),
            None,
        )
        .expect("subsystem should open");

        let staged = nudge
            .check_and_stage(&tokio_util::sync::CancellationToken::new())
            .await
            .expect("check should succeed");
        assert!(staged.is_none());
    }
}
