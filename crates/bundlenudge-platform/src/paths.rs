use std::path::{Path, PathBuf};
use thiserror::Error;

const DIR_NAME: &str = "BundleNudge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NudgePathsError {
    #[error("Could not determine home directory")]
    HomeDirUnavailable,
    #[error("Could not determine config directory")]
    ConfigDirUnavailable,
    #[error("Could not determine data directory")]
    DataDirUnavailable,
}

/// Directories the update subsystem owns on the device.
///
/// `bundle_root` holds one subdirectory per downloaded bundle plus the
/// activation state file. It lives next to user documents on Apple
/// platforms so it survives cache purges.
#[derive(Debug, Clone)]
pub struct NudgePaths {
    pub bundle_root: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl NudgePaths {
    /// Build update-subsystem paths for the current platform.
    ///
    /// # Errors
    /// Returns an error when a required base directory (for example the user
    /// home/config/data directory) cannot be determined.
    pub fn new() -> Result<Self, NudgePathsError> {
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            let home = dirs::home_dir().ok_or(NudgePathsError::HomeDirUnavailable)?;
            let documents = dirs::document_dir().unwrap_or_else(|| home.join("Documents"));
            Ok(Self {
                bundle_root: documents.join(DIR_NAME),
                config_dir: home.join("Library/Application Support").join(DIR_NAME),
                data_dir: home.join("Library/Application Support").join(DIR_NAME),
            })
        }

        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        {
            let data_dir = dirs::data_dir()
                .ok_or(NudgePathsError::DataDirUnavailable)?
                .join(DIR_NAME);
            Ok(Self {
                bundle_root: data_dir.join("bundles"),
                config_dir: dirs::config_dir()
                    .ok_or(NudgePathsError::ConfigDirUnavailable)?
                    .join(DIR_NAME),
                data_dir,
            })
        }
    }

    /// Paths rooted under a single directory. Used by hosts that manage
    /// their own sandbox and by tests.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            bundle_root: root.join("bundles"),
            config_dir: root.join("config"),
            data_dir: root.join("data"),
        }
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("bundlenudge.log")
    }

    /// Ensure all directories exist on disk.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.bundle_root)?;
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}
