use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use bundlenudge_platform::NudgePaths;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

use crate::settings::NudgeSettings;

/// Activations, rejected downloads, and rollbacks are always recorded so a
/// rollback in the field can be explained afterwards. `debug_logging` adds
/// per-step detail and mirrors the log to stderr.
fn level(settings: &NudgeSettings) -> LevelFilter {
    if settings.debug_logging {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

fn config() -> Config {
    ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Off)
        .add_filter_allow_str("bundlenudge")
        .build()
}

fn previous_generation(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// Move an oversized log aside as `<name>.1`, replacing the older
/// generation. Returns whether the log was rotated.
fn rotate_if_oversized(log_path: &Path, max_size: u64) -> io::Result<bool> {
    let size = match std::fs::metadata(log_path) {
        Ok(metadata) => metadata.len(),
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(error) => return Err(error),
    };
    if size <= max_size {
        return Ok(false);
    }
    std::fs::rename(log_path, previous_generation(log_path))?;
    Ok(true)
}

/// Install the process logger, appending to the subsystem's log file.
///
/// If the host already installed a logger, that one keeps receiving
/// records and this is a no-op.
///
/// # Errors
/// Returns an error if the log file cannot be rotated or opened.
pub fn init_logging(paths: &NudgePaths, settings: &NudgeSettings) -> io::Result<()> {
    let log_path = paths.log_file();
    let rotated = rotate_if_oversized(&log_path, settings.max_log_size_bytes)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let level = level(settings);
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![WriteLogger::new(level, config(), file)];
    if settings.debug_logging {
        loggers.push(TermLogger::new(
            level,
            config(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ));
    }
    if CombinedLogger::init(loggers).is_err() {
        return Ok(());
    }

    log::info!(
        "BundleNudge {} logging to {} (bundles in {})",
        env!("CARGO_PKG_VERSION"),
        log_path.display(),
        paths.bundle_root.display()
    );
    if rotated {
        log::info!(
            "Previous log moved to {}",
            previous_generation(&log_path).display()
        );
    }
    Ok(())
}
