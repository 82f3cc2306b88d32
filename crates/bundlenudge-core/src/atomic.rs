use std::io::{self, Write};
use std::path::Path;

/// Replace `path` with `data`. Readers see the old contents or the new
/// contents, never a torn file.
///
/// The temp file is created beside `path` so the final rename never
/// crosses filesystems; it is removed if any step fails.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target path has no parent"))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".nudge-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|error| error.error)?;

    sync_dir(dir);
    Ok(())
}

/// Best-effort fsync of a directory so a completed rename survives power loss.
pub(crate) fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = std::fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

#[cfg(test)]
mod tests {
    use super::write_atomic;

    fn temp_leftovers(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .expect("read temp dir entries")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count()
    }

    #[test]
    fn replaces_existing_activation_state() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("activation.json");
        std::fs::write(&path, "{\"activeBundleId\":\"v1\"").expect("old state should be written");

        write_atomic(&path, b"{\"activeBundleId\":\"v2\"}").expect("atomic write should succeed");

        let contents = std::fs::read_to_string(&path).expect("file should be readable");
        assert_eq!(contents, "{\"activeBundleId\":\"v2\"}");
        assert_eq!(temp_leftovers(temp_dir.path()), 0);
    }

    #[test]
    fn failed_rename_keeps_target_and_removes_temp_file() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("record.json");
        std::fs::create_dir(&path).expect("blocking directory should be created");
        std::fs::write(path.join("keep"), "x").expect("blocking directory should be non-empty");

        assert!(write_atomic(&path, b"{}").is_err());

        assert!(path.join("keep").is_file());
        assert_eq!(temp_leftovers(temp_dir.path()), 0);
    }

    #[test]
    fn rejects_path_without_parent() {
        assert!(write_atomic(std::path::Path::new(""), b"data").is_err());
    }
}
