//! Housekeeping on an installation directory.

use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};

use crate::error::{AppError, Result};
use crate::paths::InstanceLayout;

/// Remove the `cache/` directory. Returns whether there was anything to remove.
pub fn delete_cache(layout: &InstanceLayout) -> Result<bool> {
    if !layout.cache.exists() {
        return Ok(false);
    }
    fs::remove_dir_all(&layout.cache)
        .map_err(|e| AppError::io(format!("Failed to delete cache: {}", e)))?;
    Ok(true)
}

/// Append `server.log` to `server.log.old` and remove it.
pub fn archive_server_log(layout: &InstanceLayout) -> Result<()> {
    let content = match fs::read(&layout.log) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AppError::io(format!("Failed to read server log: {}", e))),
    };

    if !content.is_empty() {
        let mut archive = OpenOptions::new()
            .create(true)
            .append(true)
            .open(layout.archived_log())
            .map_err(|e| AppError::io(format!("Failed to open log archive: {}", e)))?;
        archive
            .write_all(&content)
            .map_err(|e| AppError::io(format!("Failed to archive server log: {}", e)))?;
    }

    fs::remove_file(&layout.log)
        .map_err(|e| AppError::io(format!("Failed to remove server log: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dir: &tempfile::TempDir) -> InstanceLayout {
        InstanceLayout::from_exe(&dir.path().join("server")).unwrap()
    }

    #[test]
    fn archive_appends_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        fs::write(&layout.log, "run one\n").unwrap();
        archive_server_log(&layout).unwrap();
        fs::write(&layout.log, "run two\n").unwrap();
        archive_server_log(&layout).unwrap();

        assert!(!layout.log.exists());
        assert_eq!(
            fs::read_to_string(layout.archived_log()).unwrap(),
            "run one\nrun two\n"
        );
        // nothing to archive is not an error
        archive_server_log(&layout).unwrap();
    }

    #[test]
    fn cache_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        assert!(!delete_cache(&layout).unwrap());

        fs::create_dir_all(layout.cache.join("client")).unwrap();
        fs::write(layout.cache.join("client/blob.bin"), [0u8; 16]).unwrap();
        assert!(delete_cache(&layout).unwrap());
        assert!(!layout.cache.exists());
    }
}
