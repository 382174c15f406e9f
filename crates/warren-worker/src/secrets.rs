//! In-memory secret mounts.
//!
//! Each container gets its own directory under the worker's secrets root
//! (a tmpfs in production deployments, so plaintext never reaches stable
//! storage). Files are written once at container start, bind-mounted
//! read-only into the container, and shredded on teardown.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::WorkerError;

/// Returns the mount directory for a container, creating it empty.
pub fn prepare_mount(
    secrets_root: &Path,
    container_id: &str,
    files: impl IntoIterator<Item = (String, Vec<u8>)>,
) -> Result<PathBuf, WorkerError> {
    let dir = secrets_root.join(container_id);
    // Leftovers from a crashed predecessor are stale; start clean.
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).map_err(|e| WorkerError::Secrets {
        path: dir.display().to_string(),
        source: e,
    })?;

    for (name, plaintext) in files {
        // Secret targets are file names, never paths.
        if name.contains('/') || name.contains("..") {
            return Err(WorkerError::BadSecretTarget(name));
        }
        let path = dir.join(&name);
        std::fs::write(&path, &plaintext).map_err(|e| WorkerError::Secrets {
            path: path.display().to_string(),
            source: e,
        })?;
        restrict_permissions(&path)?;
    }

    debug!(dir = %dir.display(), "secret mount prepared");
    Ok(dir)
}

/// Overwrites and removes a container's secret files.
pub fn wipe_mount(secrets_root: &Path, container_id: &str) {
    let dir = secrets_root.join(container_id);
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            // Zero the contents first; tmpfs or not, don't leave plaintext
            // in freed pages.
            if let Ok(meta) = entry.metadata() {
                let _ = std::fs::write(&path, vec![0u8; meta.len() as usize]);
            }
            let _ = std::fs::remove_file(&path);
        }
    }
    let _ = std::fs::remove_dir(&dir);
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), WorkerError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400)).map_err(|e| {
        WorkerError::Secrets {
            path: path.display().to_string(),
            source: e,
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), WorkerError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_write_wipe() {
        let root = tempfile::tempdir().unwrap();
        let dir = prepare_mount(
            root.path(),
            "c1",
            vec![("db_password".to_string(), b"hunter2".to_vec())],
        )
        .unwrap();

        let file = dir.join("db_password");
        assert_eq!(std::fs::read(&file).unwrap(), b"hunter2");

        wipe_mount(root.path(), "c1");
        assert!(!file.exists());
        assert!(!dir.exists());
    }

    #[test]
    fn rejects_path_traversal_targets() {
        let root = tempfile::tempdir().unwrap();
        let err = prepare_mount(
            root.path(),
            "c1",
            vec![("../evil".to_string(), b"x".to_vec())],
        )
        .unwrap_err();
        assert!(matches!(err, WorkerError::BadSecretTarget(_)));
    }

    #[test]
    fn restart_replaces_stale_mount() {
        let root = tempfile::tempdir().unwrap();
        prepare_mount(root.path(), "c1", vec![("old".to_string(), b"1".to_vec())]).unwrap();
        let dir = prepare_mount(root.path(), "c1", vec![("new".to_string(), b"2".to_vec())])
            .unwrap();
        assert!(!dir.join("old").exists());
        assert!(dir.join("new").exists());
    }
}
