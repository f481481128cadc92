//! Alias installer: materializes the tracked-executables set as symlinks.
//!
//! The invoke directory must end up containing exactly one symlink per
//! tracked basename, each pointing at the shim binary, plus the shim binary
//! itself. Everything else is stale state from a previous directive and is
//! deleted first.

use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("failed to prepare invoke directory {path}: {source}")]
    PrepareDir {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove stale entry {path}: {source}")]
    RemoveStale {
        path: String,
        #[source]
        source: io::Error,
    },
    /// Symlink creation failed; on filesystems without symlink support the
    /// tracked set cannot be installed at all.
    #[error("failed to link {basename} to the shim binary: {source}")]
    Link {
        basename: String,
        #[source]
        source: io::Error,
    },
}

/// Make `invoke_dir` contain exactly `{basename -> shim_binary}` links.
///
/// Best-effort per entry: a mid-way failure leaves the entries created so
/// far in place and surfaces the error.
pub fn sync_aliases(
    invoke_dir: &Path,
    shim_binary: &Path,
    basenames: &[String],
) -> Result<(), TrackerError> {
    fs::create_dir_all(invoke_dir).map_err(|source| TrackerError::PrepareDir {
        path: invoke_dir.display().to_string(),
        source,
    })?;

    // Clear stale entries so the directory reflects only the current set.
    let entries = fs::read_dir(invoke_dir).map_err(|source| TrackerError::PrepareDir {
        path: invoke_dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| TrackerError::PrepareDir {
            path: invoke_dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if path == shim_binary {
            continue;
        }
        remove_entry(&path).map_err(|source| TrackerError::RemoveStale {
            path: path.display().to_string(),
            source,
        })?;
    }

    for basename in basenames {
        let link = invoke_dir.join(basename);
        symlink(shim_binary, &link).map_err(|source| TrackerError::Link {
            basename: basename.clone(),
            source,
        })?;
        debug!(basename, shim = %shim_binary.display(), "linked tracked executable");
    }
    Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
    // Symlinks report as files; directories should never be here but are
    // cleaned up anyway.
    if path.is_dir() && !path.is_symlink() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let shim = dir.path().join("coder-intel-invoke");
        fs::write(&shim, b"#!/bin/sh\n").unwrap();
        (dir, shim)
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn installs_exactly_the_tracked_set() {
        let (dir, shim) = setup();
        sync_aliases(dir.path(), &shim, &["go".into(), "node".into()]).unwrap();
        assert_eq!(
            entries(dir.path()),
            vec!["coder-intel-invoke", "go", "node"]
        );
        let target = fs::read_link(dir.path().join("go")).unwrap();
        assert_eq!(target, shim);
    }

    #[test]
    fn reinstall_is_idempotent() {
        let (dir, shim) = setup();
        let set = vec!["go".to_string()];
        sync_aliases(dir.path(), &shim, &set).unwrap();
        sync_aliases(dir.path(), &shim, &set).unwrap();
        assert_eq!(entries(dir.path()), vec!["coder-intel-invoke", "go"]);
    }

    #[test]
    fn stale_entries_are_removed() {
        let (dir, shim) = setup();
        sync_aliases(dir.path(), &shim, &["go".into(), "cargo".into()]).unwrap();
        // The tracked set shrinks; cargo must disappear.
        sync_aliases(dir.path(), &shim, &["go".into()]).unwrap();
        assert_eq!(entries(dir.path()), vec!["coder-intel-invoke", "go"]);
    }

    #[test]
    fn empty_set_clears_all_links() {
        let (dir, shim) = setup();
        sync_aliases(dir.path(), &shim, &["go".into()]).unwrap();
        sync_aliases(dir.path(), &shim, &[]).unwrap();
        assert_eq!(entries(dir.path()), vec!["coder-intel-invoke"]);
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let invoke = dir.path().join("nested").join("bin");
        let shim = invoke.join("coder-intel-invoke");
        sync_aliases(&invoke, &shim, &["go".into()]).unwrap();
        assert_eq!(entries(&invoke), vec!["go"]);
    }
}
