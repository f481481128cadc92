//! Persistent PATH editing for the invoke directory.
//!
//! On POSIX the user's shell rc files get a sentinel-delimited block that
//! prepends the invoke directory; the block is rewritten in place on change
//! and deleted on removal. Writes go through a temp file rename and an
//! exclusive lock so concurrent daemons cannot shear each other's edits.

use fs2::FileExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const BLOCK_BEGIN: &str = "# >>> coder-intel path >>>";
const BLOCK_END: &str = "# <<< coder-intel path <<<";

#[derive(Debug, Error)]
pub enum PathmanError {
    #[error("could not determine a home directory")]
    NoHomeDir,
    #[error("rc file has a begin sentinel without an end sentinel: {0}")]
    UnterminatedBlock(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Ensure the invoke directory is prepended to the persistent PATH.
#[cfg(not(windows))]
pub fn prepend(invoke_dir: &Path) -> Result<(), PathmanError> {
    let block = path_block(invoke_dir);
    for rc in rc_files()? {
        ensure_block(&rc, &block)?;
        info!(rc = %rc.display(), "ensured invoke directory on PATH");
    }
    Ok(())
}

/// Remove the invoke directory from the persistent PATH.
#[cfg(not(windows))]
pub fn remove(_invoke_dir: &Path) -> Result<(), PathmanError> {
    for rc in rc_files()? {
        if rc.exists() {
            remove_block(&rc)?;
        }
    }
    Ok(())
}

/// Prepend to the user's persistent PATH environment value.
#[cfg(windows)]
pub fn prepend(invoke_dir: &Path) -> Result<(), PathmanError> {
    let current = std::env::var("PATH").unwrap_or_default();
    let dir = invoke_dir.display().to_string();
    if current.split(';').any(|entry| entry == dir) {
        return Ok(());
    }
    let status = std::process::Command::new("setx")
        .args(["PATH", &format!("{dir};{current}")])
        .status()?;
    if !status.success() {
        return Err(std::io::Error::other("setx PATH failed").into());
    }
    info!(%dir, "prepended invoke directory to user PATH");
    Ok(())
}

#[cfg(windows)]
pub fn remove(invoke_dir: &Path) -> Result<(), PathmanError> {
    let current = std::env::var("PATH").unwrap_or_default();
    let dir = invoke_dir.display().to_string();
    let kept: Vec<&str> = current.split(';').filter(|entry| *entry != dir).collect();
    let status = std::process::Command::new("setx")
        .args(["PATH", &kept.join(";")])
        .status()?;
    if !status.success() {
        return Err(std::io::Error::other("setx PATH failed").into());
    }
    Ok(())
}

fn path_block(invoke_dir: &Path) -> String {
    format!("export PATH=\"{}:$PATH\"", invoke_dir.display())
}

/// The rc files to edit: every well-known one that exists, or `.profile`
/// alone when none do.
fn rc_files() -> Result<Vec<PathBuf>, PathmanError> {
    let home = dirs::home_dir().ok_or(PathmanError::NoHomeDir)?;
    let candidates = [".profile", ".bashrc", ".zshrc"];
    let existing: Vec<PathBuf> = candidates
        .iter()
        .map(|name| home.join(name))
        .filter(|path| path.exists())
        .collect();
    if existing.is_empty() {
        return Ok(vec![home.join(".profile")]);
    }
    Ok(existing)
}

/// Insert or rewrite the sentinel block in `rc` so it contains exactly
/// `content`. Idempotent.
pub fn ensure_block(rc: &Path, content: &str) -> Result<(), PathmanError> {
    let _lock = lock_file(rc)?;
    let current = read_or_empty(rc)?;
    let stripped = strip_block(&current, rc)?;
    let mut next = stripped;
    if !next.is_empty() && !next.ends_with('\n') {
        next.push('\n');
    }
    next.push_str(BLOCK_BEGIN);
    next.push('\n');
    next.push_str(content);
    next.push('\n');
    next.push_str(BLOCK_END);
    next.push('\n');
    if next != current {
        write_atomic(rc, &next)?;
    }
    Ok(())
}

/// Delete the sentinel block from `rc` if present. Idempotent.
pub fn remove_block(rc: &Path) -> Result<(), PathmanError> {
    let _lock = lock_file(rc)?;
    let current = read_or_empty(rc)?;
    let stripped = strip_block(&current, rc)?;
    if stripped != current {
        write_atomic(rc, &stripped)?;
    }
    Ok(())
}

fn read_or_empty(rc: &Path) -> Result<String, PathmanError> {
    match fs::read_to_string(rc) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

/// Return `content` with the sentinel block (and its trailing newline)
/// removed.
fn strip_block(content: &str, rc: &Path) -> Result<String, PathmanError> {
    let Some(begin) = content.find(BLOCK_BEGIN) else {
        return Ok(content.to_string());
    };
    let after_begin = &content[begin..];
    let Some(end_rel) = after_begin.find(BLOCK_END) else {
        return Err(PathmanError::UnterminatedBlock(rc.to_path_buf()));
    };
    let mut end = begin + end_rel + BLOCK_END.len();
    if content[end..].starts_with('\n') {
        end += 1;
    }
    Ok(format!("{}{}", &content[..begin], &content[end..]))
}

fn write_atomic(rc: &Path, content: &str) -> Result<(), PathmanError> {
    let parent = rc.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    // Keep the original mode; rc files are often 0600.
    if let Ok(meta) = fs::metadata(rc) {
        fs::set_permissions(tmp.path(), meta.permissions())?;
    }
    tmp.persist(rc).map_err(|err| err.error)?;
    Ok(())
}

/// Exclusive advisory lock serializing edits to `rc`. Released on drop.
fn lock_file(rc: &Path) -> Result<fs::File, PathmanError> {
    let lock_path = rc.with_extension("coder-intel.lock");
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    file.lock_exclusive()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_appends_block_to_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(".profile");
        ensure_block(&rc, "export PATH=\"/x:$PATH\"").unwrap();
        let content = fs::read_to_string(&rc).unwrap();
        assert!(content.starts_with(BLOCK_BEGIN));
        assert!(content.contains("/x:$PATH"));
        assert!(content.trim_end().ends_with(BLOCK_END));
    }

    #[test]
    fn ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(".profile");
        fs::write(&rc, "alias ll='ls -l'\n").unwrap();
        ensure_block(&rc, "export PATH=\"/x:$PATH\"").unwrap();
        let once = fs::read_to_string(&rc).unwrap();
        ensure_block(&rc, "export PATH=\"/x:$PATH\"").unwrap();
        let twice = fs::read_to_string(&rc).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.matches(BLOCK_BEGIN).count(), 1);
    }

    #[test]
    fn ensure_rewrites_block_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(".profile");
        fs::write(&rc, "before\n").unwrap();
        ensure_block(&rc, "export PATH=\"/old:$PATH\"").unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&rc)
            .unwrap()
            .write_all(b"after\n")
            .unwrap();
        ensure_block(&rc, "export PATH=\"/new:$PATH\"").unwrap();
        let content = fs::read_to_string(&rc).unwrap();
        assert!(content.contains("before\n"));
        assert!(content.contains("after\n"));
        assert!(content.contains("/new:$PATH"));
        assert!(!content.contains("/old:$PATH"));
        assert_eq!(content.matches(BLOCK_BEGIN).count(), 1);
    }

    #[test]
    fn remove_deletes_only_the_block() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(".profile");
        fs::write(&rc, "keep me\n").unwrap();
        ensure_block(&rc, "export PATH=\"/x:$PATH\"").unwrap();
        remove_block(&rc).unwrap();
        let content = fs::read_to_string(&rc).unwrap();
        assert_eq!(content, "keep me\n");
        // Removing again is a no-op.
        remove_block(&rc).unwrap();
        assert_eq!(fs::read_to_string(&rc).unwrap(), "keep me\n");
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(".profile");
        fs::write(&rc, format!("{BLOCK_BEGIN}\nexport PATH=x\n")).unwrap();
        assert!(matches!(
            ensure_block(&rc, "anything"),
            Err(PathmanError::UnterminatedBlock(_))
        ));
    }
}
