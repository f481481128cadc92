//! Shim executable installed under the names of tracked binaries.
//!
//! Invoked as `argv[0] == <tracked basename>` through a symlink in the
//! invoke directory. It re-resolves the real binary with the invoke
//! directory stripped from `PATH`, runs it with inherited stdio, and
//! reports the outcome to the local agent. The child's exit code is
//! always propagated, whether or not reporting worked.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use intel_common::loopback;
use intel_common::proto::ReportInvocationRequest;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

/// Exit code reported when the child died without one (signal death).
const EXIT_CODE_UNKNOWN: i32 = 99;

fn debug_enabled() -> bool {
    env::var_os("CODER_INTEL_INVOKE_DEBUG").is_some()
}

macro_rules! debug {
    ($($arg:tt)*) => {
        if debug_enabled() {
            eprintln!($($arg)*);
        }
    };
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("coder-intel-invoke: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let mut args = env::args();
    let invoked_as = args.next().context("missing argv[0]")?;
    let arguments: Vec<String> = args.collect();

    let basename = Path::new(&invoked_as)
        .file_name()
        .context("argv[0] has no basename")?
        .to_os_string();
    debug!("invoked as {invoked_as:?}, basename {basename:?}");

    let path = env::var_os("PATH").unwrap_or_default();
    let cwd = env::current_dir().context("read working directory")?;

    // Where the symlink we were launched through lives.
    let own_link = which::which_in(&invoked_as, Some(&path), &cwd)
        .with_context(|| format!("locate {invoked_as:?} in PATH"))?;
    let own_dir = own_link
        .parent()
        .context("own path has no parent directory")?
        .to_path_buf();
    debug!("own dir {own_dir:?}");

    // The child must not resolve back into the invoke directory.
    let stripped = strip_dir_from_path(&path, &own_dir);
    debug!("stripped PATH {stripped:?}");

    let real_binary = which::which_in(&basename, Some(&stripped), &cwd)
        .with_context(|| format!("{basename:?} not found outside the invoke directory"))?;
    let real_binary = absolutize(&real_binary, &cwd);
    debug!("real binary {real_binary:?}");

    let own_exe = env::current_exe().context("resolve own executable")?;
    if real_binary == own_exe {
        bail!(
            "supposed to be linked; resolved {} back to this shim",
            real_binary.display()
        );
    }

    let start = Instant::now();
    let status = Command::new(&real_binary)
        .args(&arguments)
        .env("PATH", &stripped)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("execute {}", real_binary.display()))?;
    let duration_ms = start.elapsed().as_millis() as i64;
    let exit_code = status.code().unwrap_or(EXIT_CODE_UNKNOWN);

    let report = ReportInvocationRequest {
        executable_path: real_binary.to_string_lossy().into_owned(),
        arguments,
        working_directory: cwd.to_string_lossy().into_owned(),
        duration_ms,
        exit_code,
    };
    // Reporting is strictly best-effort; no agent running is normal.
    if let Err(err) = loopback::report_invocation(&report) {
        debug!("report failed: {err}");
    }

    Ok(exit_code)
}

/// Remove every occurrence of `dir` from a `PATH`-style value.
fn strip_dir_from_path(path: &std::ffi::OsStr, dir: &Path) -> OsString {
    let kept: Vec<PathBuf> = env::split_paths(path).filter(|p| p != dir).collect();
    env::join_paths(kept).unwrap_or_default()
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_every_occurrence() {
        let dir = Path::new("/tmp/invoke");
        let path = env::join_paths([
            PathBuf::from("/tmp/invoke"),
            PathBuf::from("/usr/bin"),
            PathBuf::from("/tmp/invoke"),
            PathBuf::from("/bin"),
            PathBuf::from("/tmp/invoke"),
        ])
        .unwrap();
        let stripped = strip_dir_from_path(&path, dir);
        let rest: Vec<PathBuf> = env::split_paths(&stripped).collect();
        assert_eq!(rest, vec![PathBuf::from("/usr/bin"), PathBuf::from("/bin")]);
    }

    #[test]
    fn strip_keeps_unrelated_entries() {
        let path = env::join_paths([PathBuf::from("/usr/bin"), PathBuf::from("/bin")]).unwrap();
        let stripped = strip_dir_from_path(&path, Path::new("/tmp/invoke"));
        let rest: Vec<PathBuf> = env::split_paths(&stripped).collect();
        assert_eq!(rest, vec![PathBuf::from("/usr/bin"), PathBuf::from("/bin")]);
    }

    #[test]
    fn absolutize_joins_relative() {
        let cwd = Path::new("/home/coder");
        assert_eq!(
            absolutize(Path::new("bin/go"), cwd),
            PathBuf::from("/home/coder/bin/go")
        );
        assert_eq!(
            absolutize(Path::new("/usr/bin/go"), cwd),
            PathBuf::from("/usr/bin/go")
        );
    }
}
