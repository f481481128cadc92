//! Agent-side invocation queue: metadata enrichment over the batching core.
//!
//! Each report from a shim is enriched with an executable descriptor
//! (sampled content hash, cached per path) and the working directory's git
//! remote (cached per directory) before it is queued for upload.

use crate::cache::{TtlCache, DEFAULT_CAPACITY};
use intel_common::proto::{Executable, Invocation, ReportInvocationRequest};
use intel_common::queue::BatchQueue;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};

const BINARY_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const GIT_REMOTE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// `git` exits 128 when the directory is not inside a repository; that
/// answer is worth caching.
const GIT_EXIT_NOT_A_REPO: i32 = 128;

pub struct InvocationQueue {
    batch: BatchQueue<Invocation>,
    binary_cache: Mutex<TtlCache<String, Executable>>,
    git_remote_cache: Mutex<TtlCache<String, String>>,
}

impl InvocationQueue {
    pub fn new(flush_interval: Duration, limit: usize) -> Self {
        Self {
            batch: BatchQueue::new(flush_interval, limit),
            binary_cache: Mutex::new(TtlCache::new(DEFAULT_CAPACITY, BINARY_CACHE_TTL)),
            git_remote_cache: Mutex::new(TtlCache::new(DEFAULT_CAPACITY, GIT_REMOTE_CACHE_TTL)),
        }
    }

    /// The underlying batch queue; the upload loop drains it.
    pub fn batch(&self) -> &BatchQueue<Invocation> {
        &self.batch
    }

    /// Enrich and queue one shim report.
    pub async fn enqueue(&self, req: ReportInvocationRequest) {
        let mut invocation = Invocation {
            executable: None,
            arguments: req.arguments,
            working_directory: req.working_directory.clone(),
            git_remote_url: String::new(),
            exit_code: req.exit_code,
            duration_ms: req.duration_ms,
        };

        // Empty paths only happen in tests; shims always set both.
        if !req.executable_path.is_empty() {
            match self.resolve_executable(&req.executable_path).await {
                Ok(executable) => invocation.executable = Some(executable),
                Err(err) => {
                    error!(
                        path = %req.executable_path,
                        error = %err,
                        "failed to inspect executable, dropping invocation",
                    );
                    return;
                }
            }
        }

        if !req.working_directory.is_empty() {
            match self.resolve_git_remote(&req.working_directory).await {
                Ok(url) => invocation.git_remote_url = url,
                // Not worth dropping the record over; the URL stays empty.
                Err(err) => error!(
                    working_directory = %req.working_directory,
                    error = %err,
                    "failed to inspect git remote",
                ),
            }
        }

        self.batch.enqueue([invocation]);
    }

    async fn resolve_executable(&self, path: &str) -> std::io::Result<Executable> {
        if let Some(hit) = self.binary_cache.lock().unwrap().get(&path.to_string()) {
            return Ok(hit);
        }
        let owned = path.to_string();
        let hash = tokio::task::spawn_blocking(move || intel_common::hash::sample_file(&owned))
            .await
            .map_err(|err| std::io::Error::other(err.to_string()))??;
        let executable = Executable {
            hash,
            basename: Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_string(),
            version: String::new(),
        };
        self.binary_cache
            .lock()
            .unwrap()
            .insert(path.to_string(), executable.clone());
        Ok(executable)
    }

    async fn resolve_git_remote(&self, working_directory: &str) -> std::io::Result<String> {
        if let Some(hit) = self
            .git_remote_cache
            .lock()
            .unwrap()
            .get(&working_directory.to_string())
        {
            return Ok(hit);
        }
        let output = tokio::process::Command::new("git")
            .args(["remote", "get-url", "origin"])
            .current_dir(working_directory)
            .output()
            .await?;
        let url = if output.status.success() {
            let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
            info!(url = %url, working_directory, "cached git remote");
            url
        } else if output.status.code() == Some(GIT_EXIT_NOT_A_REPO) {
            String::new()
        } else {
            return Err(std::io::Error::other(format!(
                "git remote get-url exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        };
        self.git_remote_cache
            .lock()
            .unwrap()
            .insert(working_directory.to_string(), url.clone());
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(path: &str, wd: &str) -> ReportInvocationRequest {
        ReportInvocationRequest {
            executable_path: path.to_string(),
            arguments: vec!["build".into()],
            working_directory: wd.to_string(),
            duration_ms: 10,
            exit_code: 0,
        }
    }

    #[tokio::test]
    async fn enqueue_without_paths_skips_enrichment() {
        let queue = InvocationQueue::new(Duration::from_secs(1), 100);
        queue.enqueue(request("", "")).await;
        assert_eq!(queue.batch().len(), 1);
    }

    #[tokio::test]
    async fn missing_executable_drops_record() {
        let queue = InvocationQueue::new(Duration::from_secs(1), 100);
        queue
            .enqueue(request("/definitely/not/a/real/binary", ""))
            .await;
        assert!(queue.batch().is_empty());
    }

    #[tokio::test]
    async fn executable_descriptor_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("go");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        let queue = InvocationQueue::new(Duration::from_secs(1), 100);

        queue
            .enqueue(request(bin.to_str().unwrap(), ""))
            .await;
        // Second enqueue hits the cache even after the file disappears.
        std::fs::remove_file(&bin).unwrap();
        queue
            .enqueue(request(bin.to_str().unwrap(), ""))
            .await;
        assert_eq!(queue.batch().len(), 2);
    }

    #[tokio::test]
    async fn non_repo_directory_caches_empty_remote() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let queue = InvocationQueue::new(Duration::from_secs(1), 100);
        queue
            .enqueue(request("", dir.path().to_str().unwrap()))
            .await;
        assert_eq!(queue.batch().len(), 1);
        assert!(queue
            .git_remote_cache
            .lock()
            .unwrap()
            .get(&dir.path().to_string_lossy().into_owned())
            .is_some());
    }
}
