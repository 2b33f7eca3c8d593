//! Downloader pool: concurrent HTTP fetches with per-host concurrency caps,
//! retry with exponential backoff, and content-hash verification before the
//! artifact is considered present.

use std::{collections::HashMap, sync::Arc, time::Duration};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{instrument, trace, warn};

use crate::{
    fs,
    model::ContentHash,
    path::{AbsFilePath, TryJoinWith},
};

/// Default number of concurrent in-flight requests permitted to a single
/// origin, per §4.5.
pub const DEFAULT_PER_HOST_CONCURRENCY: usize = 4;

const MAX_ATTEMPTS: u32 = 3;
const MAX_REDIRECTS: usize = 10;

/// A shared pool of per-host semaphores plus an HTTP client, used by the
/// artifact pipeline (C6) to fetch `.gem` bodies.
#[derive(Clone)]
pub struct Downloader {
    http: Client,
    per_host: Arc<DashMap<String, Arc<Semaphore>>>,
    per_host_limit: usize,
}

impl Downloader {
    pub fn new(per_host_limit: usize) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            per_host: Arc::new(DashMap::new()),
            per_host_limit,
        })
    }

    fn semaphore_for(&self, host: &str) -> Arc<Semaphore> {
        self.per_host
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// Download `url` into `dst`, verifying `expected` (if given) before the
    /// atomic rename that makes the file visible at `dst`. Retries
    /// network-class errors up to [`MAX_ATTEMPTS`] with `0.5s · 2^(attempt-1)`
    /// backoff between attempts.
    #[instrument(skip(self))]
    pub async fn fetch(
        &self,
        url: &url::Url,
        dst: &AbsFilePath,
        expected: Option<&ContentHash>,
    ) -> Result<u64> {
        let host = url.host_str().unwrap_or("unknown").to_string();
        let semaphore = self.semaphore_for(&host);

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            match self.fetch_once(url, dst, expected).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt < MAX_ATTEMPTS && is_retryable(&err) => {
                    let backoff = Duration::from_secs_f64(0.5 * 2f64.powi(attempt as i32 - 1));
                    warn!(%url, attempt, ?backoff, error = ?err, "retrying download");
                    tokio::time::sleep(backoff).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| color_eyre::eyre::eyre!("download failed with no error captured")))
    }

    async fn fetch_once(
        &self,
        url: &url::Url,
        dst: &AbsFilePath,
        expected: Option<&ContentHash>,
    ) -> Result<u64> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if !response.status().is_success() {
            bail!("unexpected status {} fetching {url}", response.status());
        }

        let tmp = fs::scoped_tempdir("download").await?;
        let tmp_file = tmp.path().try_join_file("body")?;

        let mut stream = response.bytes_stream();
        let mut file = fs::create_file(&tmp_file).await.context("create temp file")?;
        let mut hasher = blake3::Hasher::new();
        let mut total = 0u64;

        use tokio::io::AsyncWriteExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("read response chunk")?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.context("write chunk")?;
            total += chunk.len() as u64;
        }
        file.flush().await.context("flush temp file")?;
        drop(file);

        let actual = ContentHash::from_blake3(hasher.finalize());
        if let Some(expected) = expected {
            if &actual != expected {
                bail!("content hash mismatch for {url}: expected {expected}, got {actual}");
            }
        }

        fs::atomic_move(&tmp_file, dst)
            .await
            .context("move downloaded file into place")?;
        trace!(%url, bytes = total, hash = %actual, "downloaded artifact");
        Ok(total)
    }
}

fn is_retryable(err: &color_eyre::Report) -> bool {
    if let Some(reqwest_err) = err.chain().find_map(|c| c.downcast_ref::<reqwest::Error>()) {
        return reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request();
    }
    if let Some(io_err) = err.chain().find_map(|c| c.downcast_ref::<std::io::Error>()) {
        return matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );
    }
    false
}

/// Host → number of in-flight requests, for observability/tests.
pub fn snapshot_inflight(downloader: &Downloader) -> HashMap<String, usize> {
    downloader
        .per_host
        .iter()
        .map(|entry| (entry.key().clone(), downloader.per_host_limit - entry.value().available_permits()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_host_limit_defaults_to_four() {
        assert_eq!(DEFAULT_PER_HOST_CONCURRENCY, 4);
    }
}
