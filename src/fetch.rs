// src/fetch.rs

//! Source and bottle fetching
//!
//! The network transport is an external collaborator: the engine only sees
//! the [`Fetcher`] trait. Two transports ship with the crate:
//!
//! - [`HttpFetcher`]: blocking reqwest client for `http://` and `https://`
//! - [`FileFetcher`]: `file://` URLs and plain filesystem paths
//!
//! [`RetryingFetcher`] wraps any fetcher with bounded retries and linear
//! backoff for transient failures, and [`DefaultFetcher`] dispatches on the
//! URL scheme.

use crate::error::{Error, Result};
use crate::hash::{Checksum, hash_bytes};
use reqwest::blocking::Client;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default timeout for HTTP requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum attempts for transient failures
const MAX_ATTEMPTS: u32 = 3;

/// Base retry delay, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 1000;

/// Transport used to obtain source archives and bottles
pub trait Fetcher: Send + Sync {
    /// Fetch the full content behind `url`
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// Check `bytes` against a declared checksum
    fn verify(&self, bytes: &[u8], checksum: &Checksum) -> bool {
        checksum.matches(bytes)
    }
}

impl<F: Fetcher + ?Sized> Fetcher for std::sync::Arc<F> {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        (**self).fetch(url)
    }

    fn verify(&self, bytes: &[u8], checksum: &Checksum) -> bool {
        (**self).verify(bytes, checksum)
    }
}

/// Fetch `url` and fail with [`Error::ChecksumMismatch`] unless it verifies
pub fn fetch_verified(
    fetcher: &dyn Fetcher,
    url: &str,
    checksum: &Checksum,
    subject: &str,
) -> Result<Vec<u8>> {
    let bytes = fetcher.fetch(url)?;
    if !fetcher.verify(&bytes, checksum) {
        let actual = hash_bytes(checksum.algorithm(), &bytes);
        return Err(Error::ChecksumMismatch {
            subject: subject.to_string(),
            expected: checksum.to_prefixed_string(),
            actual: actual.to_prefixed_string(),
        });
    }
    debug!("Verified {} ({} bytes)", subject, bytes.len());
    Ok(bytes)
}

/// Blocking HTTP(S) transport
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(HTTP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("formulary/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        info!("Downloading {}", url);

        let response = self.client.get(url).send().map_err(|e| Error::FetchError {
            url: url.to_string(),
            reason: e.to_string(),
            retryable: true,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::FetchError {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }

        let bytes = response.bytes().map_err(|e| Error::FetchError {
            url: url.to_string(),
            reason: format!("Failed to read response: {e}"),
            retryable: true,
        })?;

        Ok(bytes.to_vec())
    }
}

/// Local filesystem transport (`file://` URLs or plain paths)
#[derive(Debug, Default, Clone)]
pub struct FileFetcher;

impl FileFetcher {
    fn resolve(url: &str) -> Result<PathBuf> {
        if url.starts_with("file:") {
            let parsed = Url::parse(url)
                .map_err(|e| Error::ParseError(format!("Invalid file URL {url}: {e}")))?;
            parsed
                .to_file_path()
                .map_err(|_| Error::ParseError(format!("Invalid file URL {url}")))
        } else {
            Ok(PathBuf::from(url))
        }
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let path = Self::resolve(url)?;
        debug!("Reading {}", path.display());
        fs::read(&path).map_err(|e| Error::FetchError {
            url: url.to_string(),
            reason: e.to_string(),
            retryable: false,
        })
    }
}

/// Retry policy for transient fetch failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

/// Wraps a fetcher with bounded retries and linear backoff
pub struct RetryingFetcher<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: Fetcher> RetryingFetcher<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<F: Fetcher> Fetcher for RetryingFetcher<F> {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.fetch(url) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!("Fetch attempt {} of {} failed: {}, retrying...", attempt, url, e);
                    std::thread::sleep(self.policy.base_delay * attempt);
                }
                Err(Error::FetchError {
                    url,
                    reason,
                    retryable,
                }) if retryable => {
                    return Err(Error::FetchError {
                        url,
                        reason: format!("{reason} (gave up after {attempt} attempts)"),
                        retryable: false,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn verify(&self, bytes: &[u8], checksum: &Checksum) -> bool {
        self.inner.verify(bytes, checksum)
    }
}

/// Scheme-dispatching fetcher used by the CLI
pub struct DefaultFetcher {
    http: RetryingFetcher<HttpFetcher>,
    file: FileFetcher,
}

impl DefaultFetcher {
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        Ok(Self {
            http: RetryingFetcher::new(HttpFetcher::new()?, policy),
            file: FileFetcher,
        })
    }
}

impl Fetcher for DefaultFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.fetch(url)
        } else {
            self.file.fetch(url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        retryable: bool,
        calls: AtomicU32,
    }

    impl Fetcher for Flaky {
        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(Error::FetchError {
                    url: url.to_string(),
                    reason: "connection reset".into(),
                    retryable: self.retryable,
                });
            }
            Ok(b"payload".to_vec())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_failure() {
        let fetcher = RetryingFetcher::new(
            Flaky {
                failures: 2,
                retryable: true,
                calls: AtomicU32::new(0),
            },
            fast_policy(3),
        );
        assert_eq!(fetcher.fetch("https://example.com/a").unwrap(), b"payload");
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_is_bounded() {
        let fetcher = RetryingFetcher::new(
            Flaky {
                failures: 10,
                retryable: true,
                calls: AtomicU32::new(0),
            },
            fast_policy(3),
        );
        let err = fetcher.fetch("https://example.com/a").unwrap_err();
        assert!(matches!(err, Error::FetchError { retryable: false, .. }));
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let fetcher = RetryingFetcher::new(
            Flaky {
                failures: 1,
                retryable: false,
                calls: AtomicU32::new(0),
            },
            fast_policy(5),
        );
        assert!(fetcher.fetch("https://example.com/a").is_err());
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_fetcher_reads_paths_and_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.tar.gz");
        fs::write(&path, b"archive").unwrap();

        let by_path = FileFetcher.fetch(path.to_str().unwrap()).unwrap();
        assert_eq!(by_path, b"archive");

        let url = Url::from_file_path(&path).unwrap();
        let by_url = FileFetcher.fetch(url.as_str()).unwrap();
        assert_eq!(by_url, b"archive");

        let missing = FileFetcher.fetch(dir.path().join("nope").to_str().unwrap());
        assert!(matches!(missing, Err(Error::FetchError { .. })));
    }

    #[test]
    fn test_fetch_verified_reports_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"tampered").unwrap();

        let expected = hash_bytes(crate::hash::HashAlgorithm::Sha256, b"original");
        let err = fetch_verified(&FileFetcher, path.to_str().unwrap(), &expected, "blob")
            .unwrap_err();
        match err {
            Error::ChecksumMismatch {
                subject, expected: e, ..
            } => {
                assert_eq!(subject, "blob");
                assert_eq!(e, expected.to_prefixed_string());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
