//! Filesystem layout, HTTP fetch utilities, and the collection store seam for
//! the PLS collector.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

mod postgres;
mod repository;

pub use postgres::PgCollectionRepository;
pub use repository::{
    ClaimOutcome, ClaimPolicy, CollectionRepository, LoadReport, MemoryCollectionRepository,
};

pub const CRATE_NAME: &str = "pls-storage";

/// On-disk layout of cached archives, extracted working directories, and the
/// bundled sample CSVs.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self, year: i32) -> PathBuf {
        self.root.join("raw").join(year.to_string())
    }

    /// Cached live download for a year.
    pub fn archive_path(&self, year: i32) -> PathBuf {
        self.raw_dir(year).join(format!("pls_fy{year}_csv.zip"))
    }

    /// Archive packaged from the bundled sample CSVs. Kept apart from the
    /// cache path so a later run still tries the live portal.
    pub fn sample_archive_path(&self, year: i32) -> PathBuf {
        self.raw_dir(year).join(format!("pls_fy{year}_sample.zip"))
    }

    pub fn processed_root(&self) -> PathBuf {
        self.root.join("processed")
    }

    pub fn processed_dir(&self, year: i32) -> PathBuf {
        self.processed_root().join(year.to_string())
    }

    pub fn sample_dir(&self) -> PathBuf {
        self.root.join("sample")
    }

    /// Years that currently have an extracted working directory.
    pub async fn processed_years(&self) -> anyhow::Result<Vec<i32>> {
        let root = self.processed_root();
        if !fs::try_exists(&root)
            .await
            .with_context(|| format!("checking {}", root.display()))?
        {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&root)
            .await
            .with_context(|| format!("reading {}", root.display()))?;
        let mut years = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(year) = entry.file_name().to_string_lossy().parse::<i32>() {
                years.push(year);
            }
        }
        years.sort_unstable();
        Ok(years)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Write bytes through a temp file and an atomic rename.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = temp_sibling(path);
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request deadline; covers the whole body for streamed downloads.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: None,
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub final_url: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

const PROGRESS_STEP_BYTES: u64 = 5 * 1_048_576;

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    async fn send_with_retry(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        async {
            let resp = self.send_with_retry(url).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", %run_id, url))
        .await
    }

    /// Stream a response body into a temp file next to `dest`, logging
    /// byte-count progress and hashing as it goes. Nothing reaches `dest`
    /// until [`StagedDownload::persist`]; dropping the staged file, or the
    /// future mid-stream, removes it.
    pub async fn stage_download(
        &self,
        run_id: Uuid,
        url: &str,
        dest: &Path,
    ) -> Result<StagedDownload, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        async {
            let parent = dest.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(parent).await.map_err(io_err(parent))?;

            let resp = self.send_with_retry(url).await?;
            let final_url = resp.url().to_string();
            let total_size = resp.content_length();
            info!(%final_url, total_bytes = ?total_size, "downloading archive");

            let name = dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download".to_string());
            let (std_file, temp) = tempfile::Builder::new()
                .prefix(&format!(".{name}."))
                .suffix(".tmp")
                .tempfile_in(parent)
                .map_err(io_err(parent))?
                .into_parts();
            let mut file = fs::File::from_std(std_file);
            let mut hasher = Sha256::new();
            let mut downloaded: u64 = 0;
            let mut next_report = PROGRESS_STEP_BYTES;

            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                file.write_all(&chunk).await.map_err(io_err(&temp))?;
                downloaded += chunk.len() as u64;

                if downloaded >= next_report {
                    next_report = downloaded + PROGRESS_STEP_BYTES;
                    match total_size {
                        Some(total) if total > 0 => {
                            let pct = (downloaded as f64 / total as f64) * 100.0;
                            info!(downloaded, total, "download progress {pct:.0}%");
                        }
                        _ => info!(downloaded, "download progress"),
                    }
                }
            }

            file.flush().await.map_err(io_err(&temp))?;
            drop(file);

            info!(downloaded, "download staged");
            Ok::<_, FetchError>(StagedDownload {
                temp,
                dest: dest.to_path_buf(),
                final_url,
                bytes: downloaded,
                sha256: hex::encode(hasher.finalize()),
            })
        }
        .instrument(info_span!("http_download", %run_id, url))
        .await
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError {
    let path = path.display().to_string();
    move |source| FetchError::Io { path, source }
}

/// A complete response body waiting in a temp file beside its destination.
#[derive(Debug)]
pub struct StagedDownload {
    temp: TempPath,
    dest: PathBuf,
    pub final_url: String,
    pub bytes: u64,
    pub sha256: String,
}

impl StagedDownload {
    /// Where the body currently lives.
    pub fn path(&self) -> &Path {
        &self.temp
    }

    /// Atomically rename the staged body onto its destination.
    pub fn persist(self) -> Result<DownloadedFile, FetchError> {
        let Self {
            temp,
            dest,
            final_url,
            bytes,
            sha256,
        } = self;
        temp.persist(&dest).map_err(|err| io_err(&dest)(err.error))?;
        info!(bytes, path = %dest.display(), "download complete");
        Ok(DownloadedFile {
            path: dest,
            final_url,
            bytes,
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn archive_hashing_is_stable() {
        let hash = DataLayout::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn layout_paths_are_keyed_by_year() {
        let layout = DataLayout::new("/data");
        assert_eq!(
            layout.archive_path(2022),
            PathBuf::from("/data/raw/2022/pls_fy2022_csv.zip")
        );
        assert_eq!(
            layout.sample_archive_path(2022),
            PathBuf::from("/data/raw/2022/pls_fy2022_sample.zip")
        );
        assert_eq!(layout.processed_dir(2019), PathBuf::from("/data/processed/2019"));
        assert_eq!(layout.sample_dir(), PathBuf::from("/data/sample"));
    }

    #[tokio::test]
    async fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        let path = layout.archive_path(2021);

        layout.write_atomic(&path, b"first").await.expect("first write");
        layout.write_atomic(&path, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&path).expect("read"), b"second");
        let leftovers = std::fs::read_dir(layout.raw_dir(2021))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn processed_years_lists_only_year_directories() {
        let dir = tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        assert!(layout.processed_years().await.expect("empty").is_empty());

        for year in [2021, 2018] {
            std::fs::create_dir_all(layout.processed_dir(year)).expect("mkdir");
        }
        std::fs::create_dir_all(layout.processed_root().join("scratch")).expect("mkdir");
        std::fs::write(layout.processed_root().join("2020"), b"not a dir").expect("write");

        assert_eq!(layout.processed_years().await.expect("years"), vec![2018, 2021]);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    fn offline_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            backoff: BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    /// Answers every request with `head` followed by `body`, then holds the
    /// connection open when `stall` is set.
    async fn spawn_server(head: &'static str, body: &'static [u8], stall: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(body).await;
                    if stall {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                });
            }
        });
        format!("http://{addr}/archive.zip")
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn unreachable_host_fails_without_writing_destination() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("raw/2022/pls_fy2022_csv.zip");

        let err = offline_fetcher()
            .stage_download(Uuid::new_v4(), "http://127.0.0.1:9/archive.zip", &dest)
            .await
            .expect_err("connection should be refused");
        assert!(matches!(err, FetchError::Request(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn staged_body_reaches_destination_only_on_persist() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("raw/2022/pls_fy2022_csv.zip");
        let url = spawn_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\n",
            b"hello world",
            false,
        )
        .await;
        let fetcher = offline_fetcher();

        let staged = fetcher
            .stage_download(Uuid::new_v4(), &url, &dest)
            .await
            .expect("staged");
        assert!(staged.path().exists());
        assert!(!dest.exists());
        assert_eq!(staged.bytes, 11);

        let file = staged.persist().expect("persist");
        assert_eq!(std::fs::read(&dest).expect("read"), b"hello world");
        assert_eq!(file.sha256, DataLayout::sha256_hex(b"hello world"));
        assert!(temp_files(dest.parent().expect("parent")).is_empty());

        let dropped = fetcher
            .stage_download(Uuid::new_v4(), &url, &dir.path().join("raw/2022/other.zip"))
            .await
            .expect("staged");
        let temp = dropped.path().to_path_buf();
        drop(dropped);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_temp_file() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("raw/2022/pls_fy2022_csv.zip");
        let url = spawn_server(
            "HTTP/1.1 200 OK\r\nContent-Type: application/zip\r\nContent-Length: 1048576\r\n\r\n",
            b"PKpartial",
            true,
        )
        .await;
        let fetcher = offline_fetcher();

        for _ in 0..2 {
            let result = tokio::time::timeout(
                Duration::from_millis(300),
                fetcher.stage_download(Uuid::new_v4(), &url, &dest),
            )
            .await;
            assert!(result.is_err(), "download should still be streaming");
        }

        assert!(!dest.exists());
        assert!(temp_files(dest.parent().expect("parent")).is_empty());
    }
}
