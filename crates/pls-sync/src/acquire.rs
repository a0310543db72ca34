//! Produces a local survey archive for a year through an ordered chain of
//! strategies: the on-disk cache, the live portal, then the bundled sample.

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use pls_adapters::{ArchiveClassifier, Classification, PortalError, PortalLocator};
use pls_storage::{DataLayout, FetchError};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveOrigin {
    Cache,
    Portal,
    Sample,
}

impl fmt::Display for ArchiveOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cache => "cached",
            Self::Portal => "portal",
            Self::Sample => "sample",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredArchive {
    pub path: PathBuf,
    pub origin: ArchiveOrigin,
    pub sha256: String,
    pub source_url: Option<String>,
}

/// Outcome of one strategy.
#[derive(Debug)]
pub enum Attempt {
    Acquired(AcquiredArchive),
    Failed { reason: String },
}

impl From<Result<AcquiredArchive>> for Attempt {
    fn from(result: Result<AcquiredArchive>) -> Self {
        match result {
            Ok(archive) => Self::Acquired(archive),
            Err(err) => Self::Failed {
                reason: format!("{err:#}"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub strategy: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("portal download for FY{year} exceeded {timeout:?}")]
    TimedOut { year: i32, timeout: Duration },
    #[error("body downloaded from {url} is not a zip archive: {source}")]
    NotAnArchive {
        url: String,
        source: zip::result::ZipError,
    },
    #[error("archive check task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("no archive could be acquired for FY{year}: {}", describe(attempts))]
    Exhausted {
        year: i32,
        attempts: Vec<FailedAttempt>,
    },
}

fn describe(attempts: &[FailedAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.strategy, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, run_id: Uuid, year: i32) -> Attempt;
}

/// Opens `path` as a zip archive and returns its entry count.
fn open_zip(path: &Path) -> zip::result::ZipResult<usize> {
    let file = File::open(path)?;
    Ok(ZipArchive::new(file)?.len())
}

async fn check_zip(path: &Path) -> Result<zip::result::ZipResult<usize>, tokio::task::JoinError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || open_zip(&path)).await
}

async fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(DataLayout::sha256_hex(&bytes))
}

/// Reuses a previously downloaded archive at the cache path.
pub struct CachedArchive {
    layout: DataLayout,
}

impl CachedArchive {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    async fn lookup(&self, year: i32) -> Result<AcquiredArchive> {
        let path = self.layout.archive_path(year);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                bail!("no cached archive at {}", path.display())
            }
            Err(err) => return Err(err).with_context(|| format!("inspecting {}", path.display())),
        };
        let problem = if meta.len() == 0 {
            Some("empty file".to_string())
        } else {
            check_zip(&path)
                .await
                .context("cache check task failed")?
                .err()
                .map(|err| err.to_string())
        };
        if let Some(problem) = problem {
            warn!(path = %path.display(), %problem, "discarding unreadable cached archive");
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %err, "could not remove cached archive");
            }
            bail!("cached archive {} is unreadable: {problem}", path.display());
        }
        let sha256 = hash_file(&path).await?;
        Ok(AcquiredArchive {
            path,
            origin: ArchiveOrigin::Cache,
            sha256,
            source_url: None,
        })
    }
}

#[async_trait]
impl AcquisitionStrategy for CachedArchive {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn attempt(&self, _run_id: Uuid, year: i32) -> Attempt {
        self.lookup(year).await.into()
    }
}

/// Locates the year's CSV archive on the portal and streams it into the
/// cache path, all under one overall deadline. Only a body that opens as a
/// zip archive is kept.
pub struct PortalDownload {
    locator: PortalLocator,
    layout: DataLayout,
    deadline: Duration,
}

impl PortalDownload {
    pub fn new(locator: PortalLocator, layout: DataLayout, deadline: Duration) -> Self {
        Self {
            locator,
            layout,
            deadline,
        }
    }

    async fn download(&self, run_id: Uuid, year: i32) -> Result<AcquiredArchive, DownloadError> {
        let dest = self.layout.archive_path(year);
        let work = async {
            let url = self.locator.locate_archive_url(run_id, year).await?;
            info!(%url, year, "found portal archive link");
            let staged = self
                .locator
                .http()
                .stage_download(run_id, url.as_str(), &dest)
                .await?;
            if let Err(source) = check_zip(staged.path()).await? {
                return Err(DownloadError::NotAnArchive {
                    url: staged.final_url.clone(),
                    source,
                });
            }
            let file = staged.persist()?;
            Ok::<_, DownloadError>(AcquiredArchive {
                path: file.path,
                origin: ArchiveOrigin::Portal,
                sha256: file.sha256,
                source_url: Some(file.final_url),
            })
        };
        match tokio::time::timeout(self.deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::TimedOut {
                year,
                timeout: self.deadline,
            }),
        }
    }
}

#[async_trait]
impl AcquisitionStrategy for PortalDownload {
    fn name(&self) -> &'static str {
        "portal"
    }

    async fn attempt(&self, run_id: Uuid, year: i32) -> Attempt {
        self.download(run_id, year)
            .await
            .map_err(anyhow::Error::from)
            .into()
    }
}

/// Packages the bundled sample CSVs into a per-year archive so the pipeline
/// still runs without the portal.
pub struct BundledSample {
    layout: DataLayout,
}

impl BundledSample {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    async fn package(&self, year: i32) -> Result<AcquiredArchive> {
        let sample_dir = self.layout.sample_dir();
        let bytes = tokio::task::spawn_blocking(move || package_sample_dir(&sample_dir))
            .await
            .context("sample packaging task failed")??;

        let path = self.layout.sample_archive_path(year);
        self.layout.write_atomic(&path, &bytes).await?;
        Ok(AcquiredArchive {
            path,
            origin: ArchiveOrigin::Sample,
            sha256: DataLayout::sha256_hex(&bytes),
            source_url: None,
        })
    }
}

#[async_trait]
impl AcquisitionStrategy for BundledSample {
    fn name(&self) -> &'static str {
        "sample"
    }

    async fn attempt(&self, _run_id: Uuid, year: i32) -> Attempt {
        self.package(year).await.into()
    }
}

/// Zips the sample library table and, when present, the outlet table.
fn package_sample_dir(sample_dir: &Path) -> Result<Vec<u8>> {
    let entries = std::fs::read_dir(sample_dir)
        .with_context(|| format!("reading sample directory {}", sample_dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", sample_dir.display()))?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }

    let files = match ArchiveClassifier::default().classify_files(&paths) {
        Classification::Resolved(files) => files,
        Classification::Unresolved { .. } => {
            bail!("no library CSV in {}", sample_dir.display())
        }
    };

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for path in std::iter::once(&files.library).chain(files.outlet.as_ref()) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        writer
            .start_file(name, options)
            .with_context(|| format!("adding {} to sample archive", path.display()))?;
        let mut source =
            File::open(path).with_context(|| format!("opening {}", path.display()))?;
        io::copy(&mut source, &mut writer)
            .with_context(|| format!("copying {} into sample archive", path.display()))?;
    }
    let cursor = writer.finish().context("finishing sample archive")?;
    Ok(cursor.into_inner())
}

pub struct ArchiveAcquirer {
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
}

impl ArchiveAcquirer {
    pub fn new(strategies: Vec<Box<dyn AcquisitionStrategy>>) -> Self {
        Self { strategies }
    }

    /// Cache, then portal, then bundled sample.
    pub fn standard(layout: DataLayout, locator: PortalLocator, deadline: Duration) -> Self {
        Self::new(vec![
            Box::new(CachedArchive::new(layout.clone())),
            Box::new(PortalDownload::new(locator, layout.clone(), deadline)),
            Box::new(BundledSample::new(layout)),
        ])
    }

    pub async fn download_data_for_year(
        &self,
        run_id: Uuid,
        year: i32,
    ) -> Result<AcquiredArchive, AcquisitionError> {
        let mut attempts = Vec::new();
        for strategy in &self.strategies {
            match strategy.attempt(run_id, year).await {
                Attempt::Acquired(archive) => {
                    info!(
                        year,
                        strategy = strategy.name(),
                        path = %archive.path.display(),
                        sha256 = %archive.sha256,
                        "archive acquired"
                    );
                    return Ok(archive);
                }
                Attempt::Failed { reason } => {
                    warn!(year, strategy = strategy.name(), %reason, "acquisition strategy failed");
                    attempts.push(FailedAttempt {
                        strategy: strategy.name(),
                        reason,
                    });
                }
            }
        }
        Err(AcquisitionError::Exhausted { year, attempts })
    }
}
