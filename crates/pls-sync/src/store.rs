use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use pls_adapters::NormalizedRecords;
use pls_core::{Dataset, DatasetStatus};
use pls_storage::{CollectionRepository, DataLayout, LoadReport};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::acquire::AcquiredArchive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub report: LoadReport,
    pub notes: String,
    pub checkpoint_advanced: bool,
    pub purged_years: Vec<i32>,
}

/// Persists one year's normalized records against its claimed dataset.
#[derive(Clone)]
pub struct CollectionStore {
    repo: Arc<dyn CollectionRepository>,
    layout: DataLayout,
    retention_years: i32,
}

impl CollectionStore {
    pub fn new(repo: Arc<dyn CollectionRepository>, layout: DataLayout, retention_years: i32) -> Self {
        Self {
            repo,
            layout,
            retention_years,
        }
    }

    pub fn import_notes(records: &NormalizedRecords, archive: &AcquiredArchive) -> String {
        let mut notes = format!(
            "Imported {} libraries and {} outlets at {} from {} archive {} (sha256 {})",
            records.libraries.len(),
            records.outlets.len(),
            Utc::now().to_rfc3339(),
            archive.origin,
            archive.path.display(),
            archive.sha256,
        );
        if let Some(url) = &archive.source_url {
            notes.push_str(&format!(" downloaded from {url}"));
        }
        notes
    }

    pub async fn load_data_into_db(
        &self,
        dataset: &Dataset,
        records: &NormalizedRecords,
        archive: &AcquiredArchive,
    ) -> Result<LoadSummary> {
        let year = dataset.year;
        let notes = Self::import_notes(records, archive);
        self.repo
            .record_load_summary(dataset.id, records.libraries.len() as i64, &notes)
            .await
            .with_context(|| format!("recording load summary for {year}"))?;

        let report = self
            .repo
            .load_records(dataset.id, &records.libraries, &records.outlets)
            .await
            .with_context(|| format!("loading records for {year}"))?;

        for library_id in &report.libraries_skipped {
            debug!(year, %library_id, "library already loaded; skipping");
        }
        for (library_id, outlet_id) in &report.outlets_skipped {
            debug!(year, %library_id, %outlet_id, "outlet already loaded; skipping");
        }
        if !report.orphan_outlets.is_empty() {
            warn!(
                year,
                count = report.orphan_outlets.len(),
                first = ?report.orphan_outlets.first(),
                "outlets skipped because their library is absent"
            );
        }
        info!(
            year,
            libraries_inserted = report.libraries_inserted,
            libraries_skipped = report.libraries_skipped.len(),
            outlets_inserted = report.outlets_inserted,
            outlets_skipped = report.outlets_skipped.len(),
            "records loaded"
        );

        let checkpoint_advanced = self.advance_checkpoint(year).await?;
        let purged_years = self.purge_processed(year).await;

        Ok(LoadSummary {
            report,
            notes,
            checkpoint_advanced,
            purged_years,
        })
    }

    /// Moves the config checkpoint to `year` if it is newer. No config, no-op.
    pub async fn advance_checkpoint(&self, year: i32) -> Result<bool> {
        let Some(config) = self.repo.load_library_config().await? else {
            return Ok(false);
        };
        if !config.checkpoint_advances_to(year) {
            return Ok(false);
        }
        let advanced = self.repo.advance_checkpoint(year).await?;
        if advanced {
            info!(year, library_id = %config.library_id, "update checkpoint advanced");
        }
        Ok(advanced)
    }

    /// Deletes extracted working directories older than the retention window,
    /// leaving alone any year another run is still processing. Failures are
    /// logged and otherwise ignored.
    pub async fn purge_processed(&self, year: i32) -> Vec<i32> {
        let cutoff = year - self.retention_years;
        let years = match self.layout.processed_years().await {
            Ok(years) => years,
            Err(err) => {
                warn!(error = %err, "listing processed directories failed");
                return Vec::new();
            }
        };

        let mut purged = Vec::new();
        for old in years.into_iter().filter(|y| *y < cutoff) {
            if self.is_processing(old).await {
                debug!(year = old, "processed directory in use; keeping");
                continue;
            }
            let dir = self.layout.processed_dir(old);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    debug!(path = %dir.display(), "purged processed directory");
                    purged.push(old);
                }
                Err(err) => warn!(path = %dir.display(), error = %err, "purging processed directory failed"),
            }
        }
        purged
    }

    /// Unknown state counts as busy.
    async fn is_processing(&self, year: i32) -> bool {
        match self.repo.find_dataset(year).await {
            Ok(dataset) => dataset.is_some_and(|d| d.status == DatasetStatus::Processing),
            Err(err) => {
                warn!(year, error = %format!("{err:#}"), "could not check dataset before purging");
                true
            }
        }
    }
}
