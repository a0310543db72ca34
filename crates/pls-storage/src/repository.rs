use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use pls_core::{Dataset, DatasetStatus, LibraryConfig, LibraryRecord, OutletRecord};
use tokio::sync::Mutex;

/// How a run may claim a dataset for processing.
#[derive(Debug, Clone, Copy)]
pub struct ClaimPolicy {
    /// Allow re-running a year that is already `complete`.
    pub force: bool,
    /// A `processing` row untouched for this long is treated as abandoned.
    pub stale_after: Duration,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            force: false,
            stale_after: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl ClaimPolicy {
    pub fn claimable_statuses(&self) -> Vec<DatasetStatus> {
        let mut statuses = vec![DatasetStatus::Pending, DatasetStatus::Error];
        if self.force {
            statuses.push(DatasetStatus::Complete);
        }
        statuses
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This run moved the dataset to `processing` and owns it.
    Claimed(Dataset),
    AlreadyComplete(Dataset),
    InProgress(Dataset),
}

/// Result of one transactional load. Skipped rows already existed for the
/// dataset; orphan outlets had no parent library in the dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub libraries_inserted: usize,
    pub libraries_skipped: Vec<String>,
    pub outlets_inserted: usize,
    pub outlets_skipped: Vec<(String, String)>,
    pub orphan_outlets: Vec<(String, String)>,
}

/// Outbound interface to the relational store.
#[async_trait]
pub trait CollectionRepository: Send + Sync {
    /// Find the dataset for `year`, creating it as `pending` if absent.
    async fn ensure_dataset(&self, year: i32) -> Result<Dataset>;

    async fn find_dataset(&self, year: i32) -> Result<Option<Dataset>>;

    async fn list_datasets(&self) -> Result<Vec<Dataset>>;

    /// Compare-and-swap the dataset into `processing`.
    async fn claim_dataset(&self, year: i32, policy: ClaimPolicy) -> Result<ClaimOutcome>;

    async fn record_load_summary(&self, dataset_id: i64, record_count: i64, notes: &str)
        -> Result<()>;

    /// Set a terminal status. `notes = None` keeps the existing notes.
    async fn finish_dataset(
        &self,
        dataset_id: i64,
        status: DatasetStatus,
        notes: Option<&str>,
    ) -> Result<Dataset>;

    /// Insert libraries then outlets in one unit of work, skipping rows whose
    /// natural key already exists.
    async fn load_records(
        &self,
        dataset_id: i64,
        libraries: &[LibraryRecord],
        outlets: &[OutletRecord],
    ) -> Result<LoadReport>;

    async fn library_exists(&self, dataset_id: i64, library_id: &str) -> Result<bool>;

    async fn find_library(&self, dataset_id: i64, library_id: &str)
        -> Result<Option<LibraryRecord>>;

    async fn count_libraries(&self, dataset_id: i64) -> Result<i64>;

    async fn count_outlets(&self, dataset_id: i64) -> Result<i64>;

    async fn load_library_config(&self) -> Result<Option<LibraryConfig>>;

    async fn save_library_config(&self, config: &LibraryConfig) -> Result<()>;

    /// Move `last_update_check` forward to `year`; returns false if the
    /// checkpoint was already at or past it, or no config exists.
    async fn advance_checkpoint(&self, year: i32) -> Result<bool>;
}

#[derive(Debug, Default)]
struct MemoryState {
    next_dataset_id: i64,
    datasets: BTreeMap<i32, Dataset>,
    libraries: BTreeMap<(i64, String), LibraryRecord>,
    outlets: BTreeMap<(i64, String, String), OutletRecord>,
    config: Option<LibraryConfig>,
}

impl MemoryState {
    fn dataset_by_id_mut(&mut self, dataset_id: i64) -> Result<&mut Dataset> {
        match self.datasets.values_mut().find(|d| d.id == dataset_id) {
            Some(dataset) => Ok(dataset),
            None => bail!("dataset {dataset_id} not found"),
        }
    }
}

/// In-process store with the same semantics as the Postgres repository.
#[derive(Debug, Default)]
pub struct MemoryCollectionRepository {
    state: Mutex<MemoryState>,
}

impl MemoryCollectionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LibraryConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                config: Some(config),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl CollectionRepository for MemoryCollectionRepository {
    async fn ensure_dataset(&self, year: i32) -> Result<Dataset> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.datasets.get(&year) {
            return Ok(existing.clone());
        }
        state.next_dataset_id += 1;
        let now = Utc::now();
        let dataset = Dataset {
            id: state.next_dataset_id,
            year,
            status: DatasetStatus::Pending,
            record_count: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        state.datasets.insert(year, dataset.clone());
        Ok(dataset)
    }

    async fn find_dataset(&self, year: i32) -> Result<Option<Dataset>> {
        Ok(self.state.lock().await.datasets.get(&year).cloned())
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        Ok(self.state.lock().await.datasets.values().cloned().collect())
    }

    async fn claim_dataset(&self, year: i32, policy: ClaimPolicy) -> Result<ClaimOutcome> {
        let mut state = self.state.lock().await;
        let Some(dataset) = state.datasets.get_mut(&year) else {
            bail!("dataset for {year} does not exist");
        };

        let now = Utc::now();
        let stale = dataset.status == DatasetStatus::Processing
            && (now - dataset.updated_at)
                .to_std()
                .is_ok_and(|age| age > policy.stale_after);

        if policy.claimable_statuses().contains(&dataset.status) || stale {
            dataset.status = DatasetStatus::Processing;
            dataset.notes = None;
            dataset.updated_at = now;
            return Ok(ClaimOutcome::Claimed(dataset.clone()));
        }

        Ok(match dataset.status {
            DatasetStatus::Complete => ClaimOutcome::AlreadyComplete(dataset.clone()),
            _ => ClaimOutcome::InProgress(dataset.clone()),
        })
    }

    async fn record_load_summary(
        &self,
        dataset_id: i64,
        record_count: i64,
        notes: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let dataset = state.dataset_by_id_mut(dataset_id)?;
        dataset.record_count = Some(record_count);
        dataset.notes = Some(notes.to_string());
        dataset.updated_at = Utc::now();
        Ok(())
    }

    async fn finish_dataset(
        &self,
        dataset_id: i64,
        status: DatasetStatus,
        notes: Option<&str>,
    ) -> Result<Dataset> {
        let mut state = self.state.lock().await;
        let dataset = state.dataset_by_id_mut(dataset_id)?;
        dataset.status = status;
        if let Some(notes) = notes {
            dataset.notes = Some(notes.to_string());
        }
        dataset.updated_at = Utc::now();
        Ok(dataset.clone())
    }

    async fn load_records(
        &self,
        dataset_id: i64,
        libraries: &[LibraryRecord],
        outlets: &[OutletRecord],
    ) -> Result<LoadReport> {
        let mut state = self.state.lock().await;
        if !state.datasets.values().any(|d| d.id == dataset_id) {
            bail!("dataset {dataset_id} not found");
        }

        let mut report = LoadReport::default();
        for library in libraries {
            let key = (dataset_id, library.library_id.clone());
            if state.libraries.contains_key(&key) {
                report.libraries_skipped.push(library.library_id.clone());
                continue;
            }
            state.libraries.insert(key, library.clone());
            report.libraries_inserted += 1;
        }

        for outlet in outlets {
            let natural = (outlet.library_id.clone(), outlet.outlet_id.clone());
            if !state
                .libraries
                .contains_key(&(dataset_id, outlet.library_id.clone()))
            {
                report.orphan_outlets.push(natural);
                continue;
            }
            let key = (dataset_id, outlet.library_id.clone(), outlet.outlet_id.clone());
            if state.outlets.contains_key(&key) {
                report.outlets_skipped.push(natural);
                continue;
            }
            state.outlets.insert(key, outlet.clone());
            report.outlets_inserted += 1;
        }

        Ok(report)
    }

    async fn library_exists(&self, dataset_id: i64, library_id: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .libraries
            .contains_key(&(dataset_id, library_id.to_string())))
    }

    async fn find_library(
        &self,
        dataset_id: i64,
        library_id: &str,
    ) -> Result<Option<LibraryRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .libraries
            .get(&(dataset_id, library_id.to_string()))
            .cloned())
    }

    async fn count_libraries(&self, dataset_id: i64) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.libraries.keys().filter(|(id, _)| *id == dataset_id).count() as i64)
    }

    async fn count_outlets(&self, dataset_id: i64) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.outlets.keys().filter(|(id, _, _)| *id == dataset_id).count() as i64)
    }

    async fn load_library_config(&self) -> Result<Option<LibraryConfig>> {
        Ok(self.state.lock().await.config.clone())
    }

    async fn save_library_config(&self, config: &LibraryConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut config = config.clone();
        if config.last_update_check.is_none() {
            config.last_update_check = state.config.as_ref().and_then(|c| c.last_update_check);
        }
        state.config = Some(config);
        Ok(())
    }

    async fn advance_checkpoint(&self, year: i32) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.config.as_mut() {
            Some(config) if config.checkpoint_advances_to(year) => {
                config.last_update_check = Some(year);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
