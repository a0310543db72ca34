use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pls_adapters::YearSource;
use pls_core::{Dataset, DatasetStatus, LibraryConfig, LibraryRecord, OutletRecord};
use pls_storage::{
    ClaimOutcome, ClaimPolicy, CollectionRepository, DataLayout, LoadReport,
    MemoryCollectionRepository,
};
use pls_sync::{ArchiveOrigin, CollectionOutcome, Collector, CollectorConfig, UpdateOutcome};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

const NY0773_LIBRARY_CSV: &str =
    "FSCSKEY,LIBNAME,STABR,TOTCIR,VISITS\nNY0773,Queens Borough Public Library,NY,210000,175000\n";

struct StaticYears(BTreeSet<i32>);

#[async_trait]
impl YearSource for StaticYears {
    async fn discover_available_years(&self) -> BTreeSet<i32> {
        self.0.clone()
    }
}

fn offline_config(dir: &TempDir) -> CollectorConfig {
    CollectorConfig {
        data_dir: dir.path().to_path_buf(),
        portal_index_url: "http://127.0.0.1:9/pls".to_string(),
        http_timeout_secs: 2,
        http_max_retries: 0,
        download_timeout_secs: 5,
        ..Default::default()
    }
}

fn write_sample(layout: &DataLayout, library_csv: &str) {
    let dir = layout.sample_dir();
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("pls_library_sample.csv"), library_csv).unwrap();
}

fn write_cached_archive(layout: &DataLayout, year: i32, entries: &[(&str, &str)]) {
    let path = layout.archive_path(year);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
    for (name, body) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

fn collector(dir: &TempDir, repo: Arc<dyn CollectionRepository>, years: &[i32]) -> Collector {
    Collector::new(offline_config(dir), repo)
        .unwrap()
        .with_year_source(Arc::new(StaticYears(years.iter().copied().collect())))
}

async fn dataset(repo: &dyn CollectionRepository, year: i32) -> Dataset {
    repo.find_dataset(year).await.unwrap().unwrap()
}

#[tokio::test]
async fn sample_fallback_loads_single_library_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    write_sample(&layout, NY0773_LIBRARY_CSV);
    let repo = Arc::new(MemoryCollectionRepository::new());
    let collector = collector(&dir, repo.clone(), &[]);

    assert!(collector.collect_data_for_year(2022).await);

    let ds = dataset(repo.as_ref(), 2022).await;
    assert_eq!(ds.status, DatasetStatus::Complete);
    assert_eq!(ds.record_count, Some(1));
    assert!(ds.notes.as_deref().is_some_and(|n| n.contains("sample archive")));
    assert_eq!(repo.count_libraries(ds.id).await.unwrap(), 1);
    assert_eq!(repo.count_outlets(ds.id).await.unwrap(), 0);

    let library = repo.find_library(ds.id, "NY0773").await.unwrap().unwrap();
    assert_eq!(library.total_circulation, Some(210_000));
    assert_eq!(library.visits, Some(175_000));

    assert!(layout.sample_archive_path(2022).exists());
    assert!(!layout.archive_path(2022).exists());
}

#[tokio::test]
async fn rerunning_a_year_does_not_duplicate_rows() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    write_cached_archive(
        &layout,
        2021,
        &[
            ("pupld21.csv", "FSCSKEY,LIBNAME\nNY0773,Queens\nNY0001,Albany\n"),
            ("puout21.csv", "FSCSKEY,FSCS_SEQ,LIBNAME\nNY0773,001,Central\nNY0773,002,Astoria\n"),
        ],
    );
    let repo = Arc::new(MemoryCollectionRepository::new());
    let collector = collector(&dir, repo.clone(), &[]);

    let first = collector.collect_year(2021, false).await;
    assert_eq!(
        first,
        CollectionOutcome::Collected {
            year: 2021,
            libraries: 2,
            outlets: 2,
            origin: ArchiveOrigin::Cache,
        }
    );
    assert_eq!(
        collector.collect_year(2021, false).await,
        CollectionOutcome::AlreadyComplete { year: 2021 }
    );
    assert!(collector.collect_year(2021, true).await.is_success());

    let ds = dataset(repo.as_ref(), 2021).await;
    assert_eq!(ds.status, DatasetStatus::Complete);
    assert_eq!(repo.count_libraries(ds.id).await.unwrap(), 2);
    assert_eq!(repo.count_outlets(ds.id).await.unwrap(), 2);
}

#[tokio::test]
async fn update_is_a_no_op_once_latest_year_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(&DataLayout::new(dir.path()), NY0773_LIBRARY_CSV);
    let repo = Arc::new(MemoryCollectionRepository::with_config(LibraryConfig::new("NY0773")));
    let collector = collector(&dir, repo.clone(), &[2020, 2022, 2021]);

    let first = collector.update_with_latest_data().await;
    assert_eq!(first, UpdateOutcome::Updated(2022));
    assert_eq!(first.updated_year(), Some(2022));

    let second = collector.update_with_latest_data().await;
    assert_eq!(second, UpdateOutcome::AlreadyCurrent(2022));
    assert_eq!(second.updated_year(), None);

    let status = collector.get_collection_status().await.unwrap();
    assert_eq!(status.keys().copied().collect::<Vec<_>>(), vec![2022]);
    assert_eq!(
        repo.load_library_config().await.unwrap().unwrap().last_update_check,
        Some(2022)
    );
}

#[tokio::test]
async fn update_recollects_complete_year_missing_configured_library() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(&DataLayout::new(dir.path()), NY0773_LIBRARY_CSV);
    let repo = Arc::new(MemoryCollectionRepository::with_config(LibraryConfig::new("ZZ9999")));
    let collector = collector(&dir, repo.clone(), &[2022]);

    let outcome = collector.collect_year(2022, false).await;
    assert!(matches!(outcome, CollectionOutcome::NoData { year: 2022, .. }));
    let ds = dataset(repo.as_ref(), 2022).await;
    assert_eq!(ds.status, DatasetStatus::Complete);
    assert_eq!(ds.record_count, Some(0));

    repo.save_library_config(&LibraryConfig::new("NY0773")).await.unwrap();
    assert_eq!(collector.update_with_latest_data().await, UpdateOutcome::Updated(2022));
    assert!(repo.library_exists(ds.id, "NY0773").await.unwrap());
}

#[tokio::test]
async fn nothing_discovered_means_nothing_collected() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryCollectionRepository::new());
    let collector = collector(&dir, repo.clone(), &[]);

    assert_eq!(collector.update_with_latest_data().await, UpdateOutcome::NothingDiscovered);
    assert!(collector.collect_all_available_data().await.is_empty());
    assert!(repo.list_datasets().await.unwrap().is_empty());
}

#[tokio::test]
async fn one_failing_year_does_not_stop_the_next() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    write_sample(&layout, NY0773_LIBRARY_CSV);
    write_cached_archive(&layout, 2021, &[("pupld21.csv", "LIBNAME\nQueens\n")]);

    let repo = Arc::new(MemoryCollectionRepository::new());
    let collector = collector(&dir, repo.clone(), &[2021, 2022]);

    let results = collector.collect_all_available_data().await;
    assert_eq!(results.get(&2021), Some(&false));
    assert_eq!(results.get(&2022), Some(&true));

    let failed = dataset(repo.as_ref(), 2021).await;
    assert_eq!(failed.status, DatasetStatus::Error);
    assert!(failed
        .notes
        .as_deref()
        .is_some_and(|n| n.contains("required column FSCSKEY missing")));
    assert_eq!(dataset(repo.as_ref(), 2022).await.status, DatasetStatus::Complete);
}

#[tokio::test]
async fn exhausted_acquisition_marks_year_error() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryCollectionRepository::new());
    let collector = collector(&dir, repo.clone(), &[]);

    assert!(!collector.collect_data_for_year(2022).await);
    let ds = dataset(repo.as_ref(), 2022).await;
    assert_eq!(ds.status, DatasetStatus::Error);
    assert!(ds
        .notes
        .as_deref()
        .is_some_and(|n| n.contains("no archive could be acquired")));

    write_sample(&DataLayout::new(dir.path()), NY0773_LIBRARY_CSV);
    assert!(collector.collect_data_for_year(2022).await);
}

#[tokio::test]
async fn year_claimed_elsewhere_reports_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(&DataLayout::new(dir.path()), NY0773_LIBRARY_CSV);
    let repo = Arc::new(MemoryCollectionRepository::new());
    repo.ensure_dataset(2022).await.unwrap();
    assert!(matches!(
        repo.claim_dataset(2022, ClaimPolicy::default()).await.unwrap(),
        ClaimOutcome::Claimed(_)
    ));

    let collector = collector(&dir, repo.clone(), &[]);
    assert_eq!(
        collector.collect_year(2022, false).await,
        CollectionOutcome::InProgress { year: 2022 }
    );
    assert!(!collector.collect_data_for_year(2022).await);
}

/// Delegates to the in-memory store, failing record loads or the final
/// `complete` transition on request.
#[derive(Default)]
struct FlakyRepo {
    inner: MemoryCollectionRepository,
    fail_loads: bool,
    fail_completion: bool,
}

#[async_trait]
impl CollectionRepository for FlakyRepo {
    async fn ensure_dataset(&self, year: i32) -> Result<Dataset> {
        self.inner.ensure_dataset(year).await
    }

    async fn find_dataset(&self, year: i32) -> Result<Option<Dataset>> {
        self.inner.find_dataset(year).await
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        self.inner.list_datasets().await
    }

    async fn claim_dataset(&self, year: i32, policy: ClaimPolicy) -> Result<ClaimOutcome> {
        self.inner.claim_dataset(year, policy).await
    }

    async fn record_load_summary(&self, dataset_id: i64, record_count: i64, notes: &str) -> Result<()> {
        self.inner.record_load_summary(dataset_id, record_count, notes).await
    }

    async fn finish_dataset(
        &self,
        dataset_id: i64,
        status: DatasetStatus,
        notes: Option<&str>,
    ) -> Result<Dataset> {
        if self.fail_completion && status == DatasetStatus::Complete {
            return Err(anyhow!("commit timed out"));
        }
        self.inner.finish_dataset(dataset_id, status, notes).await
    }

    async fn load_records(
        &self,
        dataset_id: i64,
        libraries: &[LibraryRecord],
        outlets: &[OutletRecord],
    ) -> Result<LoadReport> {
        if self.fail_loads {
            return Err(anyhow!("connection reset during load"));
        }
        self.inner.load_records(dataset_id, libraries, outlets).await
    }

    async fn library_exists(&self, dataset_id: i64, library_id: &str) -> Result<bool> {
        self.inner.library_exists(dataset_id, library_id).await
    }

    async fn find_library(&self, dataset_id: i64, library_id: &str) -> Result<Option<LibraryRecord>> {
        self.inner.find_library(dataset_id, library_id).await
    }

    async fn count_libraries(&self, dataset_id: i64) -> Result<i64> {
        self.inner.count_libraries(dataset_id).await
    }

    async fn count_outlets(&self, dataset_id: i64) -> Result<i64> {
        self.inner.count_outlets(dataset_id).await
    }

    async fn load_library_config(&self) -> Result<Option<LibraryConfig>> {
        self.inner.load_library_config().await
    }

    async fn save_library_config(&self, config: &LibraryConfig) -> Result<()> {
        self.inner.save_library_config(config).await
    }

    async fn advance_checkpoint(&self, year: i32) -> Result<bool> {
        self.inner.advance_checkpoint(year).await
    }
}

#[tokio::test]
async fn persistence_failure_is_recorded_on_the_dataset() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(&DataLayout::new(dir.path()), NY0773_LIBRARY_CSV);
    let repo = Arc::new(FlakyRepo {
        fail_loads: true,
        ..Default::default()
    });
    let collector = collector(&dir, repo.clone(), &[2022]);

    let outcome = collector.collect_year(2022, false).await;
    let CollectionOutcome::Failed { year, error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(year, 2022);
    assert!(error.contains("connection reset during load"));

    let ds = dataset(repo.as_ref(), 2022).await;
    assert_eq!(ds.status, DatasetStatus::Error);
    assert!(ds.notes.as_deref().is_some_and(|n| n.contains("connection reset")));
    assert_eq!(
        collector.update_with_latest_data().await,
        UpdateOutcome::Failed(2022)
    );
}

#[tokio::test]
async fn failed_completion_marks_year_error() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(&DataLayout::new(dir.path()), NY0773_LIBRARY_CSV);
    let repo = Arc::new(FlakyRepo {
        fail_completion: true,
        ..Default::default()
    });
    let collector = collector(&dir, repo.clone(), &[]);

    let outcome = collector.collect_year(2022, false).await;
    let CollectionOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(error.contains("commit timed out"));

    let ds = dataset(repo.as_ref(), 2022).await;
    assert_eq!(ds.status, DatasetStatus::Error);
    assert!(ds.notes.as_deref().is_some_and(|n| n.contains("commit timed out")));
}

#[tokio::test]
async fn concurrent_runs_for_one_year_collect_once() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(&DataLayout::new(dir.path()), NY0773_LIBRARY_CSV);
    let repo = Arc::new(MemoryCollectionRepository::new());
    let collector = collector(&dir, repo.clone(), &[]);

    let (first, second) = tokio::join!(
        collector.collect_year(2022, false),
        collector.collect_year(2022, false)
    );
    let outcomes = [first, second];
    let in_progress = outcomes
        .iter()
        .filter(|o| **o == CollectionOutcome::InProgress { year: 2022 })
        .count();
    assert_eq!(in_progress, 1, "{outcomes:?}");
    assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 1);

    let ds = dataset(repo.as_ref(), 2022).await;
    assert_eq!(ds.status, DatasetStatus::Complete);
    assert_eq!(repo.count_libraries(ds.id).await.unwrap(), 1);
}

#[tokio::test]
async fn update_without_configured_library_keeps_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(&DataLayout::new(dir.path()), NY0773_LIBRARY_CSV);
    let mut config = LibraryConfig::new("ZZ9999");
    config.last_update_check = Some(2020);
    let repo = Arc::new(MemoryCollectionRepository::with_config(config));
    let collector = collector(&dir, repo.clone(), &[2021, 2022]);

    assert_eq!(collector.update_with_latest_data().await, UpdateOutcome::Updated(2022));
    let ds = dataset(repo.as_ref(), 2022).await;
    assert_eq!(ds.status, DatasetStatus::Complete);
    assert_eq!(ds.record_count, Some(0));
    assert_eq!(
        repo.load_library_config().await.unwrap().unwrap().last_update_check,
        Some(2020)
    );
}

#[tokio::test]
async fn imported_yaml_config_scopes_collection() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    write_sample(
        &layout,
        "FSCSKEY,LIBNAME\nNY0773,Queens\nNY0001,Albany\nCA0001,Alameda\n",
    );
    let yaml = dir.path().join("library.yaml");
    std::fs::write(&yaml, "library_id: NY0773\ncomparison_library_ids: [ny0001]\n").unwrap();

    let repo = Arc::new(MemoryCollectionRepository::new());
    let collector = collector(&dir, repo.clone(), &[]);
    collector.import_library_config(&yaml).await.unwrap();

    assert!(collector.collect_data_for_year(2022).await);
    let ds = dataset(repo.as_ref(), 2022).await;
    assert_eq!(repo.count_libraries(ds.id).await.unwrap(), 2);
    assert!(!repo.library_exists(ds.id, "CA0001").await.unwrap());
}
