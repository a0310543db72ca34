use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pls_core::{Dataset, DatasetStatus, LibraryConfig, LibraryRecord, OutletRecord};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use crate::repository::{ClaimOutcome, ClaimPolicy, CollectionRepository, LoadReport};

const DATASET_COLUMNS: &str = "id, year, status, record_count, notes, created_at, updated_at";

/// Postgres-backed collection store.
#[derive(Debug, Clone)]
pub struct PgCollectionRepository {
    pool: PgPool,
}

impl PgCollectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running collector migrations")?;
        info!("collector migrations applied");
        Ok(())
    }
}

fn dataset_from_row(row: &PgRow) -> Result<Dataset> {
    let status: String = row.try_get("status")?;
    Ok(Dataset {
        id: row.try_get("id")?,
        year: row.try_get("year")?,
        status: status.parse()?,
        record_count: row.try_get("record_count")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CollectionRepository for PgCollectionRepository {
    async fn ensure_dataset(&self, year: i32) -> Result<Dataset> {
        sqlx::query("INSERT INTO datasets (year, status) VALUES ($1, 'pending') ON CONFLICT (year) DO NOTHING")
            .bind(year)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating dataset for {year}"))?;

        self.find_dataset(year)
            .await?
            .with_context(|| format!("dataset for {year} missing after insert"))
    }

    async fn find_dataset(&self, year: i32) -> Result<Option<Dataset>> {
        let row = sqlx::query(&format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE year = $1"))
            .bind(year)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading dataset for {year}"))?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let rows = sqlx::query(&format!("SELECT {DATASET_COLUMNS} FROM datasets ORDER BY year"))
            .fetch_all(&self.pool)
            .await
            .context("listing datasets")?;
        rows.iter().map(dataset_from_row).collect()
    }

    async fn claim_dataset(&self, year: i32, policy: ClaimPolicy) -> Result<ClaimOutcome> {
        let claimable: Vec<String> = policy
            .claimable_statuses()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let claimed = sqlx::query(&format!(
            r#"
            UPDATE datasets
               SET status = 'processing', notes = NULL, updated_at = now()
             WHERE year = $1
               AND (status = ANY($2)
                    OR (status = 'processing'
                        AND updated_at < now() - make_interval(secs => $3)))
            RETURNING {DATASET_COLUMNS}
            "#
        ))
        .bind(year)
        .bind(claimable)
        .bind(policy.stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("claiming dataset for {year}"))?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(dataset_from_row(&row)?));
        }

        let current = self
            .find_dataset(year)
            .await?
            .with_context(|| format!("dataset for {year} does not exist"))?;
        Ok(match current.status {
            DatasetStatus::Complete => ClaimOutcome::AlreadyComplete(current),
            _ => ClaimOutcome::InProgress(current),
        })
    }

    async fn record_load_summary(
        &self,
        dataset_id: i64,
        record_count: i64,
        notes: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE datasets SET record_count = $2, notes = $3, updated_at = now() WHERE id = $1",
        )
        .bind(dataset_id)
        .bind(record_count)
        .bind(notes)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording load summary for dataset {dataset_id}"))?;
        Ok(())
    }

    async fn finish_dataset(
        &self,
        dataset_id: i64,
        status: DatasetStatus,
        notes: Option<&str>,
    ) -> Result<Dataset> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE datasets
               SET status = $2, notes = COALESCE($3, notes), updated_at = now()
             WHERE id = $1
            RETURNING {DATASET_COLUMNS}
            "#
        ))
        .bind(dataset_id)
        .bind(status.as_str())
        .bind(notes)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("setting dataset {dataset_id} to {status}"))?;
        dataset_from_row(&row)
    }

    async fn load_records(
        &self,
        dataset_id: i64,
        libraries: &[LibraryRecord],
        outlets: &[OutletRecord],
    ) -> Result<LoadReport> {
        let mut tx = self.pool.begin().await.context("starting load transaction")?;
        let mut report = LoadReport::default();

        for library in libraries {
            let result = sqlx::query(
                r#"
                INSERT INTO libraries (dataset_id, library_id, name, state, data_json)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (dataset_id, library_id) DO NOTHING
                "#,
            )
            .bind(dataset_id)
            .bind(&library.library_id)
            .bind(library.name.as_deref())
            .bind(library.state.as_deref())
            .bind(Json(library))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting library {}", library.library_id))?;

            if result.rows_affected() == 0 {
                report.libraries_skipped.push(library.library_id.clone());
            } else {
                report.libraries_inserted += 1;
            }
        }

        for outlet in outlets {
            let natural = (outlet.library_id.clone(), outlet.outlet_id.clone());
            let parent_exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM libraries WHERE dataset_id = $1 AND library_id = $2)",
            )
            .bind(dataset_id)
            .bind(&outlet.library_id)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("checking parent library {}", outlet.library_id))?;
            if !parent_exists {
                report.orphan_outlets.push(natural);
                continue;
            }

            let result = sqlx::query(
                r#"
                INSERT INTO library_outlets (dataset_id, library_id, outlet_id, name, data_json)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (dataset_id, library_id, outlet_id) DO NOTHING
                "#,
            )
            .bind(dataset_id)
            .bind(&outlet.library_id)
            .bind(&outlet.outlet_id)
            .bind(outlet.name.as_deref())
            .bind(Json(outlet))
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!("inserting outlet {}/{}", outlet.library_id, outlet.outlet_id)
            })?;

            if result.rows_affected() == 0 {
                report.outlets_skipped.push(natural);
            } else {
                report.outlets_inserted += 1;
            }
        }

        tx.commit().await.context("committing load transaction")?;
        Ok(report)
    }

    async fn library_exists(&self, dataset_id: i64, library_id: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM libraries WHERE dataset_id = $1 AND library_id = $2)",
        )
        .bind(dataset_id)
        .bind(library_id)
        .fetch_one(&self.pool)
        .await
        .context("checking library existence")
    }

    async fn find_library(
        &self,
        dataset_id: i64,
        library_id: &str,
    ) -> Result<Option<LibraryRecord>> {
        let row: Option<Json<LibraryRecord>> = sqlx::query_scalar(
            "SELECT data_json FROM libraries WHERE dataset_id = $1 AND library_id = $2",
        )
        .bind(dataset_id)
        .bind(library_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading library {library_id}"))?;
        Ok(row.map(|Json(record)| record))
    }

    async fn count_libraries(&self, dataset_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM libraries WHERE dataset_id = $1")
            .bind(dataset_id)
            .fetch_one(&self.pool)
            .await
            .context("counting libraries")
    }

    async fn count_outlets(&self, dataset_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM library_outlets WHERE dataset_id = $1")
            .bind(dataset_id)
            .fetch_one(&self.pool)
            .await
            .context("counting outlets")
    }

    async fn load_library_config(&self) -> Result<Option<LibraryConfig>> {
        let row = sqlx::query("SELECT config_json, last_update_check FROM library_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("loading library config")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let Json(mut config): Json<LibraryConfig> = row.try_get("config_json")?;
        config.last_update_check = row.try_get("last_update_check")?;
        Ok(Some(config))
    }

    async fn save_library_config(&self, config: &LibraryConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO library_config (id, library_id, config_json, last_update_check, updated_at)
            VALUES (1, $1, $2, $3, now())
            ON CONFLICT (id) DO UPDATE
               SET library_id = EXCLUDED.library_id,
                   config_json = EXCLUDED.config_json,
                   last_update_check = COALESCE(EXCLUDED.last_update_check, library_config.last_update_check),
                   updated_at = now()
            "#,
        )
        .bind(&config.library_id)
        .bind(Json(config))
        .bind(config.last_update_check)
        .execute(&self.pool)
        .await
        .context("saving library config")?;
        Ok(())
    }

    async fn advance_checkpoint(&self, year: i32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE library_config
               SET last_update_check = $1, updated_at = now()
             WHERE id = 1
               AND (last_update_check IS NULL OR last_update_check < $1)
            "#,
        )
        .bind(year)
        .execute(&self.pool)
        .await
        .context("advancing library config checkpoint")?;
        Ok(result.rows_affected() > 0)
    }
}
