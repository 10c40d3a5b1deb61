//! Pipeline orchestration: extract discovery, raw and staging loads, gold
//! merges and the cron scheduler.

mod merge;
pub mod memory;
mod warehouse;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fdwh_core::{
    decode_csv, distinct_projection, stage_battalion, stage_district, stage_fact, validate_batch, Batch,
    BATTALION_KEY, DISTRICT_KEY, RAW_BATTALION, RAW_DISTRICT, RAW_FACT, STG_BATTALION, STG_DISTRICT, STG_FACT,
};
use fdwh_storage::{find_latest, sha256_hex, ObjectStore, StoreSettings};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use memory::MemoryWarehouse;
pub use merge::{MergeStatement, FACT_MEASURES};
pub use warehouse::{copy_statement, quote_ident, quote_qualified, PgWarehouse, Warehouse, WarehouseError};

pub const CRATE_NAME: &str = "fdwh-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub raw_battalion: String,
    pub raw_district: String,
    pub raw_fact: String,
    pub stg_battalion: String,
    pub stg_district: String,
    pub stg_fact: String,
    pub dim_battalion: String,
    pub dim_district: String,
    pub fact: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            raw_battalion: "raw_dim_battalion".to_string(),
            raw_district: "raw_dim_district".to_string(),
            raw_fact: "raw_fact_fire_department".to_string(),
            stg_battalion: "stg_dim_battalion".to_string(),
            stg_district: "stg_dim_district".to_string(),
            stg_fact: "stg_fact_fire_department_injuries".to_string(),
            dim_battalion: "dim_battalion".to_string(),
            dim_district: "dim_district".to_string(),
            fact: "fact_fire_department_injuries".to_string(),
        }
    }
}

impl TableNames {
    /// Each table name can be overridden by an `FD_<TABLE>_TABLE` variable,
    /// e.g. `FD_DIM_BATTALION_TABLE=warehouse.dim_battalion`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let pick = |key: &str, default: String| lookup(key).filter(|v| !v.is_empty()).unwrap_or(default);
        Self {
            raw_battalion: pick("FD_RAW_BATTALION_TABLE", defaults.raw_battalion),
            raw_district: pick("FD_RAW_DISTRICT_TABLE", defaults.raw_district),
            raw_fact: pick("FD_RAW_FACT_TABLE", defaults.raw_fact),
            stg_battalion: pick("FD_STG_BATTALION_TABLE", defaults.stg_battalion),
            stg_district: pick("FD_STG_DISTRICT_TABLE", defaults.stg_district),
            stg_fact: pick("FD_STG_FACT_TABLE", defaults.stg_fact),
            dim_battalion: pick("FD_DIM_BATTALION_TABLE", defaults.dim_battalion),
            dim_district: pick("FD_DIM_DISTRICT_TABLE", defaults.dim_district),
            fact: pick("FD_FACT_TABLE", defaults.fact),
        }
    }
}

/// What the fact merge does with staging rows whose battalion or district has
/// no gold dimension row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Insert with null surrogate keys.
    #[default]
    Permit,
    /// Leave the row in staging for a later run.
    Reject,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub url: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "mydatabase".to_string(),
            user: "myuser".to_string(),
            password: "mypassword".to_string(),
            url: None,
        }
    }
}

impl DatabaseSettings {
    pub fn database_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.name
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store: StoreSettings,
    pub database: DatabaseSettings,
    pub tables: TableNames,
    pub orphan_policy: OrphanPolicy,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            database: DatabaseSettings::default(),
            tables: TableNames::default(),
            orphan_policy: OrphanPolicy::default(),
            sync_cron_1: "0 6 * * *".to_string(),
            sync_cron_2: "0 18 * * *".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let db = defaults.database;
        Self {
            store: StoreSettings::from_env(),
            database: DatabaseSettings {
                host: std::env::var("FD_DB_HOST").unwrap_or(db.host),
                port: std::env::var("FD_DB_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(db.port),
                name: std::env::var("FD_DB_NAME").unwrap_or(db.name),
                user: std::env::var("FD_DB_USER").unwrap_or(db.user),
                password: std::env::var("FD_DB_PASSWORD").unwrap_or(db.password),
                url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            },
            tables: TableNames::from_env(),
            orphan_policy: match std::env::var("FD_REJECT_ORPHAN_FACTS") {
                Ok(v) if matches!(v.as_str(), "1" | "true" | "TRUE" | "True") => OrphanPolicy::Reject,
                _ => OrphanPolicy::Permit,
            },
            sync_cron_1: std::env::var("FD_SYNC_CRON_1").unwrap_or(defaults.sync_cron_1),
            sync_cron_2: std::env::var("FD_SYNC_CRON_2").unwrap_or(defaults.sync_cron_2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Raw,
    Staging,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded { rows: u64 },
    Failed { error: String },
}

impl UnitStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, UnitStatus::Failed { .. })
    }

    fn from_result(result: Result<u64, WarehouseError>) -> Self {
        match result {
            Ok(rows) => UnitStatus::Succeeded { rows },
            Err(err) => UnitStatus::Failed { error: err.to_string() },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableLoadOutcome {
    pub layer: Layer,
    pub table: String,
    pub outcome: UnitStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub statement: MergeStatement,
    pub table: String,
    pub outcome: UnitStatus,
}

/// Append each batch to its table. A failing table is logged and recorded;
/// the remaining tables are still attempted.
pub async fn load_tables(
    warehouse: &dyn Warehouse,
    layer: Layer,
    loads: &[(&str, &Batch)],
) -> Vec<TableLoadOutcome> {
    let mut outcomes = Vec::with_capacity(loads.len());
    for (table, batch) in loads {
        let result = warehouse.copy_into(table, batch).await;
        match &result {
            Ok(rows) => info!(?layer, table, rows, "table loaded"),
            Err(err) => warn!(?layer, table, error = %err, "table load failed"),
        }
        outcomes.push(TableLoadOutcome {
            layer,
            table: table.to_string(),
            outcome: UnitStatus::from_result(result),
        });
    }
    outcomes
}

/// Run every merge statement in order; a failing statement does not stop the
/// ones after it.
pub async fn run_merges(
    warehouse: &dyn Warehouse,
    tables: &TableNames,
    orphans: OrphanPolicy,
) -> Vec<MergeOutcome> {
    let mut outcomes = Vec::with_capacity(MergeStatement::ORDERED.len());
    for statement in MergeStatement::ORDERED {
        let result = warehouse.execute_merge(statement, tables, orphans).await;
        match &result {
            Ok(rows) => info!(statement = statement.name(), rows, "merge executed"),
            Err(err) => warn!(statement = statement.name(), error = %err, "merge failed"),
        }
        outcomes.push(MergeOutcome {
            statement,
            table: statement.target(tables).to_string(),
            outcome: UnitStatus::from_result(result),
        });
    }
    outcomes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    NoExtractFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerCounts {
    pub fact: usize,
    pub battalion: usize,
    pub district: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub extract_key: Option<String>,
    pub extract_sha256: Option<String>,
    pub raw: LayerCounts,
    pub staging: LayerCounts,
    pub loads: Vec<TableLoadOutcome>,
    pub merges: Vec<MergeOutcome>,
}

impl RunSummary {
    pub fn failed_units(&self) -> usize {
        self.loads.iter().filter(|l| l.outcome.is_failed()).count()
            + self.merges.iter().filter(|m| m.outcome.is_failed()).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub struct FireDepartmentPipeline {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
}

impl FireDepartmentPipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn ObjectStore>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            config,
            store,
            warehouse,
        }
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("pipeline_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let bucket = self.config.store.bucket.as_str();
        let tables = &self.config.tables;
        info!(bucket, "fire department job starting");

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            status: RunStatus::NoExtractFound,
            extract_key: None,
            extract_sha256: None,
            raw: LayerCounts::default(),
            staging: LayerCounts::default(),
            loads: Vec::new(),
            merges: Vec::new(),
        };

        let latest = find_latest(self.store.as_ref(), bucket)
            .await
            .with_context(|| format!("listing extracts in bucket {bucket}"))?;
        let Some(latest) = latest else {
            warn!(bucket, "no extract found; nothing to load");
            summary.finished_at = Utc::now();
            return Ok(summary);
        };
        info!(key = %latest.key, "current extract");

        let bytes = self
            .store
            .get(bucket, &latest.key)
            .await
            .with_context(|| format!("reading extract {}", latest.key))?;
        summary.extract_sha256 = Some(sha256_hex(&bytes));
        summary.extract_key = Some(latest.key.clone());

        let raw_fact = decode_csv(&bytes).with_context(|| format!("decoding extract {}", latest.key))?;
        validate_batch(&raw_fact, &RAW_FACT)?;
        let raw_battalion = distinct_projection(&raw_fact, BATTALION_KEY)?;
        let raw_district = distinct_projection(&raw_fact, DISTRICT_KEY)?;

        validate_batch(&raw_battalion, &RAW_BATTALION)?;
        validate_batch(&raw_district, &RAW_DISTRICT)?;
        summary.raw = LayerCounts {
            fact: raw_fact.len(),
            battalion: raw_battalion.len(),
            district: raw_district.len(),
        };

        let warehouse = self.warehouse.as_ref();
        summary.loads = load_tables(
            warehouse,
            Layer::Raw,
            &[
                (tables.raw_battalion.as_str(), &raw_battalion),
                (tables.raw_district.as_str(), &raw_district),
                (tables.raw_fact.as_str(), &raw_fact),
            ],
        )
        .await;

        let stg_battalion = stage_battalion(&raw_battalion)?;
        let stg_district = stage_district(&raw_district)?;
        let stg_fact = stage_fact(&raw_fact)?;

        validate_batch(&stg_battalion, &STG_BATTALION)?;
        validate_batch(&stg_district, &STG_DISTRICT)?;
        validate_batch(&stg_fact, &STG_FACT)?;
        summary.staging = LayerCounts {
            fact: stg_fact.len(),
            battalion: stg_battalion.len(),
            district: stg_district.len(),
        };

        let staged = load_tables(
            warehouse,
            Layer::Staging,
            &[
                (tables.stg_battalion.as_str(), &stg_battalion),
                (tables.stg_district.as_str(), &stg_district),
                (tables.stg_fact.as_str(), &stg_fact),
            ],
        )
        .await;
        summary.loads.extend(staged);

        summary.merges = run_merges(warehouse, tables, self.config.orphan_policy).await;
        summary.status = RunStatus::Completed;
        summary.finished_at = Utc::now();

        info!(
            key = %latest.key,
            raw_rows = summary.raw.fact,
            staged_rows = summary.staging.fact,
            failed_units = summary.failed_units(),
            "the job has finished"
        );
        Ok(summary)
    }
}

/// Build the pipeline from environment settings and run it once. With
/// `dry_run` the gold layer is an in-memory warehouse instead of Postgres.
pub async fn run_pipeline_from_env(dry_run: bool) -> Result<RunSummary> {
    let config = PipelineConfig::from_env();
    let store: Arc<dyn ObjectStore> = Arc::from(config.store.connect().await);
    let warehouse: Arc<dyn Warehouse> = if dry_run {
        Arc::new(MemoryWarehouse::new())
    } else {
        Arc::new(
            PgWarehouse::connect(&config.database.database_url())
                .await
                .context("connecting to postgres")?,
        )
    };

    FireDepartmentPipeline::new(config, store, warehouse)
        .run_once()
        .await
        .inspect_err(|err| error!(error = %format!("{err:#}"), "fire department job failed"))
        .context("fire department job failed")
}

/// Register a pipeline run on both cron expressions. Runs share a lock, so a
/// slow run delays the next tick instead of overlapping it.
pub async fn build_scheduler(config: &PipelineConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let guard = Arc::new(Mutex::new(()));

    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let guard = guard.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let guard = guard.clone();
            Box::pin(async move {
                let _running = guard.lock().await;
                match run_pipeline_from_env(false).await {
                    Ok(summary) => info!(run_id = %summary.run_id, status = ?summary.status, "scheduled run finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "scheduled pipeline run");
    }
    Ok(sched)
}
