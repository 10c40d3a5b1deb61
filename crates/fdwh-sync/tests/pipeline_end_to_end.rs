use std::sync::Arc;

use fdwh_core::Value;
use fdwh_storage::{LocalObjectStore, ObjectStore};
use fdwh_sync::{
    FireDepartmentPipeline, MemoryWarehouse, MergeStatement, OrphanPolicy, PipelineConfig, RunStatus, TableNames,
    Warehouse,
};
use tempfile::TempDir;

const HEADER: &str = "Incident Number,ID,Incident Date,Battalion,Neighborhood District,City,\
Suppression Units,Suppression Personnel,EMS Units,EMS Personnel,Other Units,Other Personnel,\
Estimated Property Loss,Estimated Contents Loss,Fire Fatalities,Fire Injuries,\
Civilian Fatalities,Civilian Injuries,Number of Alarms,Box";

fn extract(rows: &[&str]) -> Vec<u8> {
    let mut text = HEADER.to_string();
    for row in rows {
        text.push('\n');
        text.push_str(row);
    }
    text.push('\n');
    text.into_bytes()
}

fn fact_row(incident: i64, id: i64, battalion: &str, district: &str, city: &str) -> String {
    format!(
        "{incident},{id},2018-06-05 00:00:00,{battalion},{district},{city},2,9,,1,0,0,1500.5,,0,1,0,0,1,4312"
    )
}

struct Harness {
    _dir: TempDir,
    store: Arc<LocalObjectStore>,
    warehouse: Arc<MemoryWarehouse>,
    config: PipelineConfig,
}

impl Harness {
    fn new(warehouse: MemoryWarehouse) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        Self {
            _dir: dir,
            store,
            warehouse: Arc::new(warehouse),
            config: PipelineConfig::default(),
        }
    }

    async fn publish(&self, key: &str, rows: &[&str]) {
        self.store
            .put(&self.config.store.bucket, key, &extract(rows))
            .await
            .expect("put extract");
    }

    fn pipeline(&self) -> FireDepartmentPipeline {
        FireDepartmentPipeline::new(self.config.clone(), self.store.clone(), self.warehouse.clone())
    }

    fn tables(&self) -> &TableNames {
        &self.config.tables
    }
}

#[tokio::test]
async fn missing_extract_exits_cleanly() {
    let harness = Harness::new(MemoryWarehouse::new());
    let summary = harness.pipeline().run_once().await.expect("run");

    assert_eq!(summary.status, RunStatus::NoExtractFound);
    assert!(summary.extract_key.is_none());
    assert!(summary.loads.is_empty());
    assert!(summary.merges.is_empty());
}

#[tokio::test]
async fn battalion_codes_fold_into_one_gold_row() {
    let harness = Harness::new(MemoryWarehouse::new());
    let first = fact_row(1, 1, "b01 ", "Bernal Heights", "San Francisco");
    let second = fact_row(2, 2, "b01 ", "Bernal Heights", "San Francisco");
    harness.publish("fire_incidents_20240101_000000.csv", &[&first, &second]).await;

    let summary = harness.pipeline().run_once().await.expect("run");
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.failed_units(), 0);
    assert_eq!(summary.raw.fact, 2);
    assert_eq!(summary.raw.battalion, 1);
    assert_eq!(summary.extract_sha256.as_deref().map(str::len), Some(64));

    let tables = harness.tables();
    let raw = harness.warehouse.table(&tables.raw_battalion).expect("raw battalion");
    assert_eq!(raw.rows(), [vec![Value::text("b01 ")]]);
    let staged = harness.warehouse.table(&tables.stg_battalion).expect("stg battalion");
    assert_eq!(staged.rows(), [vec![Value::text("B01")]]);

    let dim = harness.warehouse.table(&tables.dim_battalion).expect("dim battalion");
    assert_eq!(dim.rows(), [vec![Value::Int(1), Value::text("B01")]]);

    let district = harness.warehouse.table(&tables.dim_district).expect("dim district");
    assert_eq!(district.value(0, "neighborhood_district"), Some(&Value::text("BERNAL HEIGHTS")));
    assert_eq!(district.value(0, "city_cleaned"), Some(&Value::text("SF")));

    let fact = harness.warehouse.table(&tables.fact).expect("fact");
    assert_eq!(fact.len(), 2);
    assert_eq!(fact.value(0, "dim_battalion_sk"), Some(&Value::Int(1)));
    assert_eq!(fact.value(0, "dim_district_sk"), Some(&Value::Int(1)));
    assert_eq!(fact.value(0, "num_alarms"), Some(&Value::Int(1)));
    assert_eq!(fact.value(0, "ems_units"), Some(&Value::Int(0)));
}

#[tokio::test]
async fn reruns_leave_gold_row_counts_unchanged() {
    let harness = Harness::new(MemoryWarehouse::new());
    let row = fact_row(50, 5, "B02", "Hayes Valley", "SF");
    harness.publish("fire_incidents_20240101_000000.csv", &[&row]).await;

    harness.pipeline().run_once().await.expect("first run");
    let summary = harness.pipeline().run_once().await.expect("second run");

    let tables = harness.tables();
    assert_eq!(harness.warehouse.row_count(&tables.fact), 1);
    assert_eq!(harness.warehouse.row_count(&tables.dim_battalion), 1);
    assert_eq!(harness.warehouse.row_count(&tables.dim_district), 1);
    // raw and staging layers are append-only
    assert_eq!(harness.warehouse.row_count(&tables.raw_fact), 2);

    let inserted: Vec<_> = summary
        .merges
        .iter()
        .map(|m| serde_json::to_value(&m.outcome).expect("json")["rows"].clone())
        .collect();
    assert_eq!(inserted, [0, 0, 0]);
}

#[tokio::test]
async fn reruns_with_blank_dimension_keys_add_no_gold_rows() {
    let harness = Harness::new(MemoryWarehouse::new());
    let row = fact_row(60, 6, "", "", "SF");
    harness.publish("fire_incidents_20240101_000000.csv", &[&row]).await;

    for _ in 0..3 {
        harness.pipeline().run_once().await.expect("run");
    }
    let tables = harness.tables();
    assert_eq!(harness.warehouse.row_count(&tables.stg_battalion), 3);
    assert_eq!(harness.warehouse.row_count(&tables.dim_battalion), 0);
    assert_eq!(harness.warehouse.row_count(&tables.dim_district), 0);
    assert_eq!(harness.warehouse.row_count(&tables.fact), 1);

    let fact = harness.warehouse.table(&tables.fact).expect("fact");
    assert_eq!(fact.value(0, "dim_battalion_sk"), Some(&Value::Null));
    assert_eq!(fact.value(0, "dim_district_sk"), Some(&Value::Null));

    let inserted = harness
        .warehouse
        .execute_merge(MergeStatement::DimBattalion, tables, OrphanPolicy::Permit)
        .await
        .expect("extra merge");
    assert_eq!(inserted, 0);
}

#[tokio::test]
async fn failing_table_is_isolated_from_the_rest_of_the_run() {
    let tables = TableNames::default();
    let harness = Harness::new(MemoryWarehouse::new().failing_on(&tables.raw_district));
    let row = fact_row(7, 70, "B03", "Outer Richmond", "SF");
    harness.publish("fire_incidents_20240101_000000.csv", &[&row]).await;

    let summary = harness.pipeline().run_once().await.expect("run");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.failed_units(), 1);
    let failed: Vec<_> = summary
        .loads
        .iter()
        .filter(|l| l.outcome.is_failed())
        .map(|l| l.table.as_str())
        .collect();
    assert_eq!(failed, ["raw_dim_district"]);
    assert_eq!(harness.warehouse.row_count(&tables.raw_fact), 1);
    assert_eq!(harness.warehouse.row_count(&tables.fact), 1);
}

#[tokio::test]
async fn latest_extract_wins_and_known_ids_are_not_reinserted() {
    let harness = Harness::new(MemoryWarehouse::new());
    let old = fact_row(1, 5, "B01", "Potrero Hill", "SF");
    harness.publish("fire_incidents_20240101_000000.csv", &[&old]).await;
    harness.pipeline().run_once().await.expect("first run");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let again = fact_row(1, 5, "B01", "Potrero Hill", "SF");
    let fresh = fact_row(2, 6, "B04", "Inner Sunset", "SF");
    harness.publish("fire_incidents_20240102_000000.csv", &[&again, &fresh]).await;
    let summary = harness.pipeline().run_once().await.expect("second run");

    assert_eq!(summary.extract_key.as_deref(), Some("fire_incidents_20240102_000000.csv"));
    let fact = harness.warehouse.table(&harness.tables().fact).expect("fact");
    let ids: Vec<_> = fact.column("id").expect("id column").into_iter().cloned().collect();
    assert_eq!(ids, [Value::Int(5), Value::Int(6)]);
}

#[tokio::test]
async fn rejected_orphans_wait_in_staging() {
    let tables = TableNames::default();
    let mut harness = Harness::new(MemoryWarehouse::new().failing_on(&tables.dim_district));
    harness.config.orphan_policy = OrphanPolicy::Reject;
    let row = fact_row(9, 90, "B05", "South of Market", "SF");
    harness.publish("fire_incidents_20240101_000000.csv", &[&row]).await;

    let summary = harness.pipeline().run_once().await.expect("run");
    let failed: Vec<_> = summary
        .merges
        .iter()
        .filter(|m| m.outcome.is_failed())
        .map(|m| m.statement)
        .collect();
    assert_eq!(failed, [MergeStatement::DimDistrict]);
    assert_eq!(harness.warehouse.row_count(&tables.fact), 0);
    assert_eq!(harness.warehouse.row_count(&tables.stg_fact), 1);

    harness.warehouse.clear_failures();
    let summary = harness.pipeline().run_once().await.expect("second run");
    assert_eq!(summary.failed_units(), 0);
    assert_eq!(harness.warehouse.row_count(&tables.fact), 1);
}

#[tokio::test]
async fn permitted_orphans_load_with_null_keys() {
    let tables = TableNames::default();
    let harness = Harness::new(MemoryWarehouse::new().failing_on(&tables.dim_district));
    let row = fact_row(9, 90, "B05", "South of Market", "SF");
    harness.publish("fire_incidents_20240101_000000.csv", &[&row]).await;

    harness.pipeline().run_once().await.expect("run");
    let fact = harness.warehouse.table(&tables.fact).expect("fact");
    assert_eq!(fact.value(0, "dim_battalion_sk"), Some(&Value::Int(1)));
    assert_eq!(fact.value(0, "dim_district_sk"), Some(&Value::Null));
}

#[tokio::test]
async fn extract_missing_contract_columns_fails_the_run() {
    let harness = Harness::new(MemoryWarehouse::new());
    harness
        .store
        .put(&harness.config.store.bucket, "broken.csv", b"ID,Battalion\n1,B01\n")
        .await
        .expect("put");

    let err = harness.pipeline().run_once().await.expect_err("schema mismatch");
    assert!(format!("{err:#}").contains("schema mismatch"));
    assert_eq!(harness.warehouse.row_count(&harness.tables().raw_fact), 0);
}
