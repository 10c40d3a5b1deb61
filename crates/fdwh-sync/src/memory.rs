//! In-process warehouse used by `--dry-run` and the test-suite. Loads append
//! to named tables; merges reproduce the SQL statements' semantics: serial
//! surrogate keys, null natural keys skipped, `ON CONFLICT DO NOTHING` on the
//! natural key, and LEFT or INNER joins for the fact depending on the orphan
//! policy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fdwh_core::{Batch, Value};

use crate::merge::FACT_MEASURES;
use crate::{MergeStatement, OrphanPolicy, TableNames, Warehouse, WarehouseError};

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Batch>,
    sequences: HashMap<String, i64>,
    failing: HashSet<String>,
}

impl State {
    fn table(&self, name: &str) -> Batch {
        self.tables.get(name).cloned().unwrap_or_default()
    }

    fn next_key(&mut self, table: &str) -> i64 {
        let seq = self.sequences.entry(table.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn target(&mut self, name: &str, columns: &[&str]) -> Result<&mut Batch, WarehouseError> {
        if !self.tables.contains_key(name) {
            let empty = Batch::new(columns.iter().copied())?;
            self.tables.insert(name.to_string(), empty);
        }
        Ok(self.tables.entry(name.to_string()).or_default())
    }
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every load or merge touching `table` fail.
    pub fn failing_on(self, table: &str) -> Self {
        self.lock().failing.insert(table.to_string());
        self
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn table(&self, name: &str) -> Option<Batch> {
        self.lock().tables.get(name).cloned()
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.lock().tables.get(name).map(Batch::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn empty_text_as_null(value: &Value) -> Value {
    match value {
        Value::Text(s) if s.is_empty() => Value::Null,
        other => other.clone(),
    }
}

fn cell(batch: &Batch, row: usize, column: &str) -> Value {
    batch.value(row, column).cloned().unwrap_or(Value::Null)
}

/// Surrogate key of the dimension row whose `column` equals `key`. Nulls
/// never match, as in SQL.
fn lookup_key(dimension: &Batch, column: &str, key: &Value, sk_column: &str) -> Option<Value> {
    if key.is_null() {
        return None;
    }
    (0..dimension.len())
        .find(|&row| dimension.value(row, column) == Some(key))
        .map(|row| cell(dimension, row, sk_column))
}

fn insert_missing_dimension(
    state: &mut State,
    source: &str,
    target: &str,
    sk_column: &str,
    natural_key: &str,
    columns: &[&str],
) -> Result<u64, WarehouseError> {
    let source = state.table(source);
    let mut target_columns = vec![sk_column];
    target_columns.extend_from_slice(columns);

    let mut existing: HashSet<Value> = state
        .table(target)
        .column(natural_key)
        .unwrap_or_default()
        .into_iter()
        .cloned()
        .collect();

    let mut inserted = 0;
    for row in 0..source.len() {
        let key = cell(&source, row, natural_key);
        if key.is_null() || !existing.insert(key) {
            continue;
        }
        let sk = Value::Int(state.next_key(target));
        let mut values = vec![sk];
        values.extend(columns.iter().map(|c| cell(&source, row, c)));
        state.target(target, &target_columns)?.push_row(values)?;
        inserted += 1;
    }
    Ok(inserted)
}

fn insert_missing_facts(
    state: &mut State,
    tables: &TableNames,
    orphans: OrphanPolicy,
) -> Result<u64, WarehouseError> {
    let source = state.table(&tables.stg_fact);
    let battalions = state.table(&tables.dim_battalion);
    let districts = state.table(&tables.dim_district);

    let mut columns = vec!["incident_number", "id", "incident_date", "dim_battalion_sk", "dim_district_sk"];
    columns.extend_from_slice(FACT_MEASURES);
    columns.push("num_alarms");

    let mut existing: HashSet<Value> = state
        .table(&tables.fact)
        .column("id")
        .unwrap_or_default()
        .into_iter()
        .cloned()
        .collect();

    let mut inserted = 0;
    for row in 0..source.len() {
        let battalion_sk = lookup_key(&battalions, "battalion", &cell(&source, row, "battalion"), "dim_battalion_sk");
        let district_sk = lookup_key(
            &districts,
            "neighborhood_district",
            &cell(&source, row, "neighborhood_district"),
            "dim_district_sk",
        );
        if orphans == OrphanPolicy::Reject && (battalion_sk.is_none() || district_sk.is_none()) {
            continue;
        }

        let id = cell(&source, row, "id");
        if !id.is_null() && !existing.insert(id.clone()) {
            continue;
        }

        let mut values = vec![
            cell(&source, row, "incident_number"),
            id,
            cell(&source, row, "incident_date"),
            battalion_sk.unwrap_or(Value::Null),
            district_sk.unwrap_or(Value::Null),
        ];
        values.extend(FACT_MEASURES.iter().map(|m| cell(&source, row, m)));
        values.push(cell(&source, row, "number_of_alarms"));
        state.target(&tables.fact, &columns)?.push_row(values)?;
        inserted += 1;
    }
    Ok(inserted)
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn copy_into(&self, table: &str, batch: &Batch) -> Result<u64, WarehouseError> {
        let mut state = self.lock();
        if state.failing.contains(table) {
            return Err(WarehouseError::Load {
                table: table.to_string(),
                message: "injected failure".to_string(),
            });
        }
        let rows = batch.map_values(empty_text_as_null);
        state.tables.entry(table.to_string()).or_default().append_aligned(&rows);
        Ok(batch.len() as u64)
    }

    async fn execute_merge(
        &self,
        statement: MergeStatement,
        tables: &TableNames,
        orphans: OrphanPolicy,
    ) -> Result<u64, WarehouseError> {
        let mut state = self.lock();
        if state.failing.contains(statement.target(tables)) {
            return Err(WarehouseError::Merge {
                statement: statement.name(),
                message: "injected failure".to_string(),
            });
        }

        // work on a copy so a failed statement leaves no partial rows
        let mut scratch = State {
            tables: state.tables.clone(),
            sequences: state.sequences.clone(),
            failing: HashSet::new(),
        };
        let inserted = match statement {
            MergeStatement::DimBattalion => insert_missing_dimension(
                &mut scratch,
                &tables.stg_battalion,
                &tables.dim_battalion,
                "dim_battalion_sk",
                "battalion",
                &["battalion"],
            )?,
            MergeStatement::DimDistrict => insert_missing_dimension(
                &mut scratch,
                &tables.stg_district,
                &tables.dim_district,
                "dim_district_sk",
                "neighborhood_district",
                &["neighborhood_district", "city", "city_cleaned"],
            )?,
            MergeStatement::FactInjuries => insert_missing_facts(&mut scratch, tables, orphans)?,
        };

        state.tables = scratch.tables;
        state.sequences = scratch.sequences;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_rows(column: &str, values: &[&str]) -> Batch {
        Batch::from_rows([column], values.iter().map(|v| vec![Value::text(*v)]).collect()).unwrap()
    }

    #[tokio::test]
    async fn loads_append_and_failures_are_injected_per_table() {
        let warehouse = MemoryWarehouse::new().failing_on("raw_dim_district");
        let batch = text_rows("battalion", &["B01", ""]);

        assert_eq!(warehouse.copy_into("raw_dim_battalion", &batch).await.unwrap(), 2);
        warehouse.copy_into("raw_dim_battalion", &batch).await.unwrap();
        assert!(warehouse.copy_into("raw_dim_district", &batch).await.is_err());

        let loaded = warehouse.table("raw_dim_battalion").unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.value(1, "battalion"), Some(&Value::Null));
        assert_eq!(warehouse.row_count("raw_dim_district"), 0);
    }

    #[tokio::test]
    async fn dimension_merge_assigns_serial_keys_and_skips_conflicts() {
        let tables = TableNames::default();
        let warehouse = MemoryWarehouse::new();
        warehouse
            .copy_into(&tables.stg_battalion, &text_rows("battalion", &["B01", "", "B02", "B01"]))
            .await
            .unwrap();

        let inserted = warehouse
            .execute_merge(MergeStatement::DimBattalion, &tables, OrphanPolicy::Permit)
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let again = warehouse
            .execute_merge(MergeStatement::DimBattalion, &tables, OrphanPolicy::Permit)
            .await
            .unwrap();
        assert_eq!(again, 0);

        let dim = warehouse.table(&tables.dim_battalion).unwrap();
        assert_eq!(dim.columns(), ["dim_battalion_sk", "battalion"]);
        assert_eq!(dim.rows()[1], vec![Value::Int(2), Value::text("B02")]);
    }

    #[tokio::test]
    async fn failed_merge_leaves_target_untouched() {
        let tables = TableNames::default();
        let warehouse = MemoryWarehouse::new().failing_on(&tables.dim_battalion);
        warehouse
            .copy_into(&tables.stg_battalion, &text_rows("battalion", &["B01"]))
            .await
            .unwrap();
        let err = warehouse
            .execute_merge(MergeStatement::DimBattalion, &tables, OrphanPolicy::Permit)
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Merge { statement: "dim_battalion", .. }));
        assert!(warehouse.table(&tables.dim_battalion).is_none());
    }
}
