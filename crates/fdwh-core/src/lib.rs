//! Core tabular model, field contracts and staging transforms for the fire
//! department warehouse.

mod batch;
mod codec;
mod contract;
mod transform;

use thiserror::Error;

pub use batch::{Batch, Value};
pub use codec::{decode_csv, encode_csv, normalize_column_name, parse_timestamp, NULL_TOKENS};
pub use contract::{
    validate_batch, FieldContract, FieldSpec, FieldType, RAW_BATTALION, RAW_DISTRICT, RAW_FACT,
    STG_BATTALION, STG_DISTRICT, STG_FACT,
};
pub use transform::{
    clean_batch, clean_str, distinct_projection, first_letter_acronym, first_letter_acronym_value,
    stage_battalion, stage_district, stage_fact, BATTALION_KEY, DISTRICT_KEY,
};

pub const CRATE_NAME: &str = "fdwh-core";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema mismatch for `{contract}`: missing columns {missing:?}")]
    SchemaMismatch {
        contract: String,
        missing: Vec<String>,
    },
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
    #[error("row {row} has {actual} cells, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("column `{column}` has {actual} values, batch has {expected} rows")]
    ColumnLength {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, CoreError::SchemaMismatch { .. })
    }
}
