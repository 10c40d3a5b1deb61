use serde::Serialize;

use crate::{Batch, CoreError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldType {
    Int,
    Float,
    Text,
    Timestamp,
}

impl FieldType {
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }

    /// Fill value for null cells of numeric fields during staging.
    pub fn zero(self) -> Option<Value> {
        match self {
            FieldType::Int => Some(Value::Int(0)),
            FieldType::Float => Some(Value::Float(0.0)),
            FieldType::Text | FieldType::Timestamp => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn field(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec { name, ty }
}

/// Named, ordered list of the columns a batch must carry before it is trusted
/// by the next layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldContract {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

impl FieldContract {
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.ty)
    }

    pub fn missing_columns(&self, batch: &Batch) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| !batch.has_column(f.name))
            .map(|f| f.name.to_string())
            .collect()
    }

    pub fn validate(&self, batch: &Batch) -> Result<(), CoreError> {
        let missing = self.missing_columns(batch);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::SchemaMismatch {
                contract: self.name.to_string(),
                missing,
            })
        }
    }
}

pub fn validate_batch<'a>(batch: &'a Batch, contract: &FieldContract) -> Result<&'a Batch, CoreError> {
    contract.validate(batch)?;
    Ok(batch)
}

use FieldType::{Float, Int, Text, Timestamp};

pub const RAW_FACT: FieldContract = FieldContract {
    name: "raw_fact",
    fields: &[
        field("incident_number", Int),
        field("id", Int),
        field("incident_date", Timestamp),
        field("battalion", Text),
        field("neighborhood_district", Text),
        field("city", Text),
        field("suppression_units", Int),
        field("suppression_personnel", Int),
        field("ems_units", Int),
        field("ems_personnel", Int),
        field("other_units", Int),
        field("other_personnel", Int),
        field("estimated_property_loss", Float),
        field("estimated_contents_loss", Float),
        field("fire_fatalities", Int),
        field("fire_injuries", Int),
        field("civilian_fatalities", Int),
        field("civilian_injuries", Int),
        field("number_of_alarms", Int),
    ],
};

pub const RAW_BATTALION: FieldContract = FieldContract {
    name: "raw_battalion",
    fields: &[field("battalion", Text)],
};

pub const RAW_DISTRICT: FieldContract = FieldContract {
    name: "raw_district",
    fields: &[field("neighborhood_district", Text), field("city", Text)],
};

pub const STG_FACT: FieldContract = FieldContract {
    name: "stg_fact",
    fields: &[
        field("incident_number", Int),
        field("id", Int),
        field("incident_date", Timestamp),
        field("battalion", Text),
        field("neighborhood_district", Text),
        field("suppression_units", Int),
        field("suppression_personnel", Int),
        field("ems_units", Int),
        field("ems_personnel", Int),
        field("other_units", Int),
        field("other_personnel", Int),
        field("estimated_property_loss", Float),
        field("estimated_contents_loss", Float),
        field("fire_fatalities", Int),
        field("fire_injuries", Int),
        field("civilian_fatalities", Int),
        field("civilian_injuries", Int),
        field("number_of_alarms", Int),
    ],
};

pub const STG_BATTALION: FieldContract = FieldContract {
    name: "stg_battalion",
    fields: &[field("battalion", Text)],
};

pub const STG_DISTRICT: FieldContract = FieldContract {
    name: "stg_district",
    fields: &[
        field("neighborhood_district", Text),
        field("city", Text),
        field("city_cleaned", Text),
    ],
};
