use std::collections::HashSet;

use crate::{Batch, CoreError, Value, STG_FACT};

/// Natural key columns of the battalion dimension.
pub const BATTALION_KEY: &[&str] = &["battalion"];
/// Columns projected into the district dimension.
pub const DISTRICT_KEY: &[&str] = &["neighborhood_district", "city"];

/// Upper-case and trim string cells; every other cell passes through.
pub fn clean_str(value: &Value) -> Value {
    match value {
        Value::Text(s) => Value::Text(s.to_uppercase().trim().to_string()),
        other => other.clone(),
    }
}

/// Split on single spaces; words longer than two characters shrink to their
/// first character, shorter ones are kept whole.
pub fn first_letter_acronym(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            if word.chars().count() > 2 {
                word.chars().take(1).collect::<String>()
            } else {
                word.to_string()
            }
        })
        .collect()
}

pub fn first_letter_acronym_value(value: &Value) -> Value {
    match value {
        Value::Text(s) => Value::Text(first_letter_acronym(s)),
        other => other.clone(),
    }
}

pub fn clean_batch(batch: &Batch) -> Batch {
    batch.map_values(clean_str)
}

/// Project `fields` and drop repeated rows, keeping first occurrences in their
/// original order.
pub fn distinct_projection(batch: &Batch, fields: &[&str]) -> Result<Batch, CoreError> {
    let projected = batch.select("dimension projection", fields)?;
    Ok(dedup_rows(&projected))
}

fn dedup_rows(batch: &Batch) -> Batch {
    let mut seen = HashSet::with_capacity(batch.len());
    let keep: Vec<bool> = batch.rows().iter().map(|row| seen.insert(row)).collect();
    batch.filter_rows(&keep)
}

pub fn stage_battalion(raw_battalion: &Batch) -> Result<Batch, CoreError> {
    let cleaned = clean_batch(raw_battalion);
    distinct_projection(&cleaned, BATTALION_KEY)
}

pub fn stage_district(raw_district: &Batch) -> Result<Batch, CoreError> {
    let mut cleaned = distinct_projection(&clean_batch(raw_district), DISTRICT_KEY)?;
    let acronyms = cleaned
        .column("city")
        .unwrap_or_default()
        .into_iter()
        .map(first_letter_acronym_value)
        .collect();
    cleaned.set_column("city_cleaned", acronyms)?;
    Ok(cleaned)
}

/// Project the staging fact columns, zero-fill nulls in numeric fields and
/// replace the dimension natural keys with their cleaned form.
pub fn stage_fact(raw_fact: &Batch) -> Result<Batch, CoreError> {
    let names = STG_FACT.field_names();
    let projected = raw_fact.select(STG_FACT.name, &names)?;

    let zeros: Vec<Option<Value>> = projected
        .columns()
        .iter()
        .map(|c| STG_FACT.field_type(c).and_then(|ty| ty.zero()))
        .collect();

    let mut staged = Batch::new(projected.columns().iter().cloned())?;
    for row in projected.rows() {
        let filled = row
            .iter()
            .zip(&zeros)
            .map(|(value, zero)| match (value, zero) {
                (Value::Null, Some(zero)) => zero.clone(),
                (value, _) => value.clone(),
            })
            .collect();
        staged.push_row(filled)?;
    }

    for key in ["neighborhood_district", "battalion"] {
        let cleaned = raw_fact
            .column(key)
            .unwrap_or_default()
            .into_iter()
            .map(clean_str)
            .collect();
        staged.set_column(key, cleaned)?;
    }

    Ok(staged)
}
