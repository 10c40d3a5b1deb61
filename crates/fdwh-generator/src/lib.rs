//! Synthetic extract generator: watermarks, mock incident rows and the
//! duplicate detector that keeps generated keys unique.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use fdwh_core::{decode_csv, encode_csv, Batch, CoreError, Value};
use fdwh_storage::{find_latest, ObjectStore, StoreError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "fdwh-generator";

/// Fields whose values must never repeat across generated rows.
pub const DEFAULT_UNIQUE_FIELDS: &[&str] = &["incident_number", "id", "call_number"];

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("repeated values found in one of the unique fields: {0:?}")]
    DuplicateDetectionFailure(Vec<RepeatedValue>),
    #[error("unique field {field} holds a non-integer value: {value:?}")]
    NonIntegerKey { field: String, value: Value },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatedValue {
    pub field: String,
    pub value: Value,
    pub count: usize,
}

/// Highest value already persisted per unique field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Watermarks {
    values: BTreeMap<String, i64>,
}

impl Watermarks {
    pub fn zero<S: AsRef<str>>(fields: &[S]) -> Self {
        Self {
            values: fields.iter().map(|f| (f.as_ref().to_string(), 0)).collect(),
        }
    }

    /// Maximum integer value of each field; empty or all-null columns yield 0.
    /// Integral floats such as `100.0` count as integers; any other non-null
    /// cell is rejected.
    pub fn from_batch<S: AsRef<str>>(batch: &Batch, fields: &[S]) -> Result<Self, GeneratorError> {
        let names: Vec<&str> = fields.iter().map(AsRef::as_ref).collect();
        let projected = batch.select("unique fields", &names)?;
        let mut values = BTreeMap::new();
        for name in names {
            let mut max = 0;
            for value in projected.column(name).unwrap_or_default() {
                let current = match value {
                    Value::Null => continue,
                    Value::Int(v) => *v,
                    Value::Float(f) if f.is_finite() && f.fract() == 0.0 => *f as i64,
                    other => {
                        return Err(GeneratorError::NonIntegerKey {
                            field: name.to_string(),
                            value: other.clone(),
                        })
                    }
                };
                max = max.max(current);
            }
            values.insert(name.to_string(), max);
        }
        Ok(Self { values })
    }

    pub fn with(mut self, field: &str, value: i64) -> Self {
        self.values.insert(field.to_string(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<i64> {
        self.values.get(field).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

fn above_watermark(value: &Value, watermark: i64) -> bool {
    matches!(value, Value::Int(v) if *v > watermark)
}

fn value_counts<'a>(column: &[&'a Value]) -> HashMap<&'a Value, usize> {
    let mut counts = HashMap::with_capacity(column.len());
    for value in column {
        *counts.entry(*value).or_insert(0) += 1;
    }
    counts
}

#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    fields: Vec<String>,
}

impl DuplicateDetector {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn project(&self, batch: &Batch) -> Result<Batch, CoreError> {
        let names: Vec<&str> = self.fields.iter().map(String::as_str).collect();
        batch.select("unique fields", &names)
    }

    /// Values occurring more than once, per field, most frequent first.
    pub fn find_repeated_values(&self, batch: &Batch) -> Result<Vec<RepeatedValue>, CoreError> {
        let projected = self.project(batch)?;
        let mut repeated = Vec::new();
        for field in &self.fields {
            let column = projected.column(field).unwrap_or_default();
            let mut field_repeats: Vec<RepeatedValue> = value_counts(&column)
                .into_iter()
                .filter(|(_, count)| *count > 1)
                .map(|(value, count)| RepeatedValue {
                    field: field.clone(),
                    value: value.clone(),
                    count,
                })
                .collect();
            field_repeats.sort_by(|a, b| b.count.cmp(&a.count));
            repeated.extend(field_repeats);
        }
        Ok(repeated)
    }

    /// Drop every row whose value repeats in any unique field, plus rows at or
    /// below the watermark of a watermarked field.
    pub fn remove_duplicates(&self, batch: &Batch, watermarks: &Watermarks) -> Result<Batch, CoreError> {
        let projected = self.project(batch)?;
        let mut keep = vec![true; batch.len()];

        for field in &self.fields {
            let column = projected.column(field).unwrap_or_default();
            let counts = value_counts(&column);
            let watermark = watermarks.get(field);
            for (row, value) in column.iter().enumerate() {
                let repeated = counts.get(value).copied().unwrap_or(0) > 1;
                let stale = watermark.is_some_and(|wm| !above_watermark(value, wm));
                if repeated || stale {
                    keep[row] = false;
                }
            }
        }

        Ok(batch.filter_rows(&keep))
    }

    pub fn verify(&self, batch: &Batch) -> Result<(), GeneratorError> {
        let repeated = self.find_repeated_values(batch)?;
        if repeated.is_empty() {
            Ok(())
        } else {
            Err(GeneratorError::DuplicateDetectionFailure(repeated))
        }
    }

    /// Filter, then re-check the survivors; a residual repeat is fatal.
    pub fn clean(&self, batch: &Batch, watermarks: &Watermarks) -> Result<Batch, GeneratorError> {
        let cleaned = self.remove_duplicates(batch, watermarks)?;
        self.verify(&cleaned)?;
        Ok(cleaned)
    }
}

/// Producer of candidate incident rows whose unique fields lie above the
/// given watermarks.
pub trait RowSource: Send {
    fn generate(&mut self, count: usize, watermarks: &Watermarks) -> Result<Batch, CoreError>;
}

pub const MOCK_COLUMNS: &[&str] = &[
    "incident_number",
    "exposure_number",
    "id",
    "address",
    "incident_date",
    "call_number",
    "alarm_dttm",
    "arrival_dttm",
    "close_dttm",
    "city",
    "zipcode",
    "battalion",
    "station_area",
    "box",
    "suppression_units",
    "suppression_personnel",
    "ems_units",
    "ems_personnel",
    "other_units",
    "other_personnel",
    "first_unit_on_scene",
    "estimated_property_loss",
    "estimated_contents_loss",
    "fire_fatalities",
    "fire_injuries",
    "civilian_fatalities",
    "civilian_injuries",
    "number_of_alarms",
    "primary_situation",
    "action_taken_primary",
    "property_use",
    "supervisor_district",
    "neighborhood_district",
    "point",
];

const BATTALIONS: &[&str] = &["B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B09", "B10"];
const DISTRICTS: &[&str] = &[
    "Financial District/South Beach",
    "Outer Richmond",
    "Hayes Valley",
    "South of Market",
    "Potrero Hill",
    "Bernal Heights",
    "Inner Sunset",
];
const FIRST_UNITS: &[&str] = &["E01", "E02", "T01", "B01", "MED01"];
const SITUATIONS: &[&str] = &[
    "412 - Gas leak (natural gas or LPG)",
    "552 - Police matter",
    "210 - Steam Rupture, steam, other",
    "522 - Water or steam leak",
    "520 - Water problem, other",
    "733 - Smoke detector activation/malfunction",
    "711 - Municipal alarm system, Street Box False",
];
const ACTIONS: &[&str] = &[
    "86 - Investigate",
    "71 - Extinguish",
    "45 - Rescue, remove from harm",
    "32 - Provide first aid & check for injuries",
    "22 - Search & rescue, other",
    "94 - Disregard",
    "12 - Fire control or extinguishment, other",
];
const PROPERTY_USES: &[&str] = &[
    "962 - Residential street, road or residential dr",
    "960 - Street, other",
    "429 - Multifamily dwellings",
    "400 - Residential, other",
];
const STREETS: &[&str] = &["Mission St", "Valencia St", "Geary Blvd", "Irving St", "Folsom St", "Hayes St"];
const STATION_WORDS: &[&str] = &["north", "harbor", "summit", "ridge", "delta", "union"];

/// Seeded mock producer of San Francisco style incident rows.
#[derive(Debug)]
pub struct MockIncidentSource {
    rng: StdRng,
}

impl MockIncidentSource {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    fn pick(&mut self, items: &[&str]) -> Value {
        Value::text(*items.choose(&mut self.rng).unwrap_or(&""))
    }

    fn unique_value(&mut self, watermarks: &Watermarks, field: &str, span: i64) -> Value {
        let base = watermarks.get(field).unwrap_or(0);
        Value::Int(base + self.rng.gen_range(1..=span))
    }

    fn row(&mut self, span: i64, watermarks: &Watermarks, decade_start: DateTime<Utc>, now: DateTime<Utc>) -> Vec<Value> {
        let window = (now - decade_start).num_seconds().max(1);
        let incident = decade_start + Duration::seconds(self.rng.gen_range(0..window));
        let alarm = incident + Duration::seconds(self.rng.gen_range(0..600));
        let arrival = alarm + Duration::seconds(self.rng.gen_range(60..1200));
        let close = arrival + Duration::seconds(self.rng.gen_range(600..7200));
        let street_no: u32 = self.rng.gen_range(1..4000);
        let street = self.pick(STREETS);
        let lon: f64 = self.rng.gen_range(-180.0..180.0);
        let lat: f64 = self.rng.gen_range(-90.0..90.0);

        vec![
            self.unique_value(watermarks, "incident_number", span),
            Value::Int(self.rng.gen_range(0..=1)),
            self.unique_value(watermarks, "id", span),
            Value::text(format!("{street_no} {street}")),
            Value::Timestamp(incident.naive_utc()),
            self.unique_value(watermarks, "call_number", span),
            Value::Timestamp(alarm.naive_utc()),
            Value::Timestamp(arrival.naive_utc()),
            Value::Timestamp(close.naive_utc()),
            Value::text("SF"),
            Value::text(format!("941{:02}", self.rng.gen_range(0..35))),
            self.pick(BATTALIONS),
            self.pick(STATION_WORDS),
            self.pick(STATION_WORDS),
            Value::Int(self.rng.gen_range(1..=10)),
            Value::Int(self.rng.gen_range(1..=50)),
            Value::Int(self.rng.gen_range(0..=5)),
            Value::Int(self.rng.gen_range(0..=20)),
            Value::Int(self.rng.gen_range(0..=5)),
            Value::Int(self.rng.gen_range(0..=20)),
            self.pick(FIRST_UNITS),
            Value::Float(self.rng.gen_range(0.0..50_000.0)),
            Value::Float(self.rng.gen_range(0.0..50_000.0)),
            Value::Int(self.rng.gen_range(0..=2)),
            Value::Int(self.rng.gen_range(0..=5)),
            Value::Int(self.rng.gen_range(0..=2)),
            Value::Int(self.rng.gen_range(0..=5)),
            Value::Int(1),
            self.pick(SITUATIONS),
            self.pick(ACTIONS),
            self.pick(PROPERTY_USES),
            Value::Int(self.rng.gen_range(1..=11)),
            self.pick(DISTRICTS),
            Value::text(format!("POINT ({lon:.6} {lat:.6})")),
        ]
    }
}

impl RowSource for MockIncidentSource {
    fn generate(&mut self, count: usize, watermarks: &Watermarks) -> Result<Batch, CoreError> {
        let now = Utc::now();
        let decade = now.year() - now.year().rem_euclid(10);
        let decade_start = NaiveDate::from_ymd_opt(decade, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .unwrap_or(now);
        let span = count.max(1) as i64;

        let mut batch = Batch::new(MOCK_COLUMNS.iter().copied())?;
        for _ in 0..count {
            let row = self.row(span, watermarks, decade_start, now);
            batch.push_row(row)?;
        }
        Ok(batch)
    }
}

/// Name for the next extract: the first two `_`-separated parts of the latest
/// key plus a timestamp, or `combined_data_<timestamp>.csv`.
pub fn next_extract_key(latest: Option<&str>, now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%d_%H%M%S");
    let mut parts = latest.map(|k| k.splitn(3, '_')).into_iter().flatten();
    match (parts.next(), parts.next()) {
        (Some(base), Some(second)) => format!("{base}_{second}_{stamp}.csv"),
        _ => format!("combined_data_{stamp}.csv"),
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub bucket: String,
    pub unique_fields: Vec<String>,
    pub num_new_rows: usize,
}

impl GeneratorConfig {
    pub fn from_env(bucket: String) -> Self {
        Self {
            bucket,
            unique_fields: std::env::var("FD_UNIQUE_FIELDS")
                .ok()
                .map(|v| v.split(',').map(|f| f.trim().to_string()).filter(|f| !f.is_empty()).collect())
                .unwrap_or_else(|| DEFAULT_UNIQUE_FIELDS.iter().map(|f| f.to_string()).collect()),
            num_new_rows: std::env::var("FD_GENERATOR_ROWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratorSummary {
    pub previous_key: Option<String>,
    pub new_key: String,
    pub existing_rows: usize,
    pub generated_rows: usize,
    pub new_rows: usize,
    pub total_rows: usize,
    pub watermarks: Watermarks,
}

pub struct ExtractGenerator<S: RowSource> {
    config: GeneratorConfig,
    detector: DuplicateDetector,
    source: S,
}

impl<S: RowSource> ExtractGenerator<S> {
    pub fn new(config: GeneratorConfig, source: S) -> Self {
        let detector = DuplicateDetector::new(config.unique_fields.clone());
        Self {
            config,
            detector,
            source,
        }
    }

    /// Append a deduplicated batch of synthetic rows to the latest extract and
    /// write the result as a new object.
    pub async fn run_once(&mut self, store: &dyn ObjectStore) -> Result<GeneratorSummary, GeneratorError> {
        let bucket = self.config.bucket.as_str();
        let latest = find_latest(store, bucket).await?;

        let (existing, watermarks) = match &latest {
            Some(object) => {
                let bytes = store.get(bucket, &object.key).await?;
                let existing = decode_csv(&bytes)?;
                let watermarks = Watermarks::from_batch(&existing, &self.config.unique_fields)?;
                (existing, watermarks)
            }
            None => {
                warn!(bucket, "no extract found; bootstrapping a new one");
                (Batch::default(), Watermarks::zero(&self.config.unique_fields))
            }
        };
        info!(?watermarks, existing_rows = existing.len(), "watermarks extracted");

        let candidates = self.source.generate(self.config.num_new_rows, &watermarks)?;
        let fresh = self.detector.clean(&candidates, &watermarks)?;

        let existing_rows = existing.len();
        let mut combined = existing;
        combined.append_aligned(&fresh);

        let new_key = next_extract_key(latest.as_ref().map(|o| o.key.as_str()), Utc::now());
        store.put(bucket, &new_key, &encode_csv(&combined)?).await?;

        info!(
            key = %new_key,
            total_rows = combined.len(),
            new_rows = fresh.len(),
            "uploaded extract"
        );

        Ok(GeneratorSummary {
            previous_key: latest.map(|o| o.key),
            new_key,
            existing_rows,
            generated_rows: candidates.len(),
            new_rows: fresh.len(),
            total_rows: combined.len(),
            watermarks,
        })
    }
}
