use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, WriterBuilder};

use crate::{Batch, CoreError, Value};

/// Cell texts read as null, after trimming.
pub const NULL_TOKENS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "NULL", "null", "None"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %I:%M:%S %p",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

pub fn normalize_column_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_float(text: &str) -> Option<f64> {
    // keep "inf"/"nan"-like words out of numeric columns
    if text
        .chars()
        .any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
    {
        return None;
    }
    text.parse().ok()
}

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// Decode a CSV extract with a header row. Header names are normalized and
/// each column's cell type is inferred from its non-null cells.
pub fn decode_csv(bytes: &[u8]) -> Result<Batch, CoreError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(normalize_column_name)
        .collect();

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record?;
        for (idx, field) in record.iter().enumerate() {
            let cell = if NULL_TOKENS.contains(&field.trim()) {
                None
            } else {
                Some(field.to_string())
            };
            cells[idx].push(cell);
        }
    }

    let row_count = cells.first().map(Vec::len).unwrap_or(0);
    let columns: Vec<Vec<Value>> = cells.into_iter().map(infer_column).collect();

    let mut batch = Batch::new(headers)?;
    for row_idx in 0..row_count {
        batch.push_row(columns.iter().map(|col| col[row_idx].clone()).collect())?;
    }
    Ok(batch)
}

fn infer_column(cells: Vec<Option<String>>) -> Vec<Value> {
    let present = || cells.iter().flatten().map(|s| s.trim());

    if present().all(|s| s.parse::<i64>().is_ok()) {
        return cells
            .iter()
            .map(|c| c.as_deref().and_then(|s| s.trim().parse().ok()).map(Value::Int).into())
            .collect();
    }
    if present().all(|s| parse_float(s).is_some()) {
        return cells
            .iter()
            .map(|c| c.as_deref().and_then(|s| parse_float(s.trim())).map(Value::Float).into())
            .collect();
    }
    if present().all(|s| parse_timestamp(s).is_some()) {
        return cells
            .iter()
            .map(|c| c.as_deref().and_then(parse_timestamp).map(Value::Timestamp).into())
            .collect();
    }
    cells
        .into_iter()
        .map(|c| c.map(Value::Text).into())
        .collect()
}

/// Encode a batch as CSV with a header row. Nulls become empty unquoted fields,
/// which `COPY ... (FORMAT csv)` reads back as NULL.
pub fn encode_csv(batch: &Batch) -> Result<Vec<u8>, CoreError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(batch.columns())?;
    for row in batch.rows() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.into_inner().map_err(|err| CoreError::Io(err.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_normalized() {
        assert_eq!(normalize_column_name(" Incident Number"), "incident_number");
        assert_eq!(normalize_column_name("Neighborhood  District"), "neighborhood__district");
    }

    #[test]
    fn leading_byte_order_mark_is_dropped() {
        let batch = decode_csv(b"\xef\xbb\xbfIncident Number,ID\n1001,5\n").unwrap();
        assert_eq!(batch.columns(), ["incident_number", "id"]);
        assert_eq!(batch.value(0, "incident_number"), Some(&Value::Int(1001)));
    }

    #[test]
    fn decode_infers_column_types_and_nulls() {
        let csv = "Incident Number,ID,Incident Date,Battalion,Estimated Property Loss\n\
                   1001,5,2018/06/05 12:00:00 AM,b01 ,\n\
                   1002,6,2018/06/06 01:30:00 PM,B02,250.5\n";
        let batch = decode_csv(csv.as_bytes()).unwrap();

        assert_eq!(
            batch.columns(),
            ["incident_number", "id", "incident_date", "battalion", "estimated_property_loss"]
        );
        assert_eq!(batch.value(0, "id"), Some(&Value::Int(5)));
        assert_eq!(batch.value(0, "battalion"), Some(&Value::text("b01 ")));
        assert_eq!(batch.value(0, "estimated_property_loss"), Some(&Value::Null));
        assert_eq!(batch.value(1, "estimated_property_loss"), Some(&Value::Float(250.5)));
        let expected = NaiveDate::from_ymd_opt(2018, 6, 6)
            .unwrap()
            .and_hms_opt(13, 30, 0)
            .unwrap();
        assert_eq!(batch.value(1, "incident_date"), Some(&Value::Timestamp(expected)));
    }

    #[test]
    fn mixed_column_falls_back_to_text() {
        let batch = decode_csv(b"box\n12\nA7\n").unwrap();
        assert_eq!(batch.column("box").unwrap(), [&Value::text("12"), &Value::text("A7")]);
    }

    #[test]
    fn header_only_extract_decodes_to_empty_batch() {
        let batch = decode_csv(b"id,battalion\n").unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.columns(), ["id", "battalion"]);
    }

    #[test]
    fn encode_writes_nulls_as_empty_fields() {
        let batch = Batch::from_rows(
            ["id", "battalion", "city"],
            vec![vec![Value::Int(5), Value::text("B01, north"), Value::Null]],
        )
        .unwrap();
        let text = String::from_utf8(encode_csv(&batch).unwrap()).unwrap();
        assert_eq!(text, "id,battalion,city\n5,\"B01, north\",\n");
    }
}
