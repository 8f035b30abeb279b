//! Payload helpers over Arrow record batches
//!
//! The store only looks at the `time` column of a payload. It may be an
//! Arrow `Timestamp` of any unit and timezone, or `Int64` nanoseconds since
//! the Unix epoch; internally every instant is epoch nanoseconds in UTC.

use crate::daterange::{self, DateRange};
use crate::{Error, Result};

use arrow::compute::{cast, concat_batches, filter_record_batch, take};
use arrow_array::cast::AsArray;
use arrow_array::types::{Int64Type, TimestampNanosecondType};
use arrow_array::{Array, ArrayRef, BooleanArray, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name of the required time column.
pub const TIME_COLUMN: &str = "time";

/// Provenance column appended to retrieved data.
pub const SOURCE_COLUMN: &str = "source";

/// Which row survives when a payload repeats an instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    KeepFirst,
    KeepLast,
}

/// Non-fatal report of rows dropped or reordered while normalizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// Rows removed because their instant was already present
    pub duplicates_removed: usize,
    /// Rows that appeared before an earlier instant
    pub out_of_order: usize,
    pub policy: DuplicatePolicy,
}

/// Epoch nanoseconds of every row's `time` value.
pub fn time_nanos(batch: &RecordBatch) -> Result<Vec<i64>> {
    let column = batch.column_by_name(TIME_COLUMN).ok_or_else(|| {
        Error::InvalidPayload(format!("payload has no '{}' column", TIME_COLUMN))
    })?;

    let nanos: ArrayRef = match column.data_type() {
        DataType::Timestamp(TimeUnit::Nanosecond, _) | DataType::Int64 => Arc::clone(column),
        DataType::Timestamp(_, _) => {
            cast(column, &DataType::Timestamp(TimeUnit::Nanosecond, None))?
        }
        other => {
            return Err(Error::InvalidPayload(format!(
                "'{}' column must be a timestamp or Int64 nanoseconds, found {}",
                TIME_COLUMN, other
            )))
        }
    };

    // Casting sets overflowing values to null
    if nanos.null_count() > 0 {
        return Err(Error::InvalidPayload(format!(
            "'{}' column has {} null or out-of-range values",
            TIME_COLUMN,
            nanos.null_count()
        )));
    }

    Ok(match nanos.data_type() {
        DataType::Int64 => nanos.as_primitive::<Int64Type>().values().to_vec(),
        _ => nanos
            .as_primitive::<TimestampNanosecondType>()
            .values()
            .to_vec(),
    })
}

/// Reject rows falling outside `range`.
pub fn check_within(times: &[i64], range: &DateRange) -> Result<()> {
    let outside = times.iter().filter(|&&t| !range.contains_instant(t)).count();
    if outside > 0 {
        let first = times
            .iter()
            .find(|&&t| !range.contains_instant(t))
            .copied()
            .unwrap_or_default();
        return Err(Error::InvalidRange(format!(
            "{} rows fall outside the declared range {} (first at {})",
            outside,
            range,
            chrono::DateTime::from_timestamp_nanos(first).to_rfc3339()
        )));
    }
    Ok(())
}

/// Sort rows by time and drop repeated instants.
///
/// Returns the batch unchanged when its times are already strictly
/// increasing.
pub fn normalize(
    batch: &RecordBatch,
    policy: DuplicatePolicy,
) -> Result<(RecordBatch, Option<Discrepancy>)> {
    let times = time_nanos(batch)?;
    let flagged = daterange::split_on_duplicates(&times);
    if flagged.is_empty() {
        return Ok((batch.clone(), None));
    }

    let mut high_water = i64::MIN;
    let mut out_of_order = 0;
    for (i, &t) in times.iter().enumerate() {
        if i > 0 && t < high_water {
            out_of_order += 1;
        }
        high_water = high_water.max(t);
    }

    // Stable sort keeps upload order within equal instants
    let mut order: Vec<u32> = (0..times.len() as u32).collect();
    order.sort_by_key(|&i| times[i as usize]);

    let mut keep: Vec<u32> = Vec::with_capacity(order.len());
    for idx in order {
        match keep.last_mut() {
            Some(last) if times[*last as usize] == times[idx as usize] => {
                if policy == DuplicatePolicy::KeepLast {
                    *last = idx;
                }
            }
            _ => keep.push(idx),
        }
    }

    let discrepancy = Discrepancy {
        duplicates_removed: times.len() - keep.len(),
        out_of_order,
        policy,
    };
    Ok((take_rows(batch, &keep)?, Some(discrepancy)))
}

fn take_rows(batch: &RecordBatch, rows: &[u32]) -> Result<RecordBatch> {
    let indices = UInt32Array::from(rows.to_vec());
    let columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &indices, None))
        .collect::<std::result::Result<_, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), columns)?)
}

/// Rows whose time falls inside `range`.
pub fn filter_range(batch: &RecordBatch, range: &DateRange) -> Result<RecordBatch> {
    let times = time_nanos(batch)?;
    if times.iter().all(|&t| range.contains_instant(t)) {
        return Ok(batch.clone());
    }
    let mask = BooleanArray::from(
        times
            .iter()
            .map(|&t| range.contains_instant(t))
            .collect::<Vec<bool>>(),
    );
    Ok(filter_record_batch(batch, &mask)?)
}

/// Append (or replace) the provenance column with `source` on every row.
pub fn with_source(batch: &RecordBatch, source: &str) -> Result<RecordBatch> {
    let mut fields: Vec<Arc<Field>> = Vec::with_capacity(batch.num_columns() + 1);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns() + 1);
    for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
        if field.name() != SOURCE_COLUMN {
            fields.push(Arc::clone(field));
            columns.push(Arc::clone(column));
        }
    }
    fields.push(Arc::new(Field::new(SOURCE_COLUMN, DataType::Utf8, false)));
    columns.push(Arc::new(StringArray::from(vec![source; batch.num_rows()])));

    let schema = Schema::new_with_metadata(fields, batch.schema().metadata().clone());
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}

/// Concatenate batches that share a schema; `None` for no input.
pub fn concat(batches: &[RecordBatch]) -> Result<Option<RecordBatch>> {
    let Some(first) = batches.first() else {
        return Ok(None);
    };
    let schema = first.schema();
    if let Some(other) = batches.iter().find(|b| b.schema().fields() != schema.fields()) {
        return Err(Error::InvalidPayload(format!(
            "cannot combine payloads with different schemas: [{}] vs [{}]",
            describe(&schema),
            describe(&other.schema())
        )));
    }
    Ok(Some(concat_batches(&schema, batches)?))
}

fn describe(schema: &Schema) -> String {
    schema
        .fields()
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.data_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use arrow_array::{Float64Array, Int64Array, TimestampNanosecondArray, TimestampSecondArray};

    /// Batch with a nanosecond UTC `time` column and a `value` column.
    pub(crate) fn batch(times: &[i64], values: &[f64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                TIME_COLUMN,
                DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
                false,
            ),
            Field::new("value", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampNanosecondArray::from(times.to_vec()).with_timezone("UTC")),
                Arc::new(Float64Array::from(values.to_vec())),
            ],
        )
        .unwrap()
    }

    pub(crate) fn values(batch: &RecordBatch) -> Vec<f64> {
        batch
            .column_by_name("value")
            .unwrap()
            .as_primitive::<arrow_array::types::Float64Type>()
            .values()
            .to_vec()
    }

    #[test]
    fn test_time_column_units() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            TIME_COLUMN,
            DataType::Timestamp(TimeUnit::Second, None),
            false,
        )]));
        let seconds = RecordBatch::try_new(
            schema,
            vec![Arc::new(TimestampSecondArray::from(vec![1, 2]))],
        )
        .unwrap();
        assert_eq!(
            time_nanos(&seconds).unwrap(),
            vec![1_000_000_000, 2_000_000_000]
        );

        let schema = Arc::new(Schema::new(vec![Field::new(TIME_COLUMN, DataType::Int64, false)]));
        let raw = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![5, 6]))]).unwrap();
        assert_eq!(time_nanos(&raw).unwrap(), vec![5, 6]);
    }

    #[test]
    fn test_missing_or_wrong_time_column() {
        let schema = Arc::new(Schema::new(vec![Field::new("value", DataType::Float64, false)]));
        let no_time =
            RecordBatch::try_new(schema, vec![Arc::new(Float64Array::from(vec![1.0]))]).unwrap();
        assert!(matches!(time_nanos(&no_time), Err(Error::InvalidPayload(_))));

        let schema = Arc::new(Schema::new(vec![Field::new(TIME_COLUMN, DataType::Utf8, false)]));
        let text =
            RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec!["x"]))]).unwrap();
        assert!(matches!(time_nanos(&text), Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn test_normalize_clean_batch_is_untouched() {
        let input = batch(&[1, 2, 3], &[1.0, 2.0, 3.0]);
        let (out, discrepancy) = normalize(&input, DuplicatePolicy::KeepFirst).unwrap();
        assert!(discrepancy.is_none());
        assert_eq!(out, input);
    }

    #[test]
    fn test_normalize_keep_first_and_last() {
        let input = batch(&[3, 1, 2, 2, 1], &[30.0, 10.0, 20.0, 21.0, 11.0]);

        let (first, report) = normalize(&input, DuplicatePolicy::KeepFirst).unwrap();
        assert_eq!(time_nanos(&first).unwrap(), vec![1, 2, 3]);
        assert_eq!(values(&first), vec![10.0, 20.0, 30.0]);
        let report = report.unwrap();
        assert_eq!(report.duplicates_removed, 2);
        assert_eq!(report.out_of_order, 4);

        let (last, _) = normalize(&input, DuplicatePolicy::KeepLast).unwrap();
        assert_eq!(values(&last), vec![11.0, 21.0, 30.0]);
    }

    #[test]
    fn test_check_within_is_half_open() {
        let range = DateRange::from_nanos(0, 10).unwrap();
        assert!(check_within(&[0, 5, 9], &range).is_ok());
        assert!(matches!(
            check_within(&[0, 10], &range),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn test_filter_range_and_source() {
        let input = batch(&[0, 5, 10, 15], &[0.0, 5.0, 10.0, 15.0]);
        let window = DateRange::from_nanos(5, 15).unwrap();
        let filtered = filter_range(&input, &window).unwrap();
        assert_eq!(values(&filtered), vec![5.0, 10.0]);

        let tagged = with_source(&filtered, "abc").unwrap();
        let source = tagged.column_by_name(SOURCE_COLUMN).unwrap().as_string::<i32>();
        assert_eq!(source.value(0), "abc");
        assert_eq!(tagged.num_columns(), 3);

        // Re-tagging replaces rather than duplicates the column
        let retagged = with_source(&tagged, "def").unwrap();
        assert_eq!(retagged.num_columns(), 3);
    }

    #[test]
    fn test_concat_requires_matching_schemas() {
        let a = batch(&[1], &[1.0]);
        let b = batch(&[2], &[2.0]);
        assert_eq!(concat(&[a.clone(), b]).unwrap().unwrap().num_rows(), 2);
        assert!(concat(&[]).unwrap().is_none());

        let tagged = with_source(&a, "x").unwrap();
        assert!(matches!(
            concat(&[a, tagged]),
            Err(Error::InvalidPayload(_))
        ));
    }
}
