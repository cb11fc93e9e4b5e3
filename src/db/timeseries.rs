//! Long-to-wide reshaping for `time_series` queries.
//!
//! A long frame has a time column, string columns naming the series and value
//! columns. The wide frame has one row per distinct timestamp, ascending, and
//! one field per value column and series. The series' string values become the
//! labels of that field. Timestamps a series has no row for are null.

use crate::db::types::{FieldType, ScalarValue};
use crate::error::{DbError, DbResult};
use crate::models::{Field, Frame, FrameMeta};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

type Labels = BTreeMap<String, String>;

/// Reshape a long frame into a wide one.
///
/// Frames without string columns are already wide and are returned as is.
/// Fails when the frame has no time column or the time column holds nulls.
pub fn to_wide(frame: Frame) -> DbResult<Frame> {
    let time_idx = frame
        .fields
        .iter()
        .position(|f| f.field_type == FieldType::NullableTime)
        .ok_or_else(|| DbError::invalid_input("time_series format requires a time column"))?;

    let label_idx: Vec<usize> = frame
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.field_type == FieldType::NullableString)
        .map(|(idx, _)| idx)
        .collect();
    if label_idx.is_empty() {
        return Ok(frame);
    }

    let value_idx: Vec<usize> = (0..frame.fields.len())
        .filter(|idx| *idx != time_idx && !label_idx.contains(idx))
        .collect();

    let time_field = &frame.fields[time_idx];
    let times = time_field
        .values
        .iter()
        .map(|value| match value {
            ScalarValue::Time(t) => Ok(*t),
            _ => Err(DbError::invalid_input(format!(
                "time column '{}' must not contain nulls",
                time_field.name
            ))),
        })
        .collect::<DbResult<Vec<DateTime<Utc>>>>()?;

    let mut order: Vec<usize> = (0..times.len()).collect();
    order.sort_by_key(|&row| times[row]);

    let mut wide_times: Vec<DateTime<Utc>> = Vec::new();
    let mut series: Vec<Labels> = Vec::new();
    let mut series_ids: HashMap<Labels, usize> = HashMap::new();
    // (series, time slot) -> source row; a later row for the same slot wins.
    let mut cells: HashMap<(usize, usize), usize> = HashMap::new();

    for row in order {
        let time = times[row];
        if wide_times.last() != Some(&time) {
            wide_times.push(time);
        }
        let slot = wide_times.len() - 1;

        let labels: Labels = label_idx
            .iter()
            .map(|&idx| {
                let field = &frame.fields[idx];
                (field.name.clone(), label_value(&field.values[row]))
            })
            .collect();
        let next_id = series.len();
        let series_id = *series_ids.entry(labels.clone()).or_insert_with(|| {
            series.push(labels);
            next_id
        });

        cells.insert((series_id, slot), row);
    }

    let mut fields = Vec::with_capacity(1 + value_idx.len() * series.len());
    fields.push(Field {
        name: time_field.name.clone(),
        field_type: time_field.field_type,
        type_info: time_field.type_info.clone(),
        labels: Labels::new(),
        values: wide_times.iter().map(|t| ScalarValue::Time(*t)).collect(),
    });

    for &idx in &value_idx {
        let source = &frame.fields[idx];
        for (series_id, labels) in series.iter().enumerate() {
            let values = (0..wide_times.len())
                .map(|slot| {
                    cells
                        .get(&(series_id, slot))
                        .map(|&row| source.values[row].clone())
                        .unwrap_or(ScalarValue::Null)
                })
                .collect();
            fields.push(Field {
                name: source.name.clone(),
                field_type: source.field_type,
                type_info: source.type_info.clone(),
                labels: labels.clone(),
                values,
            });
        }
    }

    Ok(Frame {
        name: frame.name,
        fields,
        meta: FrameMeta {
            executed_query_string: frame.meta.executed_query_string,
            row_count: wide_times.len(),
        },
    })
}

fn label_value(value: &ScalarValue) -> String {
    match value {
        ScalarValue::String(s) => s.clone(),
        _ => String::new(),
    }
}
