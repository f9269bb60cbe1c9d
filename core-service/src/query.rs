//! Answering list queries from the cache.

use core_sync::CacheEntry;
use provider_records::{ListQuery, Record, SortDirection};
use serde_json::Value;
use std::cmp::Ordering;
use tracing::warn;

/// Apply `query` to a cached snapshot.
///
/// Sort, projection and `max_records` are honored. Filter formulas need the
/// server and are ignored; continuation offsets do not apply to the cache.
pub(crate) fn apply_locally(entry: Option<&CacheEntry>, query: &ListQuery) -> Vec<Record> {
    let Some(entry) = entry else {
        return Vec::new();
    };
    if let Some(formula) = &query.filter_formula {
        warn!(table = %entry.table, formula = %formula, "Filter ignored for cached read");
    }

    let mut records = entry.sorted_records();

    if !query.sort.is_empty() {
        records.sort_by(|a, b| {
            for spec in &query.sort {
                let ordering = compare_values(a.fields.get(&spec.field), b.fields.get(&spec.field));
                let ordering = match spec.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    if let Some(max) = query.max_records {
        records.truncate(max as usize);
    }

    if !query.fields.is_empty() {
        for record in &mut records {
            record.fields.retain(|name, _| query.fields.contains(name));
        }
    }

    records
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Missing and null values sort first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
