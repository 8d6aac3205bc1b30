//! Repair of stored records written by older station versions.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};

use crate::{
    exam::{model, Exam},
    scheduler::Protocol,
};

const ENABLE_LOGS: bool = true;

#[allow(unused_imports)]
use crate::{log_debug, log_warn};

/// Fill in what older records lack and decode the result.
///
/// Records that are not objects, lack an id, or carry an unknown exam
/// type are rejected; the caller skips them.
pub fn repair(record: Value, now: DateTime<Utc>) -> Result<Exam> {
    let Value::Object(mut fields) = record else {
        bail!("record is not an object");
    };

    let id = match fields.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        _ => bail!("record has no id"),
    };

    for key in ["name", "dob", "operator", "observation"] {
        fill_string(&mut fields, key);
    }

    if !matches!(fields.get("paquimetria"), Some(Value::Object(_))) {
        fields.insert("paquimetria".into(), json!({"od": "", "oe": ""}));
    }
    if let Some(Value::Object(paquimetria)) = fields.get_mut("paquimetria") {
        fill_string(paquimetria, "od");
        fill_string(paquimetria, "oe");
    }

    repair_measures(&mut fields);

    let start = match fields.get("start").and_then(parse_timestamp) {
        Some(start) => start,
        None => {
            log_debug!("exam {id}: no usable start, using load time");
            now
        }
    };
    let mut end = fields.get("end").and_then(parse_timestamp);

    let status = match (fields.get("status").and_then(Value::as_str), end) {
        (Some("completed"), None) => {
            log_warn!("exam {id}: completed without end, using start as end");
            end = Some(start);
            "completed"
        }
        (Some("completed"), Some(_)) => "completed",
        (_, Some(_)) => {
            log_warn!("exam {id}: has an end but is not completed, treating as completed");
            "completed"
        }
        (_, None) => "ongoing",
    };

    fields.insert("status".into(), json!(status));
    fields.insert("start".into(), json!(start.to_rfc3339()));
    fields.insert("end".into(), json!(end.map(|end| end.to_rfc3339())));

    if !is_non_empty_string(fields.get("dateISO")) {
        fields.insert("dateISO".into(), json!(model::date_iso(start)));
    }
    if !is_non_empty_string(fields.get("dateDisplay")) {
        fields.insert("dateDisplay".into(), json!(model::date_display(start)));
    }

    let mut exam: Exam = serde_json::from_value(Value::Object(fields))
        .with_context(|| format!("exam {id} does not decode after repair"))?;

    // Extra measurements would leave the exam impossible to finalize.
    let required = Protocol::for_type(exam.exam_type).required_measures;
    if exam.measures.len() > required {
        log_warn!(
            "exam {id}: {} measurements stored, {} keeps only the first {required}",
            exam.measures.len(),
            exam.exam_type
        );
        exam.measures.truncate(required);
    }
    Ok(exam)
}

fn repair_measures(fields: &mut Map<String, Value>) {
    let measures = match fields.remove("measures") {
        Some(Value::Array(measures)) => measures,
        _ => Vec::new(),
    };

    let repaired = measures
        .into_iter()
        .filter_map(|measure| match measure {
            Value::Object(mut entry) => {
                for key in ["measure", "time", "date", "pioOD", "pioOE"] {
                    fill_string(&mut entry, key);
                }
                Some(Value::Object(entry))
            }
            _ => None,
        })
        .collect();

    fields.insert("measures".into(), Value::Array(repaired));
}

/// Missing and null become "", numbers become their decimal text.
fn fill_string(fields: &mut Map<String, Value>, key: &str) {
    let replacement = match fields.get(key) {
        Some(Value::String(_)) => return,
        Some(Value::Number(number)) => Value::String(number.to_string()),
        _ => Value::String(String::new()),
    };
    fields.insert(key.to_string(), replacement);
}

fn is_non_empty_string(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::String(text)) if !text.trim().is_empty())
}

/// Accepts RFC 3339 strings, epoch milliseconds, and `{seconds, nanoseconds}`
/// timestamp objects.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) if !text.trim().is_empty() => DateTime::parse_from_rfc3339(text.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::Object(parts) => {
            let seconds = parts
                .get("seconds")
                .or_else(|| parts.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = parts
                .get("nanoseconds")
                .or_else(|| parts.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .and_then(|nanos| u32::try_from(nanos).ok())
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, nanos).single()
        }
        _ => None,
    }
}

/// Repair a batch, logging and dropping the records that cannot be used.
pub fn repair_all(records: Vec<Value>, now: DateTime<Utc>) -> Vec<Exam> {
    records
        .into_iter()
        .filter_map(|record| match repair(record, now) {
            Ok(exam) => Some(exam),
            Err(err) => {
                log_warn!("skipping stored exam: {err:#}");
                None
            }
        })
        .collect()
}
