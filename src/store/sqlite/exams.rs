use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::connection::Database;
use crate::store::merge_record;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// `None` (with a warning) when the stored body is not JSON.
fn parse_body(id: &str, body: &str) -> Option<Value> {
    match serde_json::from_str(body) {
        Ok(value) => Some(value),
        Err(err) => {
            log_warn!("Stored body of exam {id} is not JSON, ignoring it: {err}");
            None
        }
    }
}

/// Rows whose body does not parse are skipped so one bad record never
/// hides the rest.
fn query_bodies(conn: &Connection, sql: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut bodies = Vec::new();
    while let Some(row) = rows.next()? {
        let id: String = row.get("id")?;
        let body: String = row.get("body")?;
        let Some(mut value) = parse_body(&id, &body) else {
            continue;
        };
        // The column is authoritative for the id; older bodies may lack it.
        if let Value::Object(fields) = &mut value {
            fields.entry("id").or_insert_with(|| Value::String(id));
        }
        bodies.push(value);
    }
    Ok(bodies)
}

impl Database {
    /// Merge `record` into the stored body inside one transaction.
    pub async fn upsert_exam_body(&self, exam_id: String, record: Value) -> Result<()> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT body FROM exams WHERE id = ?1",
                    params![exam_id],
                    |row| row.get(0),
                )
                .optional()?;
            // An unreadable body is replaced by the incoming record.
            let existing = existing.and_then(|body| parse_body(&exam_id, &body));

            let merged = merge_record(existing, record);
            let status = merged
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("ongoing")
                .to_string();

            tx.execute(
                "INSERT INTO exams (id, status, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     body = excluded.body,
                     updated_at = excluded.updated_at",
                params![
                    exam_id,
                    status,
                    serde_json::to_string(&merged)?,
                    Utc::now().to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to upsert exam {exam_id}"))?;
            tx.commit().context("failed to commit exam upsert")?;
            Ok(())
        })
        .await
    }

    pub async fn list_exam_bodies(&self) -> Result<Vec<Value>> {
        self.execute(|conn| {
            query_bodies(conn, "SELECT id, body FROM exams ORDER BY updated_at DESC")
        })
        .await
    }

    pub async fn delete_exam(&self, exam_id: String) -> Result<()> {
        self.execute(move |conn| {
            conn.execute("DELETE FROM exams WHERE id = ?1", params![exam_id])
                .with_context(|| format!("failed to delete exam {exam_id}"))?;
            Ok(())
        })
        .await
    }

    /// Changes whenever another connection commits to the database file.
    pub async fn data_version(&self) -> Result<i64> {
        self.execute(|conn| data_version(conn)).await
    }

    #[cfg(test)]
    pub(super) async fn insert_raw_body(&self, exam_id: &str, status: &str, body: &str) -> Result<()> {
        let (exam_id, status, body) = (exam_id.to_string(), status.to_string(), body.to_string());
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO exams (id, status, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![exam_id, status, body, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

/// Ongoing bodies plus the connection's `data_version`, read together so
/// the watcher knows which version a snapshot reflects.
pub(super) fn query_ongoing(conn: &Connection) -> Result<(i64, Vec<Value>)> {
    let version = data_version(conn)?;
    let bodies = query_bodies(
        conn,
        "SELECT id, body FROM exams WHERE status != 'completed' ORDER BY updated_at ASC",
    )?;
    Ok((version, bodies))
}

fn data_version(conn: &Connection) -> Result<i64> {
    conn.pragma_query_value(None, "data_version", |row| row.get(0))
        .context("failed to read data_version pragma")
}
