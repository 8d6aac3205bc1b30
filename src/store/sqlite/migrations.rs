use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Schema scripts in order; entry `n` brings `user_version` from `n` to `n + 1`.
const MIGRATIONS: &[&str] = &[include_str!("schemas/schema_v1.sql")];

fn schema_version(conn: &Connection) -> Result<usize> {
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;
    usize::try_from(version).with_context(|| format!("negative user_version {version}"))
}

/// Bring the exam database up to the newest schema. Every pending step runs
/// in one transaction, so a station never sees a half-migrated file.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;
    let target = MIGRATIONS.len();
    if current > target {
        bail!("exam database schema v{current} is newer than this build (v{target})");
    }
    if current == target {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    for (step, script) in MIGRATIONS.iter().enumerate().skip(current) {
        tx.execute_batch(script)
            .with_context(|| format!("migration to schema v{} failed", step + 1))?;
    }
    tx.pragma_update(None, "user_version", target as i64)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;
    log::info!("Exam database migrated from v{current} to v{target}");
    Ok(())
}
