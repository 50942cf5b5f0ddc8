use anyhow::{anyhow, Context, Result};
use chrono::DateTime;
use shared::domain::{
    Coordinate, RecordId, Score, SessionRecord, SketchArtifact, TargetArtifact, UserId,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Every connection to an in-memory url is its own database, so those pools
/// hold exactly one connection and never recycle it.
fn pool_options(database_url: &str) -> SqlitePoolOptions {
    if is_in_memory(database_url) {
        SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    }
}

/// Append-only store of completed session records, partitioned by user.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = pool_options(database_url)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open history database '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn append_session_record(&self, user_id: &UserId, record: &SessionRecord) -> Result<()> {
        let target_json =
            serde_json::to_string(&record.target).context("failed to encode target artifact")?;
        let sketch_json = record
            .sketch
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode sketch artifact")?;
        let duration_seconds = i64::try_from(record.duration_seconds)
            .context("session duration does not fit in storage")?;

        sqlx::query(
            "INSERT INTO session_records
                (id, user_id, coordinate, recorded_at_ms, target_json, sketch_json,
                 notes, score, feedback, duration_seconds)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.as_str())
        .bind(user_id.as_str())
        .bind(record.coordinate.as_str())
        .bind(record.timestamp.timestamp_millis())
        .bind(target_json)
        .bind(sketch_json)
        .bind(&record.notes)
        .bind(i64::from(record.score))
        .bind(&record.feedback)
        .bind(duration_seconds)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to append session record {}", record.id))?;
        Ok(())
    }

    pub async fn list_session_records(&self, user_id: &UserId) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query(
            "SELECT id, coordinate, recorded_at_ms, target_json, sketch_json,
                    notes, score, feedback, duration_seconds
             FROM session_records
             WHERE user_id = ?
             ORDER BY recorded_at_ms ASC, seq ASC",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list session records for user {user_id}"))?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn count_session_records(&self, user_id: &UserId) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM session_records WHERE user_id = ?")
                .bind(user_id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn list_user_ids(&self) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT DISTINCT user_id FROM session_records ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| UserId(row.get::<String, _>(0)))
            .collect())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<SessionRecord> {
    let id: String = row.try_get("id")?;
    let recorded_at_ms: i64 = row.try_get("recorded_at_ms")?;
    let timestamp = DateTime::from_timestamp_millis(recorded_at_ms)
        .ok_or_else(|| anyhow!("record {id} has invalid timestamp {recorded_at_ms}"))?;
    let target: TargetArtifact = serde_json::from_str(&row.try_get::<String, _>("target_json")?)
        .with_context(|| format!("record {id} has a malformed target artifact"))?;
    let sketch: Option<SketchArtifact> = row
        .try_get::<Option<String>, _>("sketch_json")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .with_context(|| format!("record {id} has a malformed sketch artifact"))?;
    let score = Score::new(row.try_get("score")?)?;
    let duration_seconds: i64 = row.try_get("duration_seconds")?;

    Ok(SessionRecord {
        id: RecordId(id),
        coordinate: Coordinate(row.try_get("coordinate")?),
        timestamp,
        target,
        sketch,
        notes: row.try_get("notes")?,
        score,
        feedback: row.try_get("feedback")?,
        duration_seconds: u64::try_from(duration_seconds).unwrap_or_default(),
    })
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
