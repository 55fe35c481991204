#![forbid(unsafe_code)]

//! Persistence layer for finished analysis runs.
//!
//! Each run is appended as one row in the `analyses` table, keyed by the
//! store's own rowid. The comment list and the aggregate results are kept as
//! JSON side-columns, mirroring how they travel over the API. Rows are never
//! updated or deleted.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisResult, ClassifiedComment};

/// The persisted unit: one analysis run for one video.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub videoid: String,
    pub analyzed_at: DateTime<Utc>,
    pub comments: Vec<ClassifiedComment>,
    pub results: AnalysisResult,
}

/// Listing row without the full comment payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub id: i64,
    pub videoid: String,
    pub analyzed_at: DateTime<Utc>,
    pub results: AnalysisResult,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS analyses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            videoid TEXT NOT NULL,
            analyzed_at TEXT NOT NULL,
            comments_json TEXT NOT NULL DEFAULT '[]',
            results_json TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_analyses_videoid ON analyses(videoid);
        "#,
    )
    .await?;
    Ok(())
}

/// Write handle used by the orchestrator; one insert per run.
pub struct AnalysisStore {
    conn: Connection,
}

impl AnalysisStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the
    /// expected schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating analyses directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening analyses DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Appends one finished run and returns the store-assigned id.
    pub async fn insert_analysis(&self, record: &AnalysisRecord) -> Result<i64> {
        let comments_json =
            serde_json::to_string(&record.comments).context("serializing classified comments")?;
        let results_json =
            serde_json::to_string(&record.results).context("serializing analysis results")?;

        self.conn
            .execute(
                r#"
                INSERT INTO analyses (videoid, analyzed_at, comments_json, results_json)
                VALUES (:videoid, :analyzed_at, :comments_json, :results_json)
                "#,
                params![
                    record.videoid.as_str(),
                    record.analyzed_at.to_rfc3339(),
                    comments_json,
                    results_json,
                ],
            )
            .await?;

        Ok(self.conn.last_insert_rowid())
    }
}

/// Read-only handle backing the listing and detail endpoints.
#[derive(Clone)]
pub struct AnalysisReader {
    conn: Connection,
}

impl AnalysisReader {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = Builder::new_local(path.as_ref())
            .build()
            .await
            .with_context(|| format!("opening analyses DB {}", path.as_ref().display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// All persisted runs, newest first, without their comment payloads.
    pub async fn list_analyses(&self) -> Result<Vec<AnalysisSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, videoid, analyzed_at, results_json
                FROM analyses
                ORDER BY datetime(analyzed_at) DESC, id DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next().await? {
            summaries.push(row_to_summary(&row)?);
        }
        Ok(summaries)
    }

    /// One full run including every classified comment.
    pub async fn get_analysis(&self, id: i64) -> Result<Option<AnalysisRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT videoid, analyzed_at, comments_json, results_json
                FROM analyses
                WHERE id = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([id]).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(row_to_record(&row)?))
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|stamp| stamp.with_timezone(&Utc))
        .with_context(|| format!("parsing stored timestamp {raw}"))
}

fn row_to_summary(row: &Row) -> Result<AnalysisSummary> {
    let analyzed_at: String = row.get(2)?;
    let results_json: String = row.get(3)?;
    let results: AnalysisResult =
        serde_json::from_str(&results_json).context("parsing stored results JSON")?;

    Ok(AnalysisSummary {
        id: row.get(0)?,
        videoid: row.get(1)?,
        analyzed_at: parse_timestamp(&analyzed_at)?,
        results,
    })
}

fn row_to_record(row: &Row) -> Result<AnalysisRecord> {
    let analyzed_at: String = row.get(1)?;
    let comments_json: String = row.get(2)?;
    let results_json: String = row.get(3)?;

    let comments: Vec<ClassifiedComment> =
        serde_json::from_str(&comments_json).context("parsing stored comments JSON")?;
    let results: AnalysisResult =
        serde_json::from_str(&results_json).context("parsing stored results JSON")?;

    Ok(AnalysisRecord {
        videoid: row.get(0)?,
        analyzed_at: parse_timestamp(&analyzed_at)?,
        comments,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::Stance;
    use tempfile::tempdir;

    fn sample_record(videoid: &str, analyzed_at: &str) -> AnalysisRecord {
        let results = AnalysisResult {
            agree: 1,
            neutral: 1,
            total: 2,
            distribution: std::collections::BTreeMap::from([("2023-03".to_string(), 2)]),
            ..AnalysisResult::default()
        };

        AnalysisRecord {
            videoid: videoid.into(),
            analyzed_at: analyzed_at.parse().unwrap(),
            comments: vec![
                ClassifiedComment {
                    text: "love it".into(),
                    sentiment: Stance::Agree,
                    published_at: "2023-03-15T08:00:00Z".parse().unwrap(),
                    masked_username: "User_abc123def".into(),
                },
                ClassifiedComment {
                    text: "ok I guess".into(),
                    sentiment: Stance::Neutral,
                    published_at: "2023-03-20T08:00:00Z".parse().unwrap(),
                    masked_username: "User_xyz789ghi".into(),
                },
            ],
            results,
        }
    }

    async fn create_store() -> (tempfile::TempDir, AnalysisStore, AnalysisReader) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analyses/test.db");
        let store = AnalysisStore::open(&path).await.unwrap();
        let reader = AnalysisReader::new(&path).await.unwrap();
        (dir, store, reader)
    }

    #[tokio::test]
    async fn opens_store_and_creates_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/analyses.db");
        let _store = AnalysisStore::open(&path).await.unwrap();
        assert!(path.exists(), "database file should be created");

        let db = Builder::new_local(&path).build().await.unwrap();
        let conn = db.connect().unwrap();
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='analyses'",
                params![],
            )
            .await
            .unwrap();
        assert!(rows.next().await.unwrap().is_some());

        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='index' AND name='idx_analyses_videoid'",
                params![],
            )
            .await
            .unwrap();
        assert!(rows.next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let (_dir, store, reader) = create_store().await;

        let record = sample_record("dQw4w9WgXcQ", "2024-05-01T12:00:00Z");
        let id = store.insert_analysis(&record).await.unwrap();

        let fetched = reader.get_analysis(id).await.unwrap().expect("record fetched");
        assert_eq!(fetched.videoid, "dQw4w9WgXcQ");
        assert_eq!(fetched.analyzed_at, record.analyzed_at);
        assert_eq!(fetched.comments.len(), 2);
        assert_eq!(fetched.comments[0].sentiment, Stance::Agree);
        assert_eq!(fetched.comments[0].masked_username, "User_abc123def");
        assert_eq!(fetched.results, record.results);
    }

    #[tokio::test]
    async fn list_returns_newest_first() {
        let (_dir, store, reader) = create_store().await;

        store
            .insert_analysis(&sample_record("older", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .insert_analysis(&sample_record("newer", "2024-06-01T00:00:00Z"))
            .await
            .unwrap();

        let summaries = reader.list_analyses().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].videoid, "newer");
        assert_eq!(summaries[1].videoid, "older");
        assert_eq!(summaries[0].results.total, 2);
    }

    #[tokio::test]
    async fn repeated_runs_for_one_video_all_survive() {
        let (_dir, store, reader) = create_store().await;

        let first = store
            .insert_analysis(&sample_record("dQw4w9WgXcQ", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        let second = store
            .insert_analysis(&sample_record("dQw4w9WgXcQ", "2024-01-02T00:00:00Z"))
            .await
            .unwrap();

        assert!(second > first, "ids should be store-assigned and increasing");
        assert_eq!(reader.list_analyses().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_record_returns_none() {
        let (_dir, _store, reader) = create_store().await;
        assert!(reader.get_analysis(42).await.unwrap().is_none());
    }
}
