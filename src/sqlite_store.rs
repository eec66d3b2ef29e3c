//! SQLite-backed implementation of the store traits.
//!
//! One database holds every hub concern: source collections, target
//! collections, search indices and pipeline metadata. Documents are stored
//! as JSON text keyed by `(owner, id)`; identifier sets are passed to SQLite
//! as a JSON array and expanded with `json_each`.
//!
//! | Trait | Tables |
//! |-------|--------|
//! | `SourceCollection` | `sources`, `source_documents` |
//! | `DocumentStore` | `collections`, `collection_documents` |
//! | `SearchIndex` | `indices`, `index_documents` |
//! | `MetadataStore` | `builds`, `diffs`, `patch_sync`, `releases` |

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use biohub_core::mapping::{diff_mappings, Mapping, MappingDelta};
use biohub_core::models::{BuildRecord, DiffReport, Document, IndexMetadata, Release, SourceInfo};
use biohub_core::store::{DocumentStore, MetadataStore, SearchIndex, SourceCollection};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Replace the documents of a source collection and record its version.
    ///
    /// Used by `biohub load-source`; real uploaders write the same tables.
    pub async fn load_source(
        &self,
        source: &str,
        version: Option<&str>,
        docs: &[Document],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM source_documents WHERE source = ?")
            .bind(source)
            .execute(&mut *tx)
            .await?;

        for doc in docs {
            sqlx::query(
                "INSERT OR REPLACE INTO source_documents (source, id, body) VALUES (?, ?, ?)",
            )
            .bind(source)
            .bind(&doc.id)
            .bind(serde_json::to_string(&doc.to_value())?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO sources (name, version, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source)
        .bind(version)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(docs.len() as u64)
    }
}

fn parse_doc(body: &str) -> Result<Document> {
    serde_json::from_str(body).with_context(|| "Failed to decode stored document")
}

fn parse_docs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Document>> {
    rows.iter()
        .map(|row| parse_doc(&row.get::<String, _>("body")))
        .collect()
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn ids_json(ids: &[String]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}

#[async_trait]
impl SourceCollection for SqliteStore {
    async fn list_sources(&self) -> Result<Vec<SourceInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT s.name, s.version, s.updated_at,
                   (SELECT COUNT(*) FROM source_documents d WHERE d.source = s.name) AS documents
            FROM sources s ORDER BY s.name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SourceInfo {
                name: row.get("name"),
                version: row.get("version"),
                updated_at: parse_ts(row.get("updated_at")),
                documents: row.get::<i64, _>("documents") as u64,
            })
            .collect())
    }

    async fn source_info(&self, source: &str) -> Result<Option<SourceInfo>> {
        Ok(self
            .list_sources()
            .await?
            .into_iter()
            .find(|s| s.name == source))
    }

    async fn source_documents(
        &self,
        source: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT body FROM source_documents WHERE source = ? AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(source)
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() && after.is_none() && self.source_info(source).await?.is_none() {
            bail!("source collection '{}' does not exist", source);
        }
        parse_docs(&rows)
    }

    async fn source_documents_by_id(&self, source: &str, ids: &[String]) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM source_documents
            WHERE source = ? AND id IN (SELECT value FROM json_each(?))
            ORDER BY id ASC
            "#,
        )
        .bind(source)
        .bind(ids_json(ids)?)
        .fetch_all(&self.pool)
        .await?;
        parse_docs(&rows)
    }

    async fn source_count(&self, source: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM source_documents WHERE source = ?")
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

impl SqliteStore {
    async fn require_collection(&self, collection: &str) -> Result<()> {
        if !self.collection_exists(collection).await? {
            bail!("collection '{}' does not exist", collection);
        }
        Ok(())
    }

    async fn require_index(&self, index: &str) -> Result<()> {
        if !self.index_exists(index).await? {
            bail!("index '{}' does not exist", index);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn create_collection(&self, collection: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM collection_documents WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR REPLACE INTO collections (name, created_at) VALUES (?, ?)")
            .bind(collection)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM collection_documents WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn get_documents(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>> {
        self.require_collection(collection).await?;
        let rows = sqlx::query(
            r#"
            SELECT body FROM collection_documents
            WHERE collection = ? AND id IN (SELECT value FROM json_each(?))
            ORDER BY id ASC
            "#,
        )
        .bind(collection)
        .bind(ids_json(ids)?)
        .fetch_all(&self.pool)
        .await?;
        parse_docs(&rows)
    }

    async fn upsert_documents(&self, collection: &str, docs: &[Document]) -> Result<()> {
        self.require_collection(collection).await?;
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            sqlx::query(
                "INSERT OR REPLACE INTO collection_documents (collection, id, body) VALUES (?, ?, ?)",
            )
            .bind(collection)
            .bind(&doc.id)
            .bind(serde_json::to_string(&doc.to_value())?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<()> {
        self.require_collection(collection).await?;
        sqlx::query(
            "DELETE FROM collection_documents WHERE collection = ? AND id IN (SELECT value FROM json_each(?))",
        )
        .bind(collection)
        .bind(ids_json(ids)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_ids(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.require_collection(collection).await?;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM collection_documents WHERE collection = ? AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(collection)
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_documents(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        self.require_collection(collection).await?;
        let rows = sqlx::query(
            "SELECT body FROM collection_documents WHERE collection = ? AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(collection)
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        parse_docs(&rows)
    }

    async fn count_documents(&self, collection: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM collection_documents WHERE collection = ?")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl SearchIndex for SqliteStore {
    async fn create_index(&self, index: &str, mapping: &Mapping) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM index_documents WHERE idx = ?")
            .bind(index)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO indices (name, mapping_json, metadata_json, created_at) VALUES (?, ?, NULL, ?)",
        )
        .bind(index)
        .bind(serde_json::to_string(mapping)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM indices WHERE name = ?")
            .bind(index)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn validate_mapping(&self, index: &str, mapping: &Mapping) -> Result<MappingDelta> {
        let current = self.index_mapping(index).await?.unwrap_or_default();
        Ok(diff_mappings(&current, mapping))
    }

    async fn index_mapping(&self, index: &str) -> Result<Option<Mapping>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT mapping_json FROM indices WHERE name = ?")
            .bind(index)
            .fetch_optional(&self.pool)
            .await?;
        raw.map(|s| serde_json::from_str(&s).with_context(|| "Failed to decode index mapping"))
            .transpose()
    }

    async fn update_mapping(&self, index: &str, mapping: &Mapping) -> Result<()> {
        let result = sqlx::query("UPDATE indices SET mapping_json = ? WHERE name = ?")
            .bind(serde_json::to_string(mapping)?)
            .bind(index)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("index '{}' does not exist", index);
        }
        Ok(())
    }

    async fn bulk_index(&self, index: &str, docs: &[Document]) -> Result<()> {
        self.require_index(index).await?;
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            sqlx::query("INSERT OR REPLACE INTO index_documents (idx, id, body) VALUES (?, ?, ?)")
                .bind(index)
                .bind(&doc.id)
                .bind(serde_json::to_string(&doc.to_value())?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_indexed(&self, index: &str, id: &str) -> Result<Option<Document>> {
        self.require_index(index).await?;
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM index_documents WHERE idx = ? AND id = ?")
                .bind(index)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        body.map(|b| parse_doc(&b)).transpose()
    }

    async fn put_indexed(&self, index: &str, doc: &Document) -> Result<()> {
        self.bulk_index(index, std::slice::from_ref(doc)).await
    }

    async fn delete_indexed(&self, index: &str, id: &str) -> Result<()> {
        self.require_index(index).await?;
        sqlx::query("DELETE FROM index_documents WHERE idx = ? AND id = ?")
            .bind(index)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn index_count(&self, index: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_documents WHERE idx = ?")
            .bind(index)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn get_metadata(&self, index: &str) -> Result<Option<IndexMetadata>> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT metadata_json FROM indices WHERE name = ?")
                .bind(index)
                .fetch_optional(&self.pool)
                .await?;
        raw.flatten()
            .map(|s| serde_json::from_str(&s).with_context(|| "Failed to decode index metadata"))
            .transpose()
    }

    async fn put_metadata(&self, index: &str, metadata: &IndexMetadata) -> Result<()> {
        let result = sqlx::query("UPDATE indices SET metadata_json = ? WHERE name = ?")
            .bind(serde_json::to_string(metadata)?)
            .bind(index)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("index '{}' does not exist", index);
        }
        Ok(())
    }
}

impl SqliteStore {
    async fn synced_flags(&self, diff_id: &str) -> Result<BTreeMap<u32, Vec<String>>> {
        let rows = sqlx::query("SELECT seq, target FROM patch_sync WHERE diff_id = ? ORDER BY seq")
            .bind(diff_id)
            .fetch_all(&self.pool)
            .await?;
        let mut flags: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for row in rows {
            let seq: i64 = row.get("seq");
            flags.entry(seq as u32).or_default().push(row.get("target"));
        }
        Ok(flags)
    }

    async fn hydrate_diff(&self, report_json: &str) -> Result<DiffReport> {
        let mut report: DiffReport =
            serde_json::from_str(report_json).with_context(|| "Failed to decode diff report")?;
        let flags = self.synced_flags(&report.id).await?;
        for file in report.files.iter_mut() {
            file.synced = flags.get(&file.seq).cloned().unwrap_or_default().into_iter().collect();
        }
        Ok(report)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn save_build(&self, record: &BuildRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (name, config_name, started_at, record_json) VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET record_json = excluded.record_json
            "#,
        )
        .bind(&record.name)
        .bind(&record.config_name)
        .bind(record.started_at.to_rfc3339())
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_build(&self, name: &str) -> Result<Option<BuildRecord>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT record_json FROM builds WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        raw.map(|s| serde_json::from_str(&s).with_context(|| "Failed to decode build record"))
            .transpose()
    }

    async fn list_builds(&self, config: Option<&str>) -> Result<Vec<BuildRecord>> {
        let rows: Vec<String> = match config {
            Some(c) => {
                sqlx::query_scalar(
                    "SELECT record_json FROM builds WHERE config_name = ? ORDER BY started_at ASC, name ASC",
                )
                .bind(c)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT record_json FROM builds ORDER BY started_at ASC, name ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(|s| serde_json::from_str(s).with_context(|| "Failed to decode build record"))
            .collect()
    }

    async fn save_diff(&self, report: &DiffReport) -> Result<()> {
        let mut stored = report.clone();
        for file in stored.files.iter_mut() {
            file.synced.clear();
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR REPLACE INTO diffs (id, created_at, report_json) VALUES (?, ?, ?)")
            .bind(&report.id)
            .bind(report.created_at.to_rfc3339())
            .bind(serde_json::to_string(&stored)?)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM patch_sync WHERE diff_id = ?")
            .bind(&report.id)
            .execute(&mut *tx)
            .await?;
        for file in &report.files {
            for target in &file.synced {
                sqlx::query(
                    "INSERT INTO patch_sync (diff_id, seq, target, synced_at) VALUES (?, ?, ?, ?)",
                )
                .bind(&report.id)
                .bind(file.seq as i64)
                .bind(target)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_diff(&self, id: &str) -> Result<Option<DiffReport>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT report_json FROM diffs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match raw {
            Some(json) => Ok(Some(self.hydrate_diff(&json).await?)),
            None => Ok(None),
        }
    }

    async fn list_diffs(&self) -> Result<Vec<DiffReport>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT report_json FROM diffs ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?;
        let mut diffs = Vec::with_capacity(rows.len());
        for json in rows {
            diffs.push(self.hydrate_diff(&json).await?);
        }
        Ok(diffs)
    }

    async fn mark_patch_synced(&self, diff_id: &str, seq: u32, target: &str) -> Result<()> {
        let Some(report) = self.get_diff(diff_id).await? else {
            bail!("diff '{}' does not exist", diff_id);
        };
        if !report.files.iter().any(|f| f.seq == seq) {
            bail!("diff '{}' has no patch file {}", diff_id, seq);
        }
        sqlx::query(
            "INSERT OR IGNORE INTO patch_sync (diff_id, seq, target, synced_at) VALUES (?, ?, ?, ?)",
        )
        .bind(diff_id)
        .bind(seq as i64)
        .bind(target)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_synced(&self, diff_id: &str, target: &str) -> Result<u64> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM diffs WHERE id = ?")
            .bind(diff_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            bail!("diff '{}' does not exist", diff_id);
        }
        let result = sqlx::query("DELETE FROM patch_sync WHERE diff_id = ? AND target = ?")
            .bind(diff_id)
            .bind(target)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn save_release(&self, release: &Release) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO releases (id, started_at, release_json) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET release_json = excluded.release_json
            "#,
        )
        .bind(&release.id)
        .bind(release.started_at.to_rfc3339())
        .bind(serde_json::to_string(release)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_releases(&self) -> Result<Vec<Release>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT release_json FROM releases ORDER BY started_at ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|s| serde_json::from_str(s).with_context(|| "Failed to decode release"))
            .collect()
    }
}
