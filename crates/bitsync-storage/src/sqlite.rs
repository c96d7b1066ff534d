//! SQLite storage backend for bitsync.
//!
//! Persists both record collections and the checkpoint to a single SQLite
//! file. Documents are stored as JSON text keyed by `tx.h`.
//!
//! Index paths fan out across arrays like queries do, so `out.s1` covers the
//! `s1` of every output. On insert, the values at key paths go to a
//! `<table>_keys` side table and the values at full-text paths feed an FTS5
//! table, both in the same transaction as the document. The configured paths
//! are persisted in `index_paths` and reloaded on open.
//!
//! # Usage
//! ```rust,no_run
//! use bitsync_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./bitsync.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use bitsync_core::checkpoint::{Checkpoint, CheckpointStore};
use bitsync_core::error::IndexerError;
use bitsync_core::store::{Collection, DocumentStore, IndexSpec, InsertOutcome};
use bitsync_core::types::{document_hash, document_height, find_path, Document};

/// Index rows per multi-row insert.
const INDEX_ROWS_PER_INSERT: usize = 500;

fn storage_err(e: impl std::fmt::Display) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed storage for records and checkpoints.
pub struct SqliteStorage {
    pool: SqlitePool,
    indexes: RwLock<HashMap<Collection, IndexSpec>>,
}

/// A `:memory:` database lives only as long as its connection, so the pool
/// keeps exactly one and never recycles it.
fn memory_pool_options() -> SqlitePoolOptions {
    SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./bitsync.db"`) or a full
    /// SQLite URL (`"sqlite:./bitsync.db"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(storage_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(storage_err)?;

        Self::from_pool(pool).await
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the storage is closed or dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = memory_pool_options()
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, IndexerError> {
        let storage = Self {
            pool,
            indexes: RwLock::new(HashMap::new()),
        };
        storage.init_schema().await?;
        storage.load_index_paths().await?;
        Ok(storage)
    }

    /// Create the checkpoint table, both record tables, and their key tables.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        let mut statements = vec![
            "CREATE TABLE IF NOT EXISTS checkpoints (
                indexer_id   TEXT    PRIMARY KEY,
                block_number INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );"
            .to_string(),
            "CREATE TABLE IF NOT EXISTS index_paths (
                collection TEXT NOT NULL,
                kind       TEXT NOT NULL,
                path       TEXT NOT NULL,
                PRIMARY KEY (collection, kind, path)
            );"
            .to_string(),
        ];

        for collection in Collection::ALL {
            let table = collection.name();
            statements.extend([
                // seq preserves insertion order; hash carries the unique tx.h key
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        seq    INTEGER PRIMARY KEY AUTOINCREMENT,
                        hash   TEXT    NOT NULL UNIQUE,
                        height INTEGER,
                        doc    TEXT    NOT NULL
                    );"
                ),
                format!("CREATE INDEX IF NOT EXISTS idx_{table}_height ON {table} (height);"),
                format!(
                    "CREATE TABLE IF NOT EXISTS {table}_keys (
                        hash  TEXT NOT NULL,
                        path  TEXT NOT NULL,
                        value TEXT NOT NULL
                    );"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_keys_lookup ON {table}_keys (path, value);"
                ),
                format!("CREATE INDEX IF NOT EXISTS idx_{table}_keys_hash ON {table}_keys (hash);"),
                format!(
                    "CREATE TRIGGER IF NOT EXISTS {table}_keys_ad AFTER DELETE ON {table} BEGIN
                        DELETE FROM {table}_keys WHERE hash = old.hash;
                    END;"
                ),
            ]);
        }

        for sql in &statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn load_index_paths(&self) -> Result<(), IndexerError> {
        let rows = sqlx::query("SELECT collection, kind, path FROM index_paths ORDER BY rowid")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut specs: HashMap<Collection, IndexSpec> = HashMap::new();
        for row in &rows {
            let name: String = row.get("collection");
            let Some(collection) = Collection::ALL.into_iter().find(|c| c.name() == name) else {
                continue;
            };
            let spec = specs.entry(collection).or_default();
            let path: String = row.get("path");
            match row.get::<String, _>("kind").as_str() {
                "key" => spec.keys.push(path),
                _ => spec.fulltext.push(path),
            }
        }

        debug!(collections = specs.len(), "index paths loaded");
        *self.indexes.write().unwrap() = specs;
        Ok(())
    }

    /// The index paths configured on a collection.
    pub fn index_spec(&self, collection: Collection) -> Option<IndexSpec> {
        self.indexes.read().unwrap().get(&collection).cloned()
    }

    // ─── Queries ────────────────────────────────────────────────────────────────

    /// Documents matching an FTS5 query, in insertion order.
    ///
    /// Fails if no full-text index was created on the collection.
    pub async fn search(
        &self,
        collection: Collection,
        query: &str,
    ) -> Result<Vec<Document>, IndexerError> {
        let table = collection.name();
        let rows = sqlx::query(&format!(
            "SELECT c.doc FROM {table}_fts f JOIN {table} c ON c.hash = f.hash
             WHERE {table}_fts MATCH ? ORDER BY c.seq"
        ))
        .bind(query)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(decode_doc).collect()
    }

    /// Documents holding `value` anywhere under a key-indexed `path`, in
    /// insertion order.
    pub async fn find_by_key(
        &self,
        collection: Collection,
        path: &str,
        value: &Value,
    ) -> Result<Vec<Document>, IndexerError> {
        let indexed = self
            .index_spec(collection)
            .map_or(false, |spec| spec.keys.iter().any(|k| k == path));
        if !indexed {
            return Err(IndexerError::Config(format!(
                "'{path}' is not a key index on {collection}"
            )));
        }
        let Some(value) = leaf_text(value) else {
            return Ok(Vec::new());
        };

        let table = collection.name();
        let rows = sqlx::query(&format!(
            "SELECT doc FROM {table} WHERE hash IN
                (SELECT hash FROM {table}_keys WHERE path = ? AND value = ?)
             ORDER BY seq"
        ))
        .bind(path)
        .bind(value)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(decode_doc).collect()
    }
}

// ─── Index extraction ────────────────────────────────────────────────────────

/// Index paths must be dotted identifiers or array indices.
fn validate_path(path: &str) -> Result<(), IndexerError> {
    let ok = !path.is_empty()
        && path
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if ok {
        Ok(())
    } else {
        Err(IndexerError::Config(format!("invalid index path '{path}'")))
    }
}

fn leaf_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn push_leaves(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::Array(items) => items.iter().for_each(|item| push_leaves(item, out)),
        other => out.extend(leaf_text(other)),
    }
}

/// Scalar values at `path`, with arrays flattened. Objects are skipped.
fn leaf_values(doc: &Document, path: &str) -> Vec<String> {
    let mut out = Vec::new();
    for v in find_path(doc, path) {
        push_leaves(v, &mut out);
    }
    out
}

/// Write key rows and full-text rows for freshly inserted documents.
async fn write_index_rows(
    conn: &mut SqliteConnection,
    table: &str,
    spec: &IndexSpec,
    docs: &[(&str, &Document)],
) -> Result<(), IndexerError> {
    let mut keys: Vec<(String, String, String)> = Vec::new();
    for (hash, doc) in docs {
        for path in &spec.keys {
            let mut values = leaf_values(doc, path);
            values.sort();
            values.dedup();
            keys.extend(values.into_iter().map(|v| (hash.to_string(), path.clone(), v)));
        }
    }
    for chunk in keys.chunks(INDEX_ROWS_PER_INSERT) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO {table}_keys (hash, path, value) "));
        qb.push_values(chunk, |mut b, (hash, path, value)| {
            b.push_bind(hash.clone())
                .push_bind(path.clone())
                .push_bind(value.clone());
        });
        qb.build().execute(&mut *conn).await.map_err(storage_err)?;
    }

    if spec.fulltext.is_empty() {
        return Ok(());
    }
    let bodies: Vec<(String, String)> = docs
        .iter()
        .filter_map(|(hash, doc)| {
            let body = spec
                .fulltext
                .iter()
                .flat_map(|path| leaf_values(doc, path))
                .collect::<Vec<_>>()
                .join(" ");
            (!body.is_empty()).then(|| (hash.to_string(), body))
        })
        .collect();
    for chunk in bodies.chunks(INDEX_ROWS_PER_INSERT) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO {table}_fts (hash, body) "));
        qb.push_values(chunk, |mut b, (hash, body)| {
            b.push_bind(hash.clone()).push_bind(body.clone());
        });
        qb.build().execute(&mut *conn).await.map_err(storage_err)?;
    }
    Ok(())
}

fn decode_doc(row: &sqlx::sqlite::SqliteRow) -> Result<Document, IndexerError> {
    let text: String = row.get("doc");
    serde_json::from_str(&text).map_err(storage_err)
}

// ─── DocumentStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl DocumentStore for SqliteStorage {
    async fn insert_many(
        &self,
        collection: Collection,
        docs: &[Document],
    ) -> Result<InsertOutcome, IndexerError> {
        if docs.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let mut rows = Vec::with_capacity(docs.len());
        for doc in docs {
            let hash = document_hash(doc)
                .ok_or_else(|| IndexerError::Storage("document has no tx.h".into()))?;
            let height = document_height(doc).map(|h| h as i64);
            let text = serde_json::to_string(doc).map_err(storage_err)?;
            rows.push((hash.to_string(), height, text));
        }

        let table = collection.name();
        let spec = self.index_spec(collection);
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO {table} (hash, height, doc) "));
        qb.push_values(rows, |mut b, (hash, height, text)| {
            b.push_bind(hash).push_bind(height).push_bind(text);
        });
        qb.push(" ON CONFLICT(hash) DO NOTHING RETURNING hash");

        let inserted: HashSet<String> = qb
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(storage_err)?
            .iter()
            .map(|r| r.get::<String, _>("hash"))
            .collect();

        if let Some(spec) = &spec {
            // the first document with a given hash is the one stored
            let mut seen = HashSet::new();
            let fresh: Vec<(&str, &Document)> = docs
                .iter()
                .filter_map(|doc| document_hash(doc).map(|h| (h, doc)))
                .filter(|(h, _)| inserted.contains(*h) && seen.insert(*h))
                .collect();
            write_index_rows(&mut *tx, table, spec, &fresh).await?;
        }
        tx.commit().await.map_err(storage_err)?;

        Ok(InsertOutcome {
            inserted: inserted.len(),
            duplicates: docs.len() - inserted.len(),
        })
    }

    async fn delete_from_height(&self, collection: Collection, height: u64) -> Result<u64, IndexerError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE height >= ?",
            collection.name()
        ))
        .bind(height as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(%collection, height, deleted = result.rows_affected(), "range deleted");
        Ok(result.rows_affected())
    }

    async fn delete_all(&self, collection: Collection) -> Result<u64, IndexerError> {
        let result = sqlx::query(&format!("DELETE FROM {}", collection.name()))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn count(&self, collection: Collection) -> Result<u64, IndexerError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) as cnt FROM {}", collection.name()))
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    async fn find_by_hash(
        &self,
        collection: Collection,
        hash: &str,
    ) -> Result<Option<Document>, IndexerError> {
        let row = sqlx::query(&format!("SELECT doc FROM {} WHERE hash = ?", collection.name()))
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.as_ref().map(decode_doc).transpose()
    }

    async fn hashes(&self, collection: Collection) -> Result<Vec<String>, IndexerError> {
        let rows = sqlx::query(&format!("SELECT hash FROM {} ORDER BY seq", collection.name()))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(rows.iter().map(|r| r.get::<String, _>("hash")).collect())
    }

    /// Replace the collection's index paths and rebuild both indexes from the
    /// stored documents.
    async fn create_indexes(&self, collection: Collection, spec: &IndexSpec) -> Result<(), IndexerError> {
        for path in spec.keys.iter().chain(&spec.fulltext) {
            validate_path(path)?;
        }

        let table = collection.name();
        let fts = format!("{table}_fts");
        let mut statements = vec![
            format!("DELETE FROM {table}_keys;"),
            format!("DROP TRIGGER IF EXISTS {fts}_ad;"),
            format!("DROP TABLE IF EXISTS {fts};"),
        ];
        if !spec.fulltext.is_empty() {
            statements.extend([
                format!("CREATE VIRTUAL TABLE {fts} USING fts5(hash UNINDEXED, body);"),
                format!(
                    "CREATE TRIGGER {fts}_ad AFTER DELETE ON {table} BEGIN
                        DELETE FROM {fts} WHERE hash = old.hash;
                    END;"
                ),
            ]);
        }

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for sql in &statements {
            sqlx::query(sql).execute(&mut *tx).await.map_err(storage_err)?;
        }

        sqlx::query("DELETE FROM index_paths WHERE collection = ?")
            .bind(table)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        let kinds = spec
            .keys
            .iter()
            .map(|p| ("key", p))
            .chain(spec.fulltext.iter().map(|p| ("fulltext", p)));
        for (kind, path) in kinds {
            sqlx::query("INSERT OR IGNORE INTO index_paths (collection, kind, path) VALUES (?, ?, ?)")
                .bind(table)
                .bind(kind)
                .bind(path)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        let rows = sqlx::query(&format!("SELECT hash, doc FROM {table} ORDER BY seq"))
            .fetch_all(&mut *tx)
            .await
            .map_err(storage_err)?;
        let stored: Vec<(String, Document)> = rows
            .iter()
            .map(|r| -> Result<_, IndexerError> { Ok((r.get::<String, _>("hash"), decode_doc(r)?)) })
            .collect::<Result<_, _>>()?;
        let pairs: Vec<(&str, &Document)> = stored.iter().map(|(h, d)| (h.as_str(), d)).collect();
        write_index_rows(&mut *tx, table, spec, &pairs).await?;
        tx.commit().await.map_err(storage_err)?;

        self.indexes
            .write()
            .unwrap()
            .insert(collection, spec.clone());
        debug!(
            %collection,
            keys = spec.keys.len(),
            fulltext = spec.fulltext.len(),
            backfilled = stored.len(),
            "indexes rebuilt"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), IndexerError> {
        self.pool.close().await;
        debug!("sqlite pool closed");
        Ok(())
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, indexer_id: &str) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT indexer_id, block_number, updated_at
             FROM checkpoints WHERE indexer_id = ?",
        )
        .bind(indexer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IndexerError::Checkpoint(e.to_string()))?;

        Ok(row.map(|r| Checkpoint {
            indexer_id: r.get("indexer_id"),
            block_number: r.get::<i64, _>("block_number") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (indexer_id, block_number, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(&checkpoint.indexer_id)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Checkpoint(e.to_string()))?;

        debug!(
            indexer_id = %checkpoint.indexer_id,
            block = checkpoint.block_number,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, indexer_id: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE indexer_id = ?")
            .bind(indexer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| IndexerError::Checkpoint(e.to_string()))?;

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
