//! Local persistence for Kura: the SQLite sales store and the raw upload
//! vault backing the confirm-and-replace flow.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDateTime;
use kura_core::{SalesRecord, StoredSale, UploadRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

pub const CRATE_NAME: &str = "kura-storage";

/// Ordered schema history. Each entry is applied at most once, recorded in
/// `schema_migrations`. Migration 2 is the one additive column this system
/// is allowed: batch provenance for replace-on-reprocess.
const MIGRATIONS: &[(i64, &[&str])] = &[
    (
        1,
        &[
            "CREATE TABLE IF NOT EXISTS sales (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                product_name TEXT NOT NULL,
                units_sold INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS upload_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                file_hash TEXT UNIQUE NOT NULL,
                uploaded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        ],
    ),
    (
        2,
        &["ALTER TABLE sales ADD COLUMN source_filename TEXT NOT NULL DEFAULT ''"],
    ),
];

/// Connection handle for the sales store. Cheap to clone; owns a pool.
#[derive(Debug, Clone)]
pub struct SalesStore {
    pool: SqlitePool,
}

impl SalesStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect by URL (`sqlite://path?mode=rwc` or `sqlite::memory:`).
    /// Single connection: ingestion is single-writer by design.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self::new(pool))
    }

    /// Connect to a database file, creating it if missing.
    pub async fn connect_file(path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply pending migrations, once, at process initialization.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating schema_migrations table")?;

        for (version, statements) in MIGRATIONS {
            let applied: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?)",
            )
            .bind(version)
            .fetch_one(&self.pool)
            .await?;
            if applied {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            for statement in *statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("applying migration {version}"))?;
            }
            sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
                .bind(version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version, "applied schema migration");
        }
        Ok(())
    }

    /// Look up the upload log by content hash.
    pub async fn upload_by_hash(&self, hash: &str) -> anyhow::Result<Option<UploadRecord>> {
        let row = sqlx::query(
            "SELECT filename, file_hash, uploaded_at FROM upload_log WHERE file_hash = ?",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .context("querying upload_log by hash")?;

        row.map(|row| -> Result<UploadRecord, sqlx::Error> {
            let uploaded_at: NaiveDateTime = row.try_get("uploaded_at")?;
            Ok(UploadRecord {
                filename: row.try_get("filename")?,
                content_hash: row.try_get("file_hash")?,
                uploaded_at: uploaded_at.and_utc(),
            })
        })
        .transpose()
        .map_err(Into::into)
    }

    /// Idempotent upload-log insert: re-inserting a known hash is a no-op,
    /// never an error.
    pub async fn insert_upload_if_absent(&self, hash: &str, filename: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT OR IGNORE INTO upload_log (filename, file_hash) VALUES (?, ?)")
            .bind(filename)
            .bind(hash)
            .execute(&self.pool)
            .await
            .context("inserting upload_log entry")?;
        Ok(())
    }

    async fn insert_batch(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        records: &[SalesRecord],
    ) -> Result<(), sqlx::Error> {
        for record in records {
            sqlx::query(
                "INSERT INTO sales (date, product_name, units_sold, source_filename)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(record.date)
            .bind(&record.product_name)
            .bind(record.quantity)
            .bind(&record.source_filename)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Bulk insert, one transaction, source row order preserved.
    pub async fn insert_sales(&self, records: &[SalesRecord]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_batch(&mut tx, records).await?;
        tx.commit().await.context("committing sales batch")?;
        Ok(())
    }

    /// First-ingest path: bulk insert + upload-log insert, one transaction.
    pub async fn record_ingest(
        &self,
        records: &[SalesRecord],
        hash: &str,
        filename: &str,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_batch(&mut tx, records).await?;
        sqlx::query("INSERT OR IGNORE INTO upload_log (filename, file_hash) VALUES (?, ?)")
            .bind(filename)
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        tx.commit().await.context("committing ingest batch")?;
        Ok(())
    }

    /// Reprocess path: full replace, not merge. Deletes every sale from the
    /// same source filename before inserting the new batch, all in one
    /// transaction so a failure leaves the old batch intact.
    pub async fn replace_sales(
        &self,
        filename: &str,
        records: &[SalesRecord],
        hash: &str,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sales WHERE source_filename = ?")
            .bind(filename)
            .execute(&mut *tx)
            .await?;
        Self::insert_batch(&mut tx, records).await?;
        sqlx::query("INSERT OR IGNORE INTO upload_log (filename, file_hash) VALUES (?, ?)")
            .bind(filename)
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        tx.commit().await.context("committing replace batch")?;
        Ok(())
    }

    pub async fn delete_sales_by_source(&self, filename: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM sales WHERE source_filename = ?")
            .bind(filename)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_all_sales(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM sales").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_sale(&self, id: i64) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM sales WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_sales(&self) -> anyhow::Result<Vec<StoredSale>> {
        let rows = sqlx::query(
            "SELECT id, date, product_name, units_sold, source_filename
               FROM sales
              ORDER BY date DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing sales")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredSale {
                id: row.try_get("id")?,
                date: row.try_get("date")?,
                product_name: row.try_get("product_name")?,
                quantity: row.try_get("units_sold")?,
                source_filename: row.try_get("source_filename")?,
            });
        }
        Ok(out)
    }
}

/// Raw upload bytes persisted under their original filename so a later
/// confirmation can reprocess the exact content. Atomic temp-file rename;
/// a re-store under the same filename replaces the previous bytes.
#[derive(Debug, Clone)]
pub struct UploadVault {
    root: PathBuf,
}

impl UploadVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn checked_path(&self, filename: &str) -> anyhow::Result<PathBuf> {
        if filename.is_empty()
            || filename.contains(['/', '\\'])
            || filename.contains("..")
        {
            anyhow::bail!("unsafe upload filename: {filename:?}");
        }
        Ok(self.root.join(filename))
    }

    pub async fn store(&self, filename: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let target = self.checked_path(filename)?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating vault directory {}", self.root.display()))?;

        let temp_path = self.root.join(format!(".{filename}.tmp"));
        let write = async {
            let mut file = fs::File::create(&temp_path)
                .await
                .with_context(|| format!("opening temp upload file {}", temp_path.display()))?;
            file.write_all(bytes)
                .await
                .with_context(|| format!("writing temp upload file {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp upload file {}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &target)
                .await
                .with_context(|| format!("renaming upload into vault {}", target.display()))
        };

        match write.await {
            Ok(()) => Ok(target),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
            }
        }
    }

    pub async fn load(&self, filename: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.checked_path(filename)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading upload {}", path.display()))
            }
        }
    }
}
