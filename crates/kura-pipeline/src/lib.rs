//! Ingestion orchestration: fingerprint, duplicate check, decode, filter,
//! persist, then best-effort ledger reconciliation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kura_core::{IngestOutcome, MirrorStatus, StoredSale};
use kura_ingest::{
    decode_table, fingerprint, ColumnNames, DateStrategy, FilenameDatePrefix, IngestError,
    ProductMap, RowNormalizer, SalesColumns,
};
use kura_ledger::{
    partition_for, HttpLedgerClient, LedgerClient, LedgerConfig, LedgerMirror, MirrorError,
    SummaryDefaults,
};
use kura_storage::{SalesStore, UploadVault};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "kura-pipeline";

/// The category literal the POS export uses for alcoholic-beverage lines.
pub const DEFAULT_TARGET_CATEGORY: &str = "お酒類";

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Validation-class failure: aborts before any store mutation.
    #[error(transparent)]
    Validation(#[from] IngestError),
    /// Confirmation referenced a filename whose bytes are no longer in the
    /// vault; the caller must re-upload.
    #[error("no stored upload for {0:?}")]
    UploadMissing(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub vault_dir: PathBuf,
    pub product_map_path: PathBuf,
    pub target_category: String,
    pub ledger_url: Option<String>,
    pub ledger_token: Option<String>,
    pub ledger_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("KURA_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://kura.db?mode=rwc".to_string()),
            vault_dir: std::env::var("KURA_VAULT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./uploads")),
            product_map_path: std::env::var("KURA_PRODUCT_MAP")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config/products.yaml")),
            target_category: std::env::var("KURA_TARGET_CATEGORY")
                .unwrap_or_else(|_| DEFAULT_TARGET_CATEGORY.to_string()),
            ledger_url: std::env::var("KURA_LEDGER_URL").ok(),
            ledger_token: std::env::var("KURA_LEDGER_TOKEN").ok(),
            ledger_timeout_secs: std::env::var("KURA_LEDGER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Request-scoped ingestion orchestrator. Owns the write path to the sales
/// store and upload log; the ledger mirror is append-only and outside the
/// local transaction boundary.
///
/// Not safe for concurrent ingestions of the same date partition: the
/// entry-id used-set is seeded per batch, so overlapping runs can allocate
/// colliding external ids. Single ingest at a time is the deployment
/// assumption.
pub struct IngestPipeline {
    store: SalesStore,
    vault: UploadVault,
    product_map: ProductMap,
    column_names: ColumnNames,
    target_category: String,
    date_strategy: Box<dyn DateStrategy>,
    mirror: Option<LedgerMirror>,
}

impl IngestPipeline {
    pub fn new(store: SalesStore, vault: UploadVault, product_map: ProductMap) -> Self {
        Self {
            store,
            vault,
            product_map,
            column_names: ColumnNames::default(),
            target_category: DEFAULT_TARGET_CATEGORY.to_string(),
            date_strategy: Box::new(FilenameDatePrefix),
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: LedgerMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_target_category(mut self, category: impl Into<String>) -> Self {
        self.target_category = category.into();
        self
    }

    pub fn with_date_strategy(mut self, strategy: Box<dyn DateStrategy>) -> Self {
        self.date_strategy = strategy;
        self
    }

    pub fn store(&self) -> &SalesStore {
        &self.store
    }

    /// Wire a pipeline from environment configuration. Applies migrations
    /// once, here, at initialization.
    pub async fn from_config(config: PipelineConfig) -> anyhow::Result<Self> {
        let store = SalesStore::connect(&config.database_url).await?;
        store.migrate().await?;
        let vault = UploadVault::new(&config.vault_dir);
        let product_map = ProductMap::from_path(&config.product_map_path)
            .with_context(|| format!("loading {}", config.product_map_path.display()))?;

        let mut pipeline =
            Self::new(store, vault, product_map).with_target_category(config.target_category);
        if let Some(base_url) = config.ledger_url {
            let client = HttpLedgerClient::new(LedgerConfig {
                base_url,
                api_token: config.ledger_token,
                timeout: Duration::from_secs(config.ledger_timeout_secs),
                ..LedgerConfig::default()
            })?;
            let client: Arc<dyn LedgerClient> = Arc::new(client);
            pipeline = pipeline.with_mirror(LedgerMirror::new(client, SummaryDefaults::default()));
        }
        Ok(pipeline)
    }

    /// Entry point for a fresh upload. Stores the raw bytes, fingerprints
    /// them, and either processes the file or asks for confirmation when the
    /// same content was accepted before. The duplicate branch mutates
    /// nothing beyond the vault copy.
    pub async fn ingest(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<IngestOutcome, PipelineError> {
        self.vault.store(filename, bytes).await?;
        let content_hash = fingerprint(bytes);

        if let Some(existing) = self.store.upload_by_hash(&content_hash).await? {
            info!(
                filename,
                previous = %existing.filename,
                "duplicate content hash; awaiting confirmation"
            );
            return Ok(IngestOutcome::ConfirmationRequired {
                filename: filename.to_string(),
                content_hash,
            });
        }

        self.process(filename, bytes, &content_hash, false).await
    }

    /// Explicit operator confirmation of a duplicate: reprocess the stored
    /// bytes, replacing every sale previously ingested from this filename.
    pub async fn confirm(
        &self,
        filename: &str,
        content_hash: &str,
    ) -> Result<IngestOutcome, PipelineError> {
        let bytes = self
            .vault
            .load(filename)
            .await?
            .ok_or_else(|| PipelineError::UploadMissing(filename.to_string()))?;
        self.process(filename, &bytes, content_hash, true).await
    }

    async fn process(
        &self,
        filename: &str,
        bytes: &[u8],
        content_hash: &str,
        replace: bool,
    ) -> Result<IngestOutcome, PipelineError> {
        // Validation phase: any failure here aborts with zero writes.
        let date = self.date_strategy.resolve(filename)?;
        let table = decode_table(bytes)?;
        let columns = SalesColumns::resolve(&table, &self.column_names)?;

        let normalizer = RowNormalizer::new(columns, self.target_category.clone());
        let batch = normalizer.normalize(&table.rows, &self.product_map, date, filename);

        if replace {
            self.store
                .replace_sales(filename, &batch.records, content_hash)
                .await?;
        } else {
            self.store
                .record_ingest(&batch.records, content_hash, filename)
                .await?;
        }

        if batch.records.is_empty() {
            info!(filename, "ingest accepted with no matching category rows");
            return Ok(IngestOutcome::NoMatchingRows);
        }

        let mirror = self.reconcile(&batch.records, date).await;
        info!(
            filename,
            inserted = batch.records.len(),
            dropped_unmapped = batch.dropped_unmapped,
            "ingest complete"
        );
        Ok(IngestOutcome::Ingested {
            inserted: batch.records.len(),
            dropped_unmapped: batch.dropped_unmapped,
            mirror,
        })
    }

    /// Reconcile phase. Local persistence has already committed; nothing
    /// here can fail the ingestion.
    async fn reconcile(
        &self,
        records: &[kura_core::SalesRecord],
        date: chrono::NaiveDate,
    ) -> MirrorStatus {
        let Some(mirror) = &self.mirror else {
            return MirrorStatus::Skipped;
        };

        let partition = partition_for(date);
        let mut allocator = match mirror.seed_allocator(&partition).await {
            Ok(allocator) => allocator,
            Err(err) => {
                warn!(%partition, error = %err, "could not seed entry-id allocator");
                return MirrorStatus::Failed {
                    mirrored: 0,
                    reason: err.to_string(),
                };
            }
        };

        let ids: Vec<String> = records.iter().map(|_| allocator.next_id()).collect();
        match mirror.append_batch(records, &ids).await {
            Ok(rows) => MirrorStatus::Mirrored { rows },
            Err(err) => {
                warn!(%partition, error = %err, "ledger mirror failed; local data is durable");
                let mirrored = match &err {
                    MirrorError::Append { appended, .. } => *appended,
                    MirrorError::LengthMismatch { .. } => 0,
                };
                MirrorStatus::Failed {
                    mirrored,
                    reason: err.to_string(),
                }
            }
        }
    }

    pub async fn list_sales(&self) -> Result<Vec<StoredSale>, PipelineError> {
        Ok(self.store.list_sales().await?)
    }

    pub async fn delete_all_sales(&self) -> Result<u64, PipelineError> {
        Ok(self.store.delete_all_sales().await?)
    }

    pub async fn delete_sale(&self, id: i64) -> Result<u64, PipelineError> {
        Ok(self.store.delete_sale(id).await?)
    }

    /// Export every persisted record as a single-worksheet spreadsheet with
    /// localized headers, newest first.
    pub async fn export_xlsx(&self) -> Result<Vec<u8>, PipelineError> {
        let sales = self.store.list_sales().await?;

        let mut workbook = rust_xlsxwriter::Workbook::new();
        let worksheet = workbook.add_worksheet();
        let headers = ["日付", "商品名", "販売本数"];
        for (col, header) in headers.iter().enumerate() {
            worksheet
                .write_string(0, col as u16, *header)
                .map_err(|err| anyhow::anyhow!("writing export header: {err}"))?;
        }
        for (row, sale) in sales.iter().enumerate() {
            let row = (row + 1) as u32;
            worksheet
                .write_string(row, 0, sale.date.to_string())
                .and_then(|ws| ws.write_string(row, 1, &sale.product_name))
                .and_then(|ws| ws.write_number(row, 2, sale.quantity as f64))
                .map_err(|err| anyhow::anyhow!("writing export row: {err}"))?;
        }

        let bytes = workbook
            .save_to_buffer()
            .map_err(|err| anyhow::anyhow!("serializing export workbook: {err}"))?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_ledger::MemoryLedgerClient;
    use tempfile::TempDir;

    const CSV: &str = "商品名,カテゴリ,単価,税率,割引,店舗,担当,販売本数\n\
                       瓶ビール(大),お酒類,650,10,0,本店,佐藤,100\n\
                       ポテトサラダ,食品,300,8,0,本店,佐藤,50\n";

    struct Fixture {
        pipeline: IngestPipeline,
        ledger: Arc<MemoryLedgerClient>,
        _vault_dir: TempDir,
    }

    async fn fixture_with_ledger(ledger: Arc<MemoryLedgerClient>) -> Fixture {
        let store = SalesStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let vault_dir = TempDir::new().unwrap();
        let vault = UploadVault::new(vault_dir.path());
        let map = ProductMap::from_entries([
            ("瓶ビール(大)", "瓶ビール大"),
            ("純米酒 300ml", "純米酒300"),
        ]);
        let mirror = LedgerMirror::new(
            ledger.clone() as Arc<dyn LedgerClient>,
            SummaryDefaults::default(),
        );
        Fixture {
            pipeline: IngestPipeline::new(store, vault, map).with_mirror(mirror),
            ledger,
            _vault_dir: vault_dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_ledger(Arc::new(MemoryLedgerClient::default())).await
    }

    #[tokio::test]
    async fn first_ingest_persists_filtered_rows_and_mirrors() {
        let fx = fixture().await;
        let outcome = fx
            .pipeline
            .ingest("20250115-store.csv", CSV.as_bytes())
            .await
            .unwrap();

        match outcome {
            IngestOutcome::Ingested {
                inserted,
                dropped_unmapped,
                mirror,
            } => {
                assert_eq!(inserted, 1);
                assert_eq!(dropped_unmapped, 0);
                assert_eq!(mirror, MirrorStatus::Mirrored { rows: 1 });
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let sales = fx.pipeline.list_sales().await.unwrap();
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].product_name, "瓶ビール大");
        assert_eq!(sales[0].quantity, 100);
        assert_eq!(sales[0].date.to_string(), "2025-01-15");

        let (summaries, details) = fx.ledger.snapshot();
        assert_eq!(summaries[0].entry_id, "250115-001");
        assert_eq!(details[0].product_name, "瓶ビール大");
    }

    #[tokio::test]
    async fn duplicate_hash_requires_confirmation_and_mutates_nothing() {
        let fx = fixture().await;
        fx.pipeline
            .ingest("20250115-store.csv", CSV.as_bytes())
            .await
            .unwrap();
        let before = fx.pipeline.list_sales().await.unwrap();

        // Same bytes under a different name: still a duplicate.
        let outcome = fx
            .pipeline
            .ingest("20250116-copy.csv", CSV.as_bytes())
            .await
            .unwrap();
        match outcome {
            IngestOutcome::ConfirmationRequired {
                filename,
                content_hash,
            } => {
                assert_eq!(filename, "20250116-copy.csv");
                assert_eq!(content_hash, kura_ingest::fingerprint(CSV.as_bytes()));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(fx.pipeline.list_sales().await.unwrap(), before);
    }

    #[tokio::test]
    async fn confirmed_reprocess_replaces_the_old_batch_exactly() {
        let fx = fixture().await;
        fx.pipeline
            .ingest("20250115-store.csv", CSV.as_bytes())
            .await
            .unwrap();

        // Different bytes, different hash: processed directly, and the
        // first-ingest path does not replace, so both batches coexist.
        let updated = CSV.replace(",100\n", ",42\n");
        let outcome = fx
            .pipeline
            .ingest("20250115-store.csv", updated.as_bytes())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Ingested { .. }));
        assert_eq!(fx.pipeline.list_sales().await.unwrap().len(), 2);

        // A confirmed duplicate re-ingest of the original bytes collapses
        // the filename back to exactly the newly parsed set.
        fx.pipeline
            .ingest("20250115-store.csv", CSV.as_bytes())
            .await
            .unwrap();
        let hash = kura_ingest::fingerprint(CSV.as_bytes());
        fx.pipeline
            .confirm("20250115-store.csv", &hash)
            .await
            .unwrap();

        let sales = fx.pipeline.list_sales().await.unwrap();
        let from_file: Vec<_> = sales
            .iter()
            .filter(|s| s.source_filename == "20250115-store.csv")
            .collect();
        assert_eq!(from_file.len(), 1);
        assert_eq!(from_file[0].quantity, 100);
    }

    #[tokio::test]
    async fn confirm_without_a_vaulted_file_is_a_distinct_error() {
        let fx = fixture().await;
        let err = fx
            .pipeline
            .confirm("20250115-store.csv", "deadbeef")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UploadMissing(_)));
    }

    #[tokio::test]
    async fn zero_matching_rows_is_success_and_logs_the_upload() {
        let fx = fixture().await;
        let food_only = "商品名,カテゴリ,単価,税率,割引,店舗,担当,販売本数\n\
                         ポテトサラダ,食品,300,8,0,本店,佐藤,50\n";
        let outcome = fx
            .pipeline
            .ingest("20250115-store.csv", food_only.as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::NoMatchingRows);
        assert!(fx.pipeline.list_sales().await.unwrap().is_empty());

        // Re-sending the same bytes now needs confirmation: the upload was
        // logged even though no row survived.
        let again = fx
            .pipeline
            .ingest("20250115-store.csv", food_only.as_bytes())
            .await
            .unwrap();
        assert!(matches!(again, IngestOutcome::ConfirmationRequired { .. }));
    }

    #[tokio::test]
    async fn validation_failures_abort_before_any_store_mutation() {
        let fx = fixture().await;

        let err = fx
            .pipeline
            .ingest("sales.csv", CSV.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation(IngestError::InvalidFilename(_))
        ));

        let err = fx
            .pipeline
            .ingest("20250115-store.csv", b"")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation(IngestError::EmptyInput)
        ));

        let no_quantity = "商品名,カテゴリ\n瓶ビール(大),お酒類\n";
        let err = fx
            .pipeline
            .ingest("20250115-store.csv", no_quantity.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation(IngestError::MissingColumn(_))
        ));

        let undecodable: &[u8] = &[0xff, 0xff, 0x80];
        let err = fx
            .pipeline
            .ingest("20250115-store.csv", undecodable)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation(IngestError::Decode)
        ));

        assert!(fx.pipeline.list_sales().await.unwrap().is_empty());
        let hash = kura_ingest::fingerprint(undecodable);
        assert!(fx
            .pipeline
            .store()
            .upload_by_hash(&hash)
            .await
            .unwrap()
            .is_none());
        let hash = kura_ingest::fingerprint(CSV.as_bytes());
        assert!(fx
            .pipeline
            .store()
            .upload_by_hash(&hash)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mirror_failure_degrades_but_keeps_local_data() {
        let fx = fixture_with_ledger(Arc::new(MemoryLedgerClient::failing_after(0))).await;
        let outcome = fx
            .pipeline
            .ingest("20250115-store.csv", CSV.as_bytes())
            .await
            .unwrap();

        match outcome {
            IngestOutcome::Ingested { mirror, .. } => match mirror {
                MirrorStatus::Failed { mirrored, .. } => assert_eq!(mirrored, 0),
                other => panic!("unexpected mirror status: {other:?}"),
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(fx.pipeline.list_sales().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_skips_entry_ids_already_in_the_partition() {
        let ledger = Arc::new(MemoryLedgerClient::with_existing_ids([
            "250115-001",
            "250115-003",
        ]));
        let fx = fixture_with_ledger(ledger).await;

        let two_products = "商品名,カテゴリ,単価,税率,割引,店舗,担当,販売本数\n\
                            瓶ビール(大),お酒類,650,10,0,本店,佐藤,100\n\
                            純米酒 300ml,お酒類,900,10,0,本店,佐藤,30\n";
        fx.pipeline
            .ingest("20250115-store.csv", two_products.as_bytes())
            .await
            .unwrap();

        let (summaries, _) = fx.ledger.snapshot();
        let ids: Vec<_> = summaries.iter().map(|s| s.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["250115-002", "250115-004"]);
    }

    #[tokio::test]
    async fn export_produces_a_spreadsheet_byte_stream() {
        let fx = fixture().await;
        fx.pipeline
            .ingest("20250115-store.csv", CSV.as_bytes())
            .await
            .unwrap();

        let bytes = fx.pipeline.export_xlsx().await.unwrap();
        // xlsx is a zip container.
        assert_eq!(&bytes[..2], b"PK");
    }
}
