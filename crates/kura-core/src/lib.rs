//! Core domain model for Kura.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kura-core";

/// One normalized sale line, ready for persistence.
///
/// `product_name` is always a canonical label produced by the product map;
/// rows that fail mapping never become a `SalesRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesRecord {
    pub date: NaiveDate,
    pub product_name: String,
    pub quantity: i64,
    pub source_filename: String,
}

impl SalesRecord {
    pub fn new(
        date: NaiveDate,
        product_name: impl Into<String>,
        quantity: i64,
        source_filename: impl Into<String>,
    ) -> Self {
        Self {
            date,
            product_name: product_name.into(),
            quantity: quantity.max(0),
            source_filename: source_filename.into(),
        }
    }
}

/// A persisted sale line with its row id, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSale {
    pub id: i64,
    pub date: NaiveDate,
    pub product_name: String,
    pub quantity: i64,
    pub source_filename: String,
}

/// One previously accepted file in the upload log.
///
/// `content_hash` is globally unique; a byte-identical re-upload is detected
/// by hash equality regardless of the filename it arrives under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub filename: String,
    pub content_hash: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Outcome of the ledger reconciliation phase. Never fatal to the ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MirrorStatus {
    /// Every row landed in the external ledger.
    Mirrored { rows: usize },
    /// No ledger client configured for this deployment.
    Skipped,
    /// Local data is durable but the mirror is behind by `rows - mirrored`.
    Failed { mirrored: usize, reason: String },
}

/// Terminal result of one ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Rows were persisted locally; `dropped_unmapped` counts lines excluded
    /// because their product label had no canonical mapping.
    Ingested {
        inserted: usize,
        dropped_unmapped: usize,
        mirror: MirrorStatus,
    },
    /// Decode succeeded but nothing matched the target category. Success.
    NoMatchingRows,
    /// Same content hash was accepted before; nothing was mutated. The
    /// caller must confirm with the same filename and hash to reprocess.
    ConfirmationRequired {
        filename: String,
        content_hash: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_quantities_clamp_to_zero() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let record = SalesRecord::new(date, "瓶ビール大", -4, "20250115-store.csv");
        assert_eq!(record.quantity, 0);
    }
}
