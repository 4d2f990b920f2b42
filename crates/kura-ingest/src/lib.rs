//! Upload parsing for Kura: content fingerprinting, encoding-tolerant CSV
//! decode, category filtering and product-name normalization.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use encoding_rs::SHIFT_JIS;
use kura_core::SalesRecord;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "kura-ingest";

/// Validation-class failures. Each aborts the whole ingestion before any
/// store mutation; per-row problems are recovered inside the normalizer and
/// never surface here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("input is neither valid UTF-8 nor valid Shift_JIS")]
    Decode,
    #[error("input contains no rows")]
    EmptyInput,
    #[error("required column not found in header: {0}")]
    MissingColumn(String),
    #[error("cannot derive a sale date from filename {0:?}: expected a YYYYMMDD prefix")]
    InvalidFilename(String),
    #[error("product map error: {0}")]
    ProductMap(String),
}

/// SHA-256 hex digest of the raw upload bytes, used as the duplicate key.
/// Byte-exact: any content difference, including line endings or encoding,
/// yields a different fingerprint.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Decoded tabular content: one header row plus data rows, both in source
/// order. The header is never counted as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Resolve a required column by exact header match. Column order in the
    /// source file is irrelevant.
    pub fn resolve(&self, name: &str) -> Result<usize, IngestError> {
        self.header
            .iter()
            .position(|cell| cell == name)
            .ok_or_else(|| IngestError::MissingColumn(name.to_string()))
    }
}

fn decode_text(bytes: &[u8]) -> Result<String, IngestError> {
    // Primary: UTF-8, tolerating a leading BOM. Fallback: Shift_JIS, the
    // encoding the POS terminal exports when not configured for UTF-8.
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string());
    }
    let (text, _, had_errors) = SHIFT_JIS.decode(bytes);
    if had_errors {
        return Err(IngestError::Decode);
    }
    Ok(text.into_owned())
}

/// Decode raw upload bytes into header + rows.
pub fn decode_table(bytes: &[u8]) -> Result<Table, IngestError> {
    let text = decode_text(bytes)?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|_| IngestError::Decode)?;
        records.push(record.iter().map(str::to_string).collect());
    }

    if records.is_empty() {
        return Err(IngestError::EmptyInput);
    }

    let header = records.remove(0);
    Ok(Table {
        header,
        rows: records,
    })
}

/// Required column names in the POS export. Configuration data, overridable
/// per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ColumnNames {
    pub category: String,
    pub product: String,
    pub quantity: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            category: "カテゴリ".to_string(),
            product: "商品名".to_string(),
            quantity: "販売本数".to_string(),
        }
    }
}

/// Resolved column positions for one decoded table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SalesColumns {
    pub category: usize,
    pub product: usize,
    pub quantity: usize,
}

impl SalesColumns {
    pub fn resolve(table: &Table, names: &ColumnNames) -> Result<Self, IngestError> {
        Ok(Self {
            category: table.resolve(&names.category)?,
            product: table.resolve(&names.product)?,
            quantity: table.resolve(&names.quantity)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProductMapFile {
    #[allow(dead_code)]
    version: u32,
    products: HashMap<String, String>,
}

/// Static mapping from raw POS product labels to canonical display labels.
/// Loaded from YAML so relabeling never requires a rebuild.
#[derive(Debug, Clone, Default)]
pub struct ProductMap {
    entries: HashMap<String, String>,
}

impl ProductMap {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, IngestError> {
        let file: ProductMapFile =
            serde_yaml::from_str(yaml).map_err(|err| IngestError::ProductMap(err.to_string()))?;
        Ok(Self {
            entries: file.products,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|err| IngestError::ProductMap(format!("{}: {err}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }

    /// Look up a raw label, trimmed of surrounding whitespace. `None` means
    /// the row is not an alcoholic-beverage line and must be excluded.
    pub fn canonical(&self, raw: &str) -> Option<&str> {
        self.entries.get(raw.trim()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of filtering + normalizing one decoded table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub records: Vec<SalesRecord>,
    /// Rows that matched the category but had no product-map entry. Dropped
    /// by design, counted so the blind spot is visible in the result.
    pub dropped_unmapped: usize,
}

/// Category filter + product-name normalizer.
#[derive(Debug, Clone)]
pub struct RowNormalizer {
    pub columns: SalesColumns,
    pub target_category: String,
}

impl RowNormalizer {
    pub fn new(columns: SalesColumns, target_category: impl Into<String>) -> Self {
        Self {
            columns,
            target_category: target_category.into(),
        }
    }

    /// Keep rows whose trimmed category equals the target, remap product
    /// labels through the map, attach date and source filename. Malformed
    /// rows (short rows, non-numeric quantities) are recovered per-row and
    /// never abort the batch. Source row order is preserved.
    pub fn normalize(
        &self,
        rows: &[Vec<String>],
        map: &ProductMap,
        date: NaiveDate,
        source_filename: &str,
    ) -> NormalizedBatch {
        let mut records = Vec::new();
        let mut dropped_unmapped = 0usize;

        for row in rows {
            let Some(category) = row.get(self.columns.category) else {
                continue;
            };
            if category.trim() != self.target_category {
                continue;
            }
            let (Some(raw_product), Some(raw_quantity)) =
                (row.get(self.columns.product), row.get(self.columns.quantity))
            else {
                continue;
            };

            // Non-fatal per-cell recovery: unparseable quantity becomes 0.
            let quantity = raw_quantity.trim().parse::<i64>().unwrap_or(0);

            match map.canonical(raw_product) {
                Some(canonical) => {
                    records.push(SalesRecord::new(date, canonical, quantity, source_filename));
                }
                None => dropped_unmapped += 1,
            }
        }

        NormalizedBatch {
            records,
            dropped_unmapped,
        }
    }
}

/// How the sale date for a batch is derived. The deployed strategy reads it
/// from the filename; a column-derived variant would plug in here.
pub trait DateStrategy: Send + Sync {
    fn resolve(&self, filename: &str) -> Result<NaiveDate, IngestError>;
}

/// Sale date from a fixed-position `YYYYMMDD` filename prefix. A malformed
/// prefix fails the whole ingestion, never a silent fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilenameDatePrefix;

impl DateStrategy for FilenameDatePrefix {
    fn resolve(&self, filename: &str) -> Result<NaiveDate, IngestError> {
        let prefix = filename.get(..8).filter(|p| p.bytes().all(|b| b.is_ascii_digit()));
        let Some(prefix) = prefix else {
            return Err(IngestError::InvalidFilename(filename.to_string()));
        };
        NaiveDate::parse_from_str(prefix, "%Y%m%d")
            .map_err(|_| IngestError::InvalidFilename(filename.to_string()))
    }
}
