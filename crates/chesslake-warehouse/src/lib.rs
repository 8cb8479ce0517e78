//! Append-only loads of monthly NDJSON files into partitioned game tables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chesslake_core::Platform;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

mod bigquery;
mod local;
mod schema;

pub use bigquery::{BigQueryConfig, BigQueryWarehouse, JobState, BIGQUERY_API_BASE};
pub use local::LocalWarehouse;
pub use schema::{schema_for, FieldMode, FieldType, SchemaError, SchemaField, TableSchema};

pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Fully qualified `project.dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// `raw_games_{platform}` in the given dataset.
    pub fn raw_games(project: &str, dataset: &str, platform: Platform) -> Self {
        Self::new(project, dataset, format!("raw_games_{}", platform.as_str()))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceFormat {
    NewlineDelimitedJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    WriteAppend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaUpdateOption {
    AllowFieldRelaxation,
}

/// Partitioning on ingestion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimePartitioning {
    Month,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJobConfig {
    pub schema: TableSchema,
    pub source_format: SourceFormat,
    pub write_disposition: WriteDisposition,
    pub time_partitioning: TimePartitioning,
    pub schema_update_options: Vec<SchemaUpdateOption>,
    pub timeout: Duration,
}

impl LoadJobConfig {
    pub fn for_platform(platform: Platform) -> Self {
        Self {
            schema: schema_for(platform),
            source_format: SourceFormat::NewlineDelimitedJson,
            write_disposition: WriteDisposition::WriteAppend,
            time_partitioning: TimePartitioning::Month,
            schema_update_options: vec![SchemaUpdateOption::AllowFieldRelaxation],
            timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn allows_relaxation(&self) -> bool {
        self.schema_update_options
            .contains(&SchemaUpdateOption::AllowFieldRelaxation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutcome {
    pub job_id: String,
    pub rows_loaded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub num_rows: u64,
    pub num_columns: usize,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("warehouse request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("warehouse api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected warehouse response: {0}")]
    Response(String),
    #[error("load job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },
    #[error("load job {job_id} still running after {waited:?}")]
    Timeout { job_id: String, waited: Duration },
    #[error("{path} line {line}: {reason}")]
    InvalidRow { path: PathBuf, line: usize, reason: String },
    #[error("table {0} does not exist")]
    TableNotFound(String),
    #[error("parquet: {0}")]
    Parquet(String),
}

impl WarehouseError {
    /// Timeouts, 429s, 5xx and transport failures may succeed on a second try.
    pub fn is_retryable(&self) -> bool {
        match self {
            WarehouseError::Timeout { .. } => true,
            WarehouseError::Api { status, .. } => *status == 429 || *status >= 500,
            WarehouseError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

impl From<parquet::errors::ParquetError> for WarehouseError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        WarehouseError::Parquet(err.to_string())
    }
}

impl From<arrow_schema::ArrowError> for WarehouseError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        WarehouseError::Parquet(err.to_string())
    }
}

pub(crate) fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> WarehouseError + 'a {
    move |source| WarehouseError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fresh id for a load job. Submitting the same id twice loads once.
pub fn new_job_id() -> String {
    format!("chesslake_{}", Uuid::new_v4().simple())
}

/// Loads are split into submit and wait so a caller can retry a slow wait
/// without appending the same file again.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start appending every line of `path` to `table` under `job_id`,
    /// creating the table on first load. An id the warehouse already knows
    /// is not submitted again.
    async fn submit_load(
        &self,
        table: &TableRef,
        path: &Path,
        config: &LoadJobConfig,
        job_id: &str,
    ) -> Result<(), WarehouseError>;

    /// Wait up to `config.timeout` for a submitted job. The job keeps running
    /// after a `Timeout`, and waiting on it again is safe.
    async fn wait_for_load(
        &self,
        table: &TableRef,
        job_id: &str,
        config: &LoadJobConfig,
    ) -> Result<LoadOutcome, WarehouseError>;

    async fn load_ndjson(
        &self,
        table: &TableRef,
        path: &Path,
        config: &LoadJobConfig,
    ) -> Result<LoadOutcome, WarehouseError> {
        let job_id = new_job_id();
        self.submit_load(table, path, config, &job_id).await?;
        self.wait_for_load(table, &job_id, config).await
    }

    async fn table_info(&self, table: &TableRef) -> Result<TableInfo, WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_refs_render_dotted() {
        let table = TableRef::raw_games("proj", "dev_games", Platform::ChessCom);
        assert_eq!(table.to_string(), "proj.dev_games.raw_games_chesscom");
    }

    #[test]
    fn load_config_appends_with_relaxation() {
        let config = LoadJobConfig::for_platform(Platform::Lichess).with_timeout(Duration::from_secs(5));
        assert_eq!(config.write_disposition, WriteDisposition::WriteAppend);
        assert_eq!(config.time_partitioning, TimePartitioning::Month);
        assert!(config.allows_relaxation());
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(
            serde_json::to_value(config.source_format).unwrap(),
            "NEWLINE_DELIMITED_JSON"
        );
        assert_eq!(
            serde_json::to_value(config.schema_update_options).unwrap(),
            serde_json::json!(["ALLOW_FIELD_RELAXATION"])
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(WarehouseError::Timeout {
            job_id: "j".into(),
            waited: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(WarehouseError::Api {
            status: 503,
            message: "backend".into()
        }
        .is_retryable());
        assert!(!WarehouseError::Api {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!WarehouseError::JobFailed {
            job_id: "j".into(),
            reason: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn sha256_is_hex_encoded() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
