use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chesslake_core::{Period, Platform};
use chesslake_storage::NdjsonSink;
use chesslake_warehouse::{new_job_id, LoadJobConfig, LoadOutcome, TableRef, Warehouse, WarehouseError};
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub period: Period,
    pub source_file: PathBuf,
    pub job_id: String,
    pub rows_loaded: u64,
    pub table_rows: u64,
    pub table_columns: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub loads: Vec<LoadReport>,
    pub missing: Vec<Period>,
}

impl LoadSummary {
    pub fn rows_loaded(&self) -> u64 {
        self.loads.iter().map(|l| l.rows_loaded).sum()
    }
}

/// Appends monthly NDJSON files to one platform's warehouse table.
pub struct LoadPipeline {
    warehouse: Box<dyn Warehouse>,
    sink: NdjsonSink,
    table: TableRef,
    config: LoadJobConfig,
    platform: Platform,
}

impl LoadPipeline {
    pub fn new(
        warehouse: Box<dyn Warehouse>,
        sink: NdjsonSink,
        table: TableRef,
        config: LoadJobConfig,
        platform: Platform,
    ) -> Self {
        Self {
            warehouse,
            sink,
            table,
            config,
            platform,
        }
    }

    pub fn from_config(config: &PipelineConfig, platform: Platform) -> Result<Self> {
        Ok(Self::new(
            config.build_warehouse()?,
            NdjsonSink::new(config.data_dir.clone()),
            config.table_for(platform),
            config.load_config(platform),
            platform,
        ))
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Load one month's file. A missing file is an error.
    pub async fn load_period(&self, period: Period) -> Result<LoadReport> {
        let path = self.sink.path_for(self.platform, period);
        if !file_exists(&path).await? {
            bail!("no {} file for {period} at {}", self.platform, path.display());
        }
        self.load_file(period, path).await
    }

    /// Load every month in `[from, to]`, warning past months that were never
    /// extracted. Load failures stop the run.
    pub async fn load_backfill(&self, from: Period, to: Period) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        for period in Period::range_inclusive(from, to) {
            let path = self.sink.path_for(self.platform, period);
            if !file_exists(&path).await? {
                warn!(platform = %self.platform, %period, path = %path.display(), "no file to load");
                summary.missing.push(period);
                continue;
            }
            summary.loads.push(self.load_file(period, path).await?);
        }
        Ok(summary)
    }

    async fn load_file(&self, period: Period, path: PathBuf) -> Result<LoadReport> {
        let outcome = self
            .load_with_retry(&path)
            .await
            .with_context(|| format!("loading {} into {}", path.display(), self.table))?;
        let info = self
            .warehouse
            .table_info(&self.table)
            .await
            .with_context(|| format!("reading {} metadata", self.table))?;

        let message = format!(
            "Loaded {} rows and {} columns to {}",
            info.num_rows, info.num_columns, self.table
        );
        info!(
            warehouse = self.warehouse.name(),
            %period,
            job_id = %outcome.job_id,
            rows = outcome.rows_loaded,
            "{message}"
        );
        Ok(LoadReport {
            period,
            source_file: path,
            job_id: outcome.job_id,
            rows_loaded: outcome.rows_loaded,
            table_rows: info.num_rows,
            table_columns: info.num_columns,
            message,
        })
    }

    /// One job id per file. A retryable failure gets one more try: a failed
    /// submit is resubmitted under the same id, a timed-out wait is waited
    /// again, so the file is never appended twice.
    async fn load_with_retry(&self, path: &Path) -> Result<LoadOutcome, WarehouseError> {
        let job_id = new_job_id();
        let mut retried = false;

        loop {
            match self.warehouse.submit_load(&self.table, path, &self.config, &job_id).await {
                Ok(()) => break,
                Err(err) if err.is_retryable() && !retried => {
                    warn!(table = %self.table, %job_id, error = %err, "submit failed; resubmitting once");
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }

        loop {
            match self.warehouse.wait_for_load(&self.table, &job_id, &self.config).await {
                Err(err) if err.is_retryable() && !retried => {
                    warn!(table = %self.table, %job_id, error = %err, "load not finished; waiting once more");
                    retried = true;
                }
                other => return other,
            }
        }
    }
}

async fn file_exists(path: &Path) -> Result<bool> {
    fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chesslake_warehouse::TableInfo;
    use tempfile::TempDir;

    use super::*;

    /// Records every call; the first `wait_failures` waits time out.
    #[derive(Default)]
    struct ScriptedWarehouse {
        submit_failures: Mutex<u32>,
        wait_failures: Mutex<u32>,
        submits: Mutex<Vec<String>>,
        waits: Mutex<Vec<String>>,
    }

    impl ScriptedWarehouse {
        fn failing(submit_failures: u32, wait_failures: u32) -> Self {
            Self {
                submit_failures: Mutex::new(submit_failures),
                wait_failures: Mutex::new(wait_failures),
                ..Self::default()
            }
        }
    }

    fn take_failure(counter: &Mutex<u32>) -> bool {
        let mut left = counter.lock().unwrap();
        let fail = *left > 0;
        *left = left.saturating_sub(1);
        fail
    }

    #[async_trait]
    impl Warehouse for ScriptedWarehouse {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn submit_load(
            &self,
            _table: &TableRef,
            _path: &Path,
            _config: &LoadJobConfig,
            job_id: &str,
        ) -> Result<(), WarehouseError> {
            self.submits.lock().unwrap().push(job_id.to_string());
            if take_failure(&self.submit_failures) {
                return Err(WarehouseError::Api {
                    status: 503,
                    message: "backend unavailable".into(),
                });
            }
            Ok(())
        }

        async fn wait_for_load(
            &self,
            _table: &TableRef,
            job_id: &str,
            config: &LoadJobConfig,
        ) -> Result<LoadOutcome, WarehouseError> {
            self.waits.lock().unwrap().push(job_id.to_string());
            if take_failure(&self.wait_failures) {
                return Err(WarehouseError::Timeout {
                    job_id: job_id.to_string(),
                    waited: config.timeout,
                });
            }
            Ok(LoadOutcome {
                job_id: job_id.to_string(),
                rows_loaded: 3,
            })
        }

        async fn table_info(&self, _table: &TableRef) -> Result<TableInfo, WarehouseError> {
            Ok(TableInfo {
                num_rows: 3,
                num_columns: 26,
            })
        }
    }

    async fn run(warehouse: &Arc<ScriptedWarehouse>, data_dir: &TempDir) -> Result<LoadReport> {
        let platform = Platform::Lichess;
        let period: Period = "2024-08".parse().unwrap();
        let sink = NdjsonSink::new(data_dir.path());
        let path = sink.path_for(platform, period);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, "{}\n").await.unwrap();

        let pipeline = LoadPipeline::new(
            Box::new(Shared(Arc::clone(warehouse))),
            sink,
            TableRef::raw_games("proj", "dev_games", platform),
            LoadJobConfig::for_platform(platform).with_timeout(Duration::from_millis(10)),
            platform,
        );
        pipeline.load_period(period).await
    }

    /// Lets a test keep the warehouse it hands to the pipeline.
    struct Shared(Arc<ScriptedWarehouse>);

    #[async_trait]
    impl Warehouse for Shared {
        fn name(&self) -> &'static str {
            self.0.name()
        }

        async fn submit_load(
            &self,
            table: &TableRef,
            path: &Path,
            config: &LoadJobConfig,
            job_id: &str,
        ) -> Result<(), WarehouseError> {
            self.0.submit_load(table, path, config, job_id).await
        }

        async fn wait_for_load(
            &self,
            table: &TableRef,
            job_id: &str,
            config: &LoadJobConfig,
        ) -> Result<LoadOutcome, WarehouseError> {
            self.0.wait_for_load(table, job_id, config).await
        }

        async fn table_info(&self, table: &TableRef) -> Result<TableInfo, WarehouseError> {
            self.0.table_info(table).await
        }
    }

    #[tokio::test]
    async fn timed_out_wait_is_retried_without_resubmitting() {
        let data_dir = TempDir::new().unwrap();
        let warehouse = Arc::new(ScriptedWarehouse::failing(0, 1));
        let report = run(&warehouse, &data_dir).await.expect("load succeeds on the second wait");

        let submits = warehouse.submits.lock().unwrap().clone();
        let waits = warehouse.waits.lock().unwrap().clone();
        assert_eq!(submits.len(), 1);
        assert_eq!(waits, [submits[0].clone(), submits[0].clone()]);
        assert_eq!(report.job_id, submits[0]);
        assert_eq!(report.rows_loaded, 3);
    }

    #[tokio::test]
    async fn failed_submit_is_resubmitted_under_the_same_id() {
        let data_dir = TempDir::new().unwrap();
        let warehouse = Arc::new(ScriptedWarehouse::failing(1, 0));
        run(&warehouse, &data_dir).await.expect("second submit goes through");

        let submits = warehouse.submits.lock().unwrap().clone();
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[0], submits[1]);
        assert_eq!(warehouse.waits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_one_retry_per_file() {
        let data_dir = TempDir::new().unwrap();
        let warehouse = Arc::new(ScriptedWarehouse::failing(1, 1));
        let err = run(&warehouse, &data_dir).await.unwrap_err();
        let cause = err.downcast_ref::<WarehouseError>().expect("warehouse error");
        assert!(matches!(cause, WarehouseError::Timeout { .. }), "{err:#}");
        assert_eq!(warehouse.submits.lock().unwrap().len(), 2);
        assert_eq!(warehouse.waits.lock().unwrap().len(), 1);
    }
}
