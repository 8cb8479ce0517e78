use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chesslake_adapters::{AccountConfig, OpponentLookupPolicy, CHESSCOM_API_BASE, LICHESS_API_BASE};
use chesslake_core::Platform;
use chesslake_storage::{HttpClientConfig, RateLimit};
use chesslake_warehouse::{
    BigQueryConfig, BigQueryWarehouse, LoadJobConfig, LocalWarehouse, TableRef, Warehouse, BIGQUERY_API_BASE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarehouseBackend {
    BigQuery,
    Local,
}

impl FromStr for WarehouseBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bigquery" | "bq" => Ok(Self::BigQuery),
            "local" | "parquet" => Ok(Self::Local),
            other => Err(anyhow!("unknown warehouse backend `{other}` (expected bigquery or local)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chesscom_user: Option<String>,
    pub lichess_user: Option<String>,
    pub lichess_token: Option<String>,
    pub data_dir: PathBuf,
    pub chesscom_api_base: String,
    pub lichess_api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub concurrency: usize,
    pub max_rps: Option<u32>,
    pub lookup_policy: OpponentLookupPolicy,
    pub warehouse_backend: WarehouseBackend,
    pub warehouse_dir: PathBuf,
    pub warehouse_env: String,
    pub bigquery_project: Option<String>,
    pub bigquery_dataset: Option<String>,
    pub bigquery_location: Option<String>,
    pub bigquery_api_base: String,
    pub google_access_token: Option<String>,
    pub load_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chesscom_user: None,
            lichess_user: None,
            lichess_token: None,
            data_dir: PathBuf::from("./games_data"),
            chesscom_api_base: CHESSCOM_API_BASE.to_string(),
            lichess_api_base: LICHESS_API_BASE.to_string(),
            user_agent: concat!("chesslake/", env!("CARGO_PKG_VERSION")).to_string(),
            http_timeout_secs: 30,
            concurrency: 4,
            max_rps: None,
            lookup_policy: OpponentLookupPolicy::Skip,
            warehouse_backend: WarehouseBackend::Local,
            warehouse_dir: PathBuf::from("./warehouse"),
            warehouse_env: "dev".to_string(),
            bigquery_project: None,
            bigquery_dataset: None,
            bigquery_location: None,
            bigquery_api_base: BIGQUERY_API_BASE.to_string(),
            google_access_token: None,
            load_timeout_secs: 600,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parse_num = |key: &str| -> Result<Option<u64>> {
            get(key)
                .map(|v| v.parse::<u64>().with_context(|| format!("{key} must be a whole number, got `{v}`")))
                .transpose()
        };
        let defaults = Self::default();

        Ok(Self {
            chesscom_user: get("CHESSCOM_USER"),
            lichess_user: get("LICHESS_USER"),
            lichess_token: get("LICHESS_TOKEN"),
            data_dir: get("GAMES_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            chesscom_api_base: get("CHESSCOM_API_BASE").unwrap_or(defaults.chesscom_api_base),
            lichess_api_base: get("LICHESS_API_BASE").unwrap_or(defaults.lichess_api_base),
            user_agent: get("CHESSLAKE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parse_num("CHESSLAKE_HTTP_TIMEOUT_SECS")?.unwrap_or(defaults.http_timeout_secs),
            concurrency: parse_num("CHESSLAKE_CONCURRENCY")?
                .map(|n| n.max(1) as usize)
                .unwrap_or(defaults.concurrency),
            max_rps: parse_num("CHESSLAKE_MAX_RPS")?
                .filter(|n| *n > 0)
                .map(|n| n.min(u64::from(u32::MAX)) as u32),
            lookup_policy: get("CHESSLAKE_OPPONENT_LOOKUP")
                .map(|v| v.parse::<OpponentLookupPolicy>().map_err(|e| anyhow!(e)))
                .transpose()
                .context("CHESSLAKE_OPPONENT_LOOKUP")?
                .unwrap_or_default(),
            warehouse_backend: get("WAREHOUSE_BACKEND")
                .map(|v| v.parse::<WarehouseBackend>())
                .transpose()?
                .unwrap_or(defaults.warehouse_backend),
            warehouse_dir: get("WAREHOUSE_DIR").map(PathBuf::from).unwrap_or(defaults.warehouse_dir),
            warehouse_env: get("WAREHOUSE_ENV").unwrap_or(defaults.warehouse_env),
            bigquery_project: get("BIGQUERY_PROJECT"),
            bigquery_dataset: get("BIGQUERY_DATASET"),
            bigquery_location: get("BIGQUERY_LOCATION"),
            bigquery_api_base: get("BIGQUERY_API_BASE").unwrap_or(defaults.bigquery_api_base),
            google_access_token: get("GOOGLE_OAUTH_ACCESS_TOKEN"),
            load_timeout_secs: parse_num("WAREHOUSE_LOAD_TIMEOUT_SECS")?.unwrap_or(defaults.load_timeout_secs),
        })
    }

    pub fn account(&self, platform: Platform) -> Result<AccountConfig> {
        let (user, key, base) = match platform {
            Platform::ChessCom => (&self.chesscom_user, "CHESSCOM_USER", &self.chesscom_api_base),
            Platform::Lichess => (&self.lichess_user, "LICHESS_USER", &self.lichess_api_base),
        };
        let user = user
            .as_deref()
            .with_context(|| format!("{key} is not set; cannot extract {platform} games"))?;
        let account = AccountConfig::new(platform, user).with_api_base(base.as_str());
        Ok(match platform {
            Platform::Lichess => account.with_token(self.lichess_token.clone()),
            Platform::ChessCom => account,
        })
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.concurrency * Platform::ALL.len(),
            rate_limit: self.max_rps.map(RateLimit::per_second),
            ..HttpClientConfig::default()
        }
        .with_platform_limit(Platform::ChessCom, self.concurrency)
    }

    /// `BIGQUERY_DATASET`, else `{env}_games`.
    pub fn dataset(&self) -> String {
        self.bigquery_dataset
            .clone()
            .unwrap_or_else(|| format!("{}_games", self.warehouse_env))
    }

    pub fn table_for(&self, platform: Platform) -> TableRef {
        let project = self.bigquery_project.as_deref().unwrap_or("local");
        TableRef::raw_games(project, &self.dataset(), platform)
    }

    pub fn load_config(&self, platform: Platform) -> LoadJobConfig {
        LoadJobConfig::for_platform(platform).with_timeout(Duration::from_secs(self.load_timeout_secs))
    }

    pub fn build_warehouse(&self) -> Result<Box<dyn Warehouse>> {
        match self.warehouse_backend {
            WarehouseBackend::Local => Ok(Box::new(LocalWarehouse::new(self.warehouse_dir.clone()))),
            WarehouseBackend::BigQuery => {
                if self.bigquery_project.is_none() {
                    bail!("BIGQUERY_PROJECT is required for the bigquery backend");
                }
                let token = self
                    .google_access_token
                    .clone()
                    .context("GOOGLE_OAUTH_ACCESS_TOKEN is required for the bigquery backend")?;
                let mut config = BigQueryConfig::new(token);
                config.api_base = self.bigquery_api_base.clone();
                config.location = self.bigquery_location.clone();
                Ok(Box::new(BigQueryWarehouse::new(config).context("building bigquery client")?))
            }
        }
    }
}
