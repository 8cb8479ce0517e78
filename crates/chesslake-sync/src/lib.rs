//! Orchestration: configuration, monthly extraction and warehouse loads.

use std::path::PathBuf;

use chesslake_core::{Period, Platform};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

mod config;
mod extract;
mod load;

pub use config::{PipelineConfig, WarehouseBackend};
pub use extract::ExtractPipeline;
pub use load::{LoadPipeline, LoadReport, LoadSummary};

pub const CRATE_NAME: &str = "chesslake-sync";

/// What one month's extraction produced.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodReport {
    pub platform: Platform,
    pub period: Period,
    pub fetched: usize,
    pub written: usize,
    pub skipped: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedPeriod {
    pub period: Period,
    pub error: String,
}

/// One extraction run. `run_id` is the id the adapters log under.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub platform: Platform,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub periods: Vec<PeriodReport>,
    pub failed: Vec<FailedPeriod>,
}

impl RunSummary {
    pub(crate) fn start(platform: Platform, run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            platform,
            started_at: now,
            finished_at: now,
            periods: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn games_written(&self) -> usize {
        self.periods.iter().map(|p| p.written).sum()
    }

    pub fn games_skipped(&self) -> usize {
        self.periods.iter().map(|p| p.skipped).sum()
    }
}

/// The month before today, the default target of scheduled runs.
pub fn previous_period() -> Period {
    Period::preceding(Utc::now().date_naive())
}
