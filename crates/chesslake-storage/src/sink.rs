//! Monthly NDJSON batches on local disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chesslake_core::{GameRow, Period, Platform};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding row {game_id}: {source}")]
    Encode {
        game_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} line {line}: {source}")]
    Decode {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> SinkError + 'a {
    move |source| SinkError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Ordered rows for one (platform, month). `game_id` is unique within a batch.
#[derive(Debug, Clone)]
pub struct MonthlyBatch {
    platform: Platform,
    period: Period,
    rows: Vec<GameRow>,
    seen: HashSet<String>,
}

impl MonthlyBatch {
    pub fn new(platform: Platform, period: Period) -> Self {
        Self {
            platform,
            period,
            rows: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn period(&self) -> Period {
        self.period
    }

    /// Returns false (and keeps the first row) when the id is already present.
    pub fn push(&mut self, row: GameRow) -> bool {
        if !self.seen.insert(row.game_id.clone()) {
            warn!(
                platform = %self.platform,
                period = %self.period,
                game_id = %row.game_id,
                "duplicate game id in batch; keeping the first row"
            );
            return false;
        }
        self.rows.push(row);
        true
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[GameRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<GameRow> {
        self.rows
    }

    pub fn to_ndjson(&self) -> Result<Vec<u8>, SinkError> {
        let mut out = Vec::new();
        for row in &self.rows {
            serde_json::to_writer(&mut out, row).map_err(|source| SinkError::Encode {
                game_id: row.game_id.clone(),
                source,
            })?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct NdjsonSink {
    root: PathBuf,
}

impl NdjsonSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/{platform}/{year}_{month:02}.ndjson`
    pub fn path_for(&self, platform: Platform, period: Period) -> PathBuf {
        self.root.join(platform.as_str()).join(period.file_name())
    }

    /// Replace the period's file with the batch, atomically via temp file + rename.
    pub async fn flush(&self, batch: &MonthlyBatch) -> Result<PathBuf, SinkError> {
        let path = self.path_for(batch.platform(), batch.period());
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(io_err("creating directory", &parent))?;

        let bytes = batch.to_ndjson()?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err("opening temp file", &temp_path))?;
        file.write_all(&bytes)
            .await
            .map_err(io_err("writing temp file", &temp_path))?;
        file.flush()
            .await
            .map_err(io_err("flushing temp file", &temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(SinkError::Io {
                action: "renaming temp file into",
                path,
                source,
            });
        }

        info!(
            platform = %batch.platform(),
            period = %batch.period(),
            rows = batch.len(),
            path = %path.display(),
            "batch written"
        );
        Ok(path)
    }

    /// `None` when the period was never extracted.
    pub async fn read(&self, platform: Platform, period: Period) -> Result<Option<MonthlyBatch>, SinkError> {
        let path = self.path_for(platform, period);
        if !fs::try_exists(&path)
            .await
            .map_err(io_err("checking", &path))?
        {
            return Ok(None);
        }
        let mut batch = MonthlyBatch::new(platform, period);
        for row in read_rows(&path).await? {
            batch.push(row);
        }
        Ok(Some(batch))
    }
}

pub async fn read_rows(path: &Path) -> Result<Vec<GameRow>, SinkError> {
    let text = fs::read_to_string(path).await.map_err(io_err("reading", path))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| SinkError::Decode {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}
