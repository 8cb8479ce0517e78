use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chesslake_adapters::{adapter_for, record_label, AdapterContext, PlatformAdapter, RawGame};
use chesslake_core::{GameRow, Period, Platform};
use chesslake_storage::{HttpFetcher, JsonSource, MonthlyBatch, NdjsonSink};
use chrono::{NaiveDate, NaiveTime, Utc};
use futures_util::{stream, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::{FailedPeriod, PeriodReport, RunSummary};

/// Fetch, normalize and persist one platform's games, a month at a time.
pub struct ExtractPipeline {
    adapter: Box<dyn PlatformAdapter>,
    source: Arc<dyn JsonSource>,
    sink: NdjsonSink,
    ctx: AdapterContext,
    concurrency: usize,
}

impl ExtractPipeline {
    pub fn new(
        adapter: Box<dyn PlatformAdapter>,
        source: Arc<dyn JsonSource>,
        sink: NdjsonSink,
        ctx: AdapterContext,
        concurrency: usize,
    ) -> Self {
        Self {
            adapter,
            source,
            sink,
            ctx,
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_config(config: &PipelineConfig, platform: Platform) -> Result<Self> {
        let account = config.account(platform)?;
        let http = HttpFetcher::new(config.http_config()).context("building http client")?;
        Ok(Self::new(
            adapter_for(&account),
            Arc::new(http),
            NdjsonSink::new(config.data_dir.clone()),
            AdapterContext::new(config.lookup_policy),
            config.concurrency,
        ))
    }

    pub fn platform(&self) -> Platform {
        self.adapter.platform()
    }

    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    pub fn sink(&self) -> &NdjsonSink {
        &self.sink
    }

    /// Normalize in input order. Non-fatal errors drop the game; the first
    /// fatal error aborts the whole batch.
    pub async fn normalize_all(&self, raws: &[RawGame]) -> Result<(Vec<GameRow>, usize)> {
        let adapter = self.adapter.as_ref();
        let source = self.source.as_ref();
        let ctx = &self.ctx;

        let results = stream::iter(raws.iter())
            .map(move |raw| async move { (raw, adapter.normalize(source, ctx, raw).await) })
            .buffered(self.concurrency);
        futures_util::pin_mut!(results);

        let mut rows = Vec::with_capacity(raws.len());
        let mut skipped = 0usize;
        while let Some((raw, result)) = results.next().await {
            match result {
                Ok(row) => {
                    debug!(game_id = %row.game_id, "game normalized");
                    rows.push(row);
                }
                Err(err) if err.is_fatal() => {
                    return Err(anyhow!(err)).with_context(|| format!("normalizing {}", record_label(raw)));
                }
                Err(err) => {
                    warn!(record = %record_label(raw), error = %err, "skipping game");
                    skipped += 1;
                }
            }
        }
        Ok((rows, skipped))
    }

    /// Extract one month and replace its file. Nothing is written unless
    /// every game in the month was handled.
    pub async fn extract_period(&self, period: Period) -> Result<PeriodReport> {
        let known = self
            .adapter
            .available_periods(self.source.as_ref())
            .await
            .with_context(|| format!("listing {} archives", self.platform()))?;
        self.extract_known_period(period, known.as_ref()).await
    }

    async fn extract_known_period(&self, period: Period, known: Option<&BTreeSet<Period>>) -> Result<PeriodReport> {
        let platform = self.platform();
        let span = info_span!("period", run_id = %self.ctx.run_id, %platform, %period);
        async move {
            let raws = match known {
                Some(known) if !known.contains(&period) => {
                    info!("no archive for period; writing empty batch");
                    Vec::new()
                }
                _ => self
                    .adapter
                    .fetch_period(self.source.as_ref(), period)
                    .await
                    .with_context(|| format!("fetching {platform} games for {period}"))?,
            };
            info!(games = raws.len(), "fetched period");
            self.write_period(period, &raws).await
        }
        .instrument(span)
        .await
    }

    async fn write_period(&self, period: Period, raws: &[RawGame]) -> Result<PeriodReport> {
        let platform = self.platform();
        let (rows, skipped) = self.normalize_all(raws).await?;

        let mut batch = MonthlyBatch::new(platform, period);
        let mut duplicates = 0usize;
        for row in rows {
            if !batch.push(row) {
                duplicates += 1;
            }
        }
        if duplicates > 0 {
            warn!(duplicates, "dropped games repeated within the period");
        }

        let path = self
            .sink
            .flush(&batch)
            .await
            .with_context(|| format!("writing {platform} batch for {period}"))?;
        let report = PeriodReport {
            platform,
            period,
            fetched: raws.len(),
            written: batch.len(),
            skipped: skipped + duplicates,
            path,
        };
        info!(written = report.written, skipped = report.skipped, "period extracted");
        Ok(report)
    }

    /// Extract every month in `[from, to]`. A failed month is logged and
    /// recorded in the summary; the run moves on.
    pub async fn backfill(&self, from: Period, to: Period) -> Result<RunSummary> {
        let mut summary = RunSummary::start(self.platform(), self.run_id());
        let known = match self.adapter.available_periods(self.source.as_ref()).await {
            Ok(known) => known,
            Err(err) => {
                warn!(platform = %self.platform(), error = %err, "could not list archives; fetching every period");
                None
            }
        };

        for period in Period::range_inclusive(from, to) {
            match self.extract_known_period(period, known.as_ref()).await {
                Ok(report) => summary.periods.push(report),
                Err(err) => {
                    warn!(platform = %self.platform(), %period, error = format!("{err:#}"), "period failed");
                    summary.failed.push(FailedPeriod {
                        period,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Extract games played between two dates, inclusive of both days, and
    /// write one file per month that has games.
    pub async fn extract_range(&self, since: Option<NaiveDate>, until: Option<NaiveDate>) -> Result<RunSummary> {
        let platform = self.platform();
        let mut summary = RunSummary::start(platform, self.run_id());
        let since_ms = since.map(|d| d.and_time(NaiveTime::MIN).and_utc().timestamp_millis());
        let until_ms = until.map(|d| {
            let next_day = d.succ_opt().unwrap_or(d);
            next_day.and_time(NaiveTime::MIN).and_utc().timestamp_millis() - 1
        });

        let raws = self
            .adapter
            .fetch_range(self.source.as_ref(), since_ms, until_ms)
            .await
            .with_context(|| format!("fetching {platform} games"))?;
        info!(%platform, games = raws.len(), "fetched range");

        let mut grouped: BTreeMap<Period, Vec<RawGame>> = BTreeMap::new();
        for raw in raws {
            match self.adapter.period_of(&raw) {
                Some(period) => grouped.entry(period).or_default().push(raw),
                None => warn!(%platform, record = %record_label(&raw), "game has no timestamp; skipping"),
            }
        }

        for (period, raws) in grouped {
            let span = info_span!("period", run_id = %self.ctx.run_id, %platform, %period);
            match self.write_period(period, &raws).instrument(span).await {
                Ok(report) => summary.periods.push(report),
                Err(err) => {
                    warn!(%platform, %period, error = format!("{err:#}"), "period failed");
                    summary.failed.push(FailedPeriod {
                        period,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        summary.finished_at = Utc::now();
        Ok(summary)
    }
}
