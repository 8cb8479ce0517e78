use std::path::PathBuf;
use std::sync::Arc;

use chesslake_adapters::{adapter_for, AccountConfig, AdapterContext, OpponentLookupPolicy};
use chesslake_core::{Period, Platform};
use chesslake_storage::{read_rows, FixtureSource, NdjsonSink};
use chesslake_sync::{ExtractPipeline, LoadPipeline};
use chesslake_warehouse::{LoadJobConfig, LocalWarehouse, TableRef};
use chrono::NaiveDate;
use tempfile::TempDir;

fn fixtures(platform: &str) -> Arc<FixtureSource> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(platform)
        .join("routes.json");
    Arc::new(FixtureSource::from_manifest(path).expect("fixture manifest"))
}

fn pipeline(
    platform: Platform,
    source: Arc<FixtureSource>,
    data_dir: &TempDir,
    policy: OpponentLookupPolicy,
) -> ExtractPipeline {
    let account = AccountConfig::new(platform, "TestPlayer");
    ExtractPipeline::new(
        adapter_for(&account),
        source,
        NdjsonSink::new(data_dir.path()),
        AdapterContext::new(policy),
        3,
    )
}

fn period(text: &str) -> Period {
    text.parse().expect("period")
}

#[tokio::test]
async fn period_extraction_skips_unusable_games() {
    let data_dir = TempDir::new().unwrap();
    let pipeline = pipeline(Platform::ChessCom, fixtures("chesscom"), &data_dir, OpponentLookupPolicy::Skip);

    let report = pipeline.extract_period(period("2024-08")).await.expect("extract");
    assert_eq!(report.fetched, 5);
    assert_eq!(report.written, 2);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.path, data_dir.path().join("chesscom").join("2024_08.ndjson"));

    let rows = read_rows(&report.path).await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.game_id.as_str()).collect();
    assert_eq!(ids, ["cc-111", "cc-222"]);
}

#[tokio::test]
async fn degraded_lookups_keep_the_game() {
    let data_dir = TempDir::new().unwrap();
    let pipeline = pipeline(Platform::ChessCom, fixtures("chesscom"), &data_dir, OpponentLookupPolicy::Degrade);

    let report = pipeline.extract_period(period("2024-08")).await.expect("extract");
    assert_eq!(report.written, 3);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn fatal_lookup_writes_no_file() {
    let data_dir = TempDir::new().unwrap();
    let pipeline = pipeline(Platform::ChessCom, fixtures("chesscom"), &data_dir, OpponentLookupPolicy::Fail);

    let err = pipeline.extract_period(period("2024-08")).await.unwrap_err();
    assert!(format!("{err:#}").contains("cc-333"), "{err:#}");
    assert!(!pipeline.sink().path_for(Platform::ChessCom, period("2024-08")).exists());
}

#[tokio::test]
async fn missing_archive_is_a_fetch_error() {
    let data_dir = TempDir::new().unwrap();
    let source = Arc::new(FixtureSource::new());
    let pipeline = pipeline(Platform::ChessCom, source, &data_dir, OpponentLookupPolicy::Skip);

    assert!(pipeline.extract_period(period("2024-08")).await.is_err());
    assert!(!pipeline.sink().path_for(Platform::ChessCom, period("2024-08")).exists());
}

#[tokio::test]
async fn backfill_records_failures_and_moves_on() {
    let data_dir = TempDir::new().unwrap();
    let source = fixtures("chesscom");
    let pipeline = pipeline(Platform::ChessCom, source.clone(), &data_dir, OpponentLookupPolicy::Fail);

    let summary = pipeline
        .backfill(period("2024-06"), period("2024-08"))
        .await
        .expect("backfill");

    let done: Vec<_> = summary.periods.iter().map(|r| (r.period, r.written)).collect();
    assert_eq!(done, [(period("2024-06"), 0), (period("2024-07"), 1)]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].period, period("2024-08"));
    assert_eq!(summary.games_written(), 1);

    assert!(pipeline.sink().path_for(Platform::ChessCom, period("2024-06")).exists());
    assert!(!pipeline.sink().path_for(Platform::ChessCom, period("2024-08")).exists());
    assert!(source.requests().iter().all(|r| !r.url.ends_with("/2024/06")));
}

#[tokio::test]
async fn range_extraction_groups_games_by_month() {
    let data_dir = TempDir::new().unwrap();
    let pipeline = pipeline(Platform::Lichess, fixtures("lichess"), &data_dir, OpponentLookupPolicy::Skip);

    let summary = pipeline.extract_range(None, None).await.expect("range");
    let written: Vec<_> = summary.periods.iter().map(|r| (r.period, r.written)).collect();
    assert_eq!(written, [(period("2024-07"), 1), (period("2024-08"), 3)]);
    assert!(summary.failed.is_empty());

    let august = read_rows(&data_dir.path().join("lichess").join("2024_08.ndjson"))
        .await
        .unwrap();
    let ids: Vec<_> = august.iter().map(|r| r.game_id.as_str()).collect();
    assert_eq!(ids, ["gameAAA1", "gameBBB2", "gameCCC3"]);
}

#[tokio::test]
async fn run_summaries_share_the_adapter_run_id() {
    let data_dir = TempDir::new().unwrap();
    let ctx = AdapterContext::new(OpponentLookupPolicy::Skip);
    let run_id = ctx.run_id;
    let pipeline = ExtractPipeline::new(
        adapter_for(&AccountConfig::new(Platform::Lichess, "TestPlayer")),
        fixtures("lichess"),
        NdjsonSink::new(data_dir.path()),
        ctx,
        2,
    );
    assert_eq!(pipeline.run_id(), run_id);

    let range = pipeline.extract_range(None, None).await.expect("range");
    let backfill = pipeline
        .backfill(period("2024-08"), period("2024-08"))
        .await
        .expect("backfill");
    assert_eq!(range.run_id, run_id);
    assert_eq!(backfill.run_id, run_id);
}

#[tokio::test]
async fn range_bounds_cover_whole_days() {
    let data_dir = TempDir::new().unwrap();
    let source = fixtures("lichess");
    let pipeline = pipeline(Platform::Lichess, source.clone(), &data_dir, OpponentLookupPolicy::Skip);

    let day = NaiveDate::from_ymd_opt(2024, 8, 2).unwrap();
    pipeline.extract_range(Some(day), Some(day)).await.expect("range");

    let request = source.requests().into_iter().next().expect("export request");
    assert_eq!(request.query_value("since"), Some("1722556800000"));
    assert_eq!(request.query_value("until"), Some("1722643199999"));
}

#[tokio::test]
async fn loading_a_period_twice_doubles_the_table() {
    let data_dir = TempDir::new().unwrap();
    let warehouse_dir = TempDir::new().unwrap();
    let extract = pipeline(Platform::ChessCom, fixtures("chesscom"), &data_dir, OpponentLookupPolicy::Skip);
    extract.extract_period(period("2024-08")).await.expect("extract");

    let table = TableRef::raw_games("local", "dev_games", Platform::ChessCom);
    let load = LoadPipeline::new(
        Box::new(LocalWarehouse::new(warehouse_dir.path())),
        NdjsonSink::new(data_dir.path()),
        table,
        LoadJobConfig::for_platform(Platform::ChessCom),
        Platform::ChessCom,
    );

    let first = load.load_period(period("2024-08")).await.expect("first load");
    assert_eq!(first.rows_loaded, 2);
    assert_eq!(first.table_rows, 2);

    let second = load.load_period(period("2024-08")).await.expect("second load");
    assert_eq!(second.table_rows, 4);
    assert_eq!(
        second.message,
        "Loaded 4 rows and 26 columns to local.dev_games.raw_games_chesscom"
    );
    assert_ne!(first.job_id, second.job_id);
}

#[tokio::test]
async fn load_backfill_warns_past_missing_files() {
    let data_dir = TempDir::new().unwrap();
    let warehouse_dir = TempDir::new().unwrap();
    let extract = pipeline(Platform::Lichess, fixtures("lichess"), &data_dir, OpponentLookupPolicy::Skip);
    extract.extract_range(None, None).await.expect("range");

    let load = LoadPipeline::new(
        Box::new(LocalWarehouse::new(warehouse_dir.path())),
        NdjsonSink::new(data_dir.path()),
        TableRef::raw_games("local", "dev_games", Platform::Lichess),
        LoadJobConfig::for_platform(Platform::Lichess),
        Platform::Lichess,
    );

    let summary = load
        .load_backfill(period("2024-06"), period("2024-09"))
        .await
        .expect("load backfill");
    assert_eq!(summary.missing, [period("2024-06"), period("2024-09")]);
    assert_eq!(summary.loads.len(), 2);
    assert_eq!(summary.rows_loaded(), 4);

    assert!(load.load_period(period("2024-06")).await.is_err());
}
