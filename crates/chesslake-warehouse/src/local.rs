//! Directory-backed warehouse that writes each load as a Parquet part.
//!
//! Layout under the root:
//! `{project}/{dataset}/{table}/_schema.json`, `_loads.ndjson`, and
//! `partition=YYYYMM/part-{job}.parquet` keyed by ingestion month.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arrow_array::builder::{
    ArrayBuilder, BooleanBuilder, Float64Builder, Int64Builder, ListBuilder, StringBuilder,
    TimestampMicrosecondBuilder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::task::{self, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn};

use crate::{
    io_err, sha256_hex, FieldMode, FieldType, LoadJobConfig, LoadOutcome, SchemaField, TableInfo, TableRef,
    TableSchema, Warehouse, WarehouseError,
};

const SCHEMA_FILE: &str = "_schema.json";
const LEDGER_FILE: &str = "_loads.ndjson";

/// One line of `_loads.ndjson`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRecord {
    pub job_id: String,
    pub source_file: String,
    pub sha256: String,
    pub rows: u64,
    pub partition: String,
    pub part_file: String,
    pub loaded_at: String,
}

impl LoadRecord {
    fn outcome(self) -> LoadOutcome {
        LoadOutcome {
            job_id: self.job_id,
            rows_loaded: self.rows,
        }
    }
}

type LoadTask = JoinHandle<Result<LoadRecord, WarehouseError>>;

/// Loads run on the blocking pool; `running` holds jobs nobody has waited
/// out yet. Writers are serialized by `write_lock`.
#[derive(Debug, Clone)]
pub struct LocalWarehouse {
    root: PathBuf,
    running: Arc<Mutex<HashMap<String, LoadTask>>>,
    write_lock: Arc<Mutex<()>>,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            running: Arc::default(),
            write_lock: Arc::default(),
        }
    }

    pub fn table_dir(&self, table: &TableRef) -> PathBuf {
        self.root.join(&table.project).join(&table.dataset).join(&table.table)
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, LoadTask>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn loads(&self, table: &TableRef) -> Result<Vec<LoadRecord>, WarehouseError> {
        let path = self.table_dir(table).join(LEDGER_FILE);
        off_thread(move || read_ledger(&path)).await
    }

    async fn ledger_record(&self, table: &TableRef, job_id: &str) -> Result<Option<LoadRecord>, WarehouseError> {
        Ok(self.loads(table).await?.into_iter().find(|r| r.job_id == job_id))
    }
}

#[async_trait]
impl Warehouse for LocalWarehouse {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit_load(
        &self,
        table: &TableRef,
        path: &Path,
        config: &LoadJobConfig,
        job_id: &str,
    ) -> Result<(), WarehouseError> {
        if self.ledger_record(table, job_id).await?.is_some() {
            debug!(job_id, "load job already finished");
            return Ok(());
        }

        let mut running = self.running();
        if running.contains_key(job_id) {
            debug!(job_id, "load job already running");
            return Ok(());
        }

        let table_dir = self.table_dir(table);
        let source = path.to_path_buf();
        let config = config.clone();
        let id = job_id.to_string();
        let write_lock = Arc::clone(&self.write_lock);
        let span = info_span!("local_load", table = %table, job_id = %job_id);
        let task = task::spawn_blocking(move || {
            span.in_scope(|| {
                let _writer = write_lock.lock().unwrap_or_else(PoisonError::into_inner);
                write_load(&table_dir, &source, &config, &id)
            })
        });
        running.insert(job_id.to_string(), task);
        info!(table = %table, job_id, source = %path.display(), "local load submitted");
        Ok(())
    }

    async fn wait_for_load(
        &self,
        table: &TableRef,
        job_id: &str,
        config: &LoadJobConfig,
    ) -> Result<LoadOutcome, WarehouseError> {
        let task = self.running().remove(job_id);
        let Some(mut task) = task else {
            return match self.ledger_record(table, job_id).await? {
                Some(record) => Ok(record.outcome()),
                None => Err(WarehouseError::JobFailed {
                    job_id: job_id.to_string(),
                    reason: "no such load job".to_string(),
                }),
            };
        };

        match timeout(config.timeout, &mut task).await {
            Ok(joined) => {
                let record = joined.map_err(|err| WarehouseError::JobFailed {
                    job_id: job_id.to_string(),
                    reason: err.to_string(),
                })??;
                Ok(record.outcome())
            }
            Err(_) => {
                self.running().insert(job_id.to_string(), task);
                Err(WarehouseError::Timeout {
                    job_id: job_id.to_string(),
                    waited: config.timeout,
                })
            }
        }
    }

    async fn table_info(&self, table: &TableRef) -> Result<TableInfo, WarehouseError> {
        let table_dir = self.table_dir(table);
        let name = table.to_string();
        off_thread(move || {
            let schema = read_schema(&table_dir.join(SCHEMA_FILE))?.ok_or(WarehouseError::TableNotFound(name))?;
            let mut num_rows = 0u64;
            for record in read_ledger(&table_dir.join(LEDGER_FILE))? {
                let part = table_dir.join(&record.partition).join(&record.part_file);
                match parquet_row_count(&part) {
                    Ok(rows) => num_rows += rows,
                    Err(err) => {
                        warn!(part = %part.display(), error = %err, "unreadable part; using ledger row count");
                        num_rows += record.rows;
                    }
                }
            }
            Ok(TableInfo {
                num_rows,
                num_columns: schema.len(),
            })
        })
        .await
    }
}

async fn off_thread<T, F>(work: F) -> Result<T, WarehouseError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, WarehouseError> + Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|err| WarehouseError::Response(format!("warehouse task failed: {err}")))?
}

fn read_schema(path: &Path) -> Result<Option<TableSchema>, WarehouseError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err("reading", path)(err)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| WarehouseError::Response(format!("{}: {e}", path.display())))
}

fn read_ledger(path: &Path) -> Result<Vec<LoadRecord>, WarehouseError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err("reading", path)(err)),
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| WarehouseError::Response(format!("{}: {e}", path.display()))))
        .collect()
}

/// Decode, write the part, then publish schema and ledger line. A failure
/// before the rename leaves the table untouched.
fn write_load(
    table_dir: &Path,
    source: &Path,
    config: &LoadJobConfig,
    job_id: &str,
) -> Result<LoadRecord, WarehouseError> {
    let data = fs::read(source).map_err(io_err("reading", source))?;
    let schema_path = table_dir.join(SCHEMA_FILE);
    let schema = match read_schema(&schema_path)? {
        Some(current) if config.allows_relaxation() => current.relax_with(&config.schema)?,
        Some(current) => current,
        None => config.schema.clone(),
    };

    let rows = decode_rows(source, &data)?;
    let batch = build_batch(source, &schema, &rows)?;

    let partition = format!("partition={}", Utc::now().format("%Y%m"));
    let partition_dir = table_dir.join(&partition);
    fs::create_dir_all(&partition_dir).map_err(io_err("creating directory", &partition_dir))?;

    let part_name = format!("part-{job_id}.parquet");
    let part_path = partition_dir.join(&part_name);
    let temp_path = partition_dir.join(format!(".{part_name}.tmp"));
    write_parquet(&temp_path, &batch)?;
    fs::rename(&temp_path, &part_path).map_err(io_err("renaming part into", &part_path))?;

    let schema_json = serde_json::to_vec_pretty(&schema).map_err(|e| WarehouseError::Response(e.to_string()))?;
    fs::write(&schema_path, schema_json).map_err(io_err("writing", &schema_path))?;

    let record = LoadRecord {
        job_id: job_id.to_string(),
        source_file: source.display().to_string(),
        sha256: sha256_hex(&data),
        rows: rows.len() as u64,
        partition,
        part_file: part_name,
        loaded_at: Utc::now().to_rfc3339(),
    };
    append_ledger(&table_dir.join(LEDGER_FILE), &record)?;
    info!(rows = record.rows, "local load done");
    Ok(record)
}

fn append_ledger(path: &Path, record: &LoadRecord) -> Result<(), WarehouseError> {
    let mut line = serde_json::to_vec(record).map_err(|e| WarehouseError::Response(e.to_string()))?;
    line.push(b'\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err("opening", path))?;
    file.write_all(&line).map_err(io_err("appending to", path))?;
    file.flush().map_err(io_err("flushing", path))?;
    Ok(())
}

fn decode_rows(path: &Path, data: &[u8]) -> Result<Vec<(usize, Map<String, JsonValue>)>, WarehouseError> {
    let text = std::str::from_utf8(data).map_err(|e| WarehouseError::InvalidRow {
        path: path.to_path_buf(),
        line: 0,
        reason: e.to_string(),
    })?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            let invalid = |reason: String| WarehouseError::InvalidRow {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            };
            match serde_json::from_str::<JsonValue>(line) {
                Ok(JsonValue::Object(map)) => Ok((idx + 1, map)),
                Ok(_) => Err(invalid("row is not a JSON object".to_string())),
                Err(e) => Err(invalid(e.to_string())),
            }
        })
        .collect()
}

enum Column {
    String(StringBuilder),
    Integer(Int64Builder),
    Float(Float64Builder),
    Boolean(BooleanBuilder),
    Datetime(TimestampMicrosecondBuilder),
    StringList(ListBuilder<StringBuilder>),
}

impl Column {
    fn for_field(field: &SchemaField) -> Result<Self, String> {
        Ok(match (field.mode, field.field_type) {
            (FieldMode::Repeated, FieldType::String) => Column::StringList(ListBuilder::new(StringBuilder::new())),
            (FieldMode::Repeated, other) => {
                return Err(format!("REPEATED {other} column {} is not supported", field.name))
            }
            (_, FieldType::String) => Column::String(StringBuilder::new()),
            (_, FieldType::Integer) => Column::Integer(Int64Builder::new()),
            (_, FieldType::Float) => Column::Float(Float64Builder::new()),
            (_, FieldType::Boolean) => Column::Boolean(BooleanBuilder::new()),
            (_, FieldType::Datetime) => Column::Datetime(TimestampMicrosecondBuilder::new()),
        })
    }

    fn data_type(field: &SchemaField) -> DataType {
        match (field.mode, field.field_type) {
            (FieldMode::Repeated, _) => DataType::List(Arc::new(ArrowField::new("item", DataType::Utf8, true))),
            (_, FieldType::String) => DataType::Utf8,
            (_, FieldType::Integer) => DataType::Int64,
            (_, FieldType::Float) => DataType::Float64,
            (_, FieldType::Boolean) => DataType::Boolean,
            (_, FieldType::Datetime) => DataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }

    /// Coerces like BigQuery's JSON loader: numbers may arrive as strings and
    /// a null REPEATED value is an empty list.
    fn append(&mut self, value: Option<&JsonValue>) -> Result<(), String> {
        let value = value.filter(|v| !v.is_null());
        match self {
            Column::String(b) => match value {
                None => b.append_null(),
                Some(JsonValue::String(s)) => b.append_value(s),
                Some(v @ (JsonValue::Number(_) | JsonValue::Bool(_))) => b.append_value(v.to_string()),
                Some(other) => return Err(format!("expected STRING, got {other}")),
            },
            Column::Integer(b) => match value {
                None => b.append_null(),
                Some(v) => b.append_value(as_i64(v).ok_or_else(|| format!("expected INTEGER, got {v}"))?),
            },
            Column::Float(b) => match value {
                None => b.append_null(),
                Some(v) => b.append_value(as_f64(v).ok_or_else(|| format!("expected FLOAT, got {v}"))?),
            },
            Column::Boolean(b) => match value {
                None => b.append_null(),
                Some(v) => b.append_value(as_bool(v).ok_or_else(|| format!("expected BOOLEAN, got {v}"))?),
            },
            Column::Datetime(b) => match value {
                None => b.append_null(),
                Some(v) => b.append_value(as_datetime_micros(v).ok_or_else(|| format!("expected DATETIME, got {v}"))?),
            },
            Column::StringList(b) => {
                match value {
                    None => {}
                    Some(JsonValue::Array(items)) => {
                        for item in items {
                            match item {
                                JsonValue::String(s) => b.values().append_value(s),
                                JsonValue::Null => return Err("REPEATED values cannot contain null".to_string()),
                                other => b.values().append_value(other.to_string()),
                            }
                        }
                    }
                    Some(other) => return Err(format!("expected REPEATED STRING, got {other}")),
                }
                b.append(true);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Column::String(b) => Arc::new(b.finish()),
            Column::Integer(b) => Arc::new(b.finish()),
            Column::Float(b) => Arc::new(b.finish()),
            Column::Boolean(b) => Arc::new(b.finish()),
            Column::Datetime(b) => Arc::new(b.finish()),
            Column::StringList(b) => Arc::new(b.finish()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Column::String(b) => b.len(),
            Column::Integer(b) => b.len(),
            Column::Float(b) => b.len(),
            Column::Boolean(b) => b.len(),
            Column::Datetime(b) => b.len(),
            Column::StringList(b) => b.len(),
        }
    }
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn as_datetime_micros(value: &JsonValue) -> Option<i64> {
    let text = value.as_str()?;
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_micros())
}

fn build_batch(
    path: &Path,
    schema: &TableSchema,
    rows: &[(usize, Map<String, JsonValue>)],
) -> Result<RecordBatch, WarehouseError> {
    let invalid = |line: usize, reason: String| WarehouseError::InvalidRow {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut columns = schema
        .fields
        .iter()
        .map(|f| Column::for_field(f).map_err(|reason| invalid(0, reason)))
        .collect::<Result<Vec<_>, _>>()?;

    for (line, row) in rows {
        if let Some(unknown) = row.keys().find(|k| schema.field(k).is_none()) {
            return Err(invalid(*line, format!("no such field: {unknown}")));
        }
        for (field, column) in schema.fields.iter().zip(columns.iter_mut()) {
            let value = row.get(&field.name);
            if field.mode == FieldMode::Required && value.map_or(true, JsonValue::is_null) {
                return Err(invalid(*line, format!("missing required field {}", field.name)));
            }
            column
                .append(value)
                .map_err(|reason| invalid(*line, format!("{}: {reason}", field.name)))?;
        }
    }
    debug_assert!(columns.iter().all(|c| c.len() == rows.len()));

    let arrow_schema = Arc::new(Schema::new(
        schema
            .fields
            .iter()
            .map(|f| {
                let nullable = f.mode != FieldMode::Required;
                ArrowField::new(&f.name, Column::data_type(f), nullable)
            })
            .collect::<Vec<_>>(),
    ));
    let arrays = columns.iter_mut().map(Column::finish).collect::<Vec<_>>();
    Ok(RecordBatch::try_new(arrow_schema, arrays)?)
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<(), WarehouseError> {
    let file = File::create(path).map_err(io_err("creating", path))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn parquet_row_count(path: &Path) -> Result<u64, WarehouseError> {
    let file = File::open(path).map_err(io_err("opening", path))?;
    let reader = SerializedFileReader::new(file)?;
    Ok(reader.metadata().file_metadata().num_rows().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use chesslake_core::Platform;
    use tempfile::tempdir;

    const ROW: &str = r#"{"game_id":"abc","url":"https://lichess.org/abc","time_class":"blitz","time_control":"180+2","is_rated":true,"white_rating":"1500","black_rating":1510,"white_accuracy":88.0,"black_accuracy":null,"game_winner":"white","game_status":"mate","colour":"white","opponent_id":"rival","opponent_username":"Rival","opponent_country":null,"opponent_is_verified":false,"opponent_status":"member","start_datetime":"2024-08-02 00:00:00","end_datetime":"2024-08-02 00:06:40","opening_code":"C60","opening_name":"Ruy Lopez","opening_url":null,"total_moves":2,"moves":["e4","e5","Nf3","Nc6","Bb5"],"move_times":null,"_extracted_at":"2024-09-01 00:00:00.000001"}"#;

    async fn write_file(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut body = lines.join("\n");
        body.push('\n');
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn loading_twice_doubles_rows() {
        let dir = tempdir().unwrap();
        let warehouse = LocalWarehouse::new(dir.path().join("wh"));
        let table = TableRef::raw_games("proj", "dev_games", Platform::Lichess);
        let config = LoadJobConfig::for_platform(Platform::Lichess);
        let source = write_file(dir.path(), "2024_08.ndjson", &[ROW, &ROW.replace("\"abc\"", "\"def\"")]).await;

        let first = warehouse.load_ndjson(&table, &source, &config).await.unwrap();
        assert_eq!(first.rows_loaded, 2);
        let second = warehouse.load_ndjson(&table, &source, &config).await.unwrap();
        assert_ne!(first.job_id, second.job_id);

        let info = warehouse.table_info(&table).await.unwrap();
        assert_eq!(info.num_rows, 4);
        assert_eq!(info.num_columns, 26);

        let loads = warehouse.loads(&table).await.unwrap();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].sha256, loads[1].sha256);
        assert!(loads[0].partition.starts_with("partition="));
    }

    #[tokio::test]
    async fn required_nulls_and_unknown_columns_are_rejected() {
        let dir = tempdir().unwrap();
        let warehouse = LocalWarehouse::new(dir.path().join("wh"));
        let table = TableRef::raw_games("proj", "dev_games", Platform::Lichess);
        let config = LoadJobConfig::for_platform(Platform::Lichess);

        let missing_id = ROW.replace("\"game_id\":\"abc\",", "");
        let source = write_file(dir.path(), "a.ndjson", &[ROW, &missing_id]).await;
        let err = warehouse.load_ndjson(&table, &source, &config).await.unwrap_err();
        assert!(matches!(err, WarehouseError::InvalidRow { line: 2, .. }), "{err}");

        let unknown = ROW.replace("\"colour\"", "\"color\"");
        let source = write_file(dir.path(), "b.ndjson", &[&unknown]).await;
        let err = warehouse.load_ndjson(&table, &source, &config).await.unwrap_err();
        assert!(err.to_string().contains("no such field: color"), "{err}");

        let bad_int = ROW.replace("\"total_moves\":2", "\"total_moves\":\"two\"");
        let source = write_file(dir.path(), "c.ndjson", &[&bad_int]).await;
        assert!(warehouse.load_ndjson(&table, &source, &config).await.is_err());

        assert!(matches!(
            warehouse.table_info(&table).await,
            Err(WarehouseError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn table_schema_relaxes_across_loads() {
        let dir = tempdir().unwrap();
        let warehouse = LocalWarehouse::new(dir.path().join("wh"));
        let table = TableRef::raw_games("proj", "dev_games", Platform::Lichess);
        let source = write_file(dir.path(), "2024_08.ndjson", &[ROW]).await;

        let config = LoadJobConfig::for_platform(Platform::Lichess);
        warehouse.load_ndjson(&table, &source, &config).await.unwrap();

        let mut relaxed = config.clone();
        relaxed.schema.fields[0].mode = FieldMode::Nullable;
        relaxed.schema.fields.push(SchemaField::new(
            "analysis_source",
            FieldType::String,
            FieldMode::Nullable,
            "where accuracy came from",
        ));
        warehouse.load_ndjson(&table, &source, &relaxed).await.unwrap();
        let info = warehouse.table_info(&table).await.unwrap();
        assert_eq!(info.num_rows, 2);
        assert_eq!(info.num_columns, 27);

        let mut tightened = relaxed.clone();
        tightened.schema.fields[0].mode = FieldMode::Required;
        let err = warehouse.load_ndjson(&table, &source, &tightened).await.unwrap_err();
        assert!(matches!(err, WarehouseError::Schema(_)));
        assert_eq!(warehouse.table_info(&table).await.unwrap().num_rows, 2);
    }

    #[tokio::test]
    async fn resubmitting_a_job_id_loads_once() {
        let dir = tempdir().unwrap();
        let warehouse = LocalWarehouse::new(dir.path().join("wh"));
        let table = TableRef::raw_games("proj", "dev_games", Platform::Lichess);
        let config = LoadJobConfig::for_platform(Platform::Lichess);
        let source = write_file(dir.path(), "2024_08.ndjson", &[ROW, &ROW.replace("\"abc\"", "\"def\"")]).await;

        warehouse.submit_load(&table, &source, &config, "job-a").await.unwrap();
        warehouse.submit_load(&table, &source, &config, "job-a").await.unwrap();
        let outcome = warehouse.wait_for_load(&table, "job-a", &config).await.unwrap();
        assert_eq!(outcome.job_id, "job-a");
        assert_eq!(outcome.rows_loaded, 2);

        warehouse.submit_load(&table, &source, &config, "job-a").await.unwrap();
        let again = warehouse.wait_for_load(&table, "job-a", &config).await.unwrap();
        assert_eq!(again, outcome);
        assert_eq!(warehouse.loads(&table).await.unwrap().len(), 1);
        assert_eq!(warehouse.table_info(&table).await.unwrap().num_rows, 2);
    }

    #[tokio::test]
    async fn timed_out_wait_leaves_the_job_running() {
        let dir = tempdir().unwrap();
        let warehouse = LocalWarehouse::new(dir.path().join("wh"));
        let table = TableRef::raw_games("proj", "dev_games", Platform::Lichess);
        let rows: Vec<String> = (0..5000).map(|i| ROW.replace("\"abc\"", &format!("\"g{i}\""))).collect();
        let lines: Vec<&str> = rows.iter().map(String::as_str).collect();
        let source = write_file(dir.path(), "2024_08.ndjson", &lines).await;

        let impatient = LoadJobConfig::for_platform(Platform::Lichess).with_timeout(Duration::ZERO);
        warehouse.submit_load(&table, &source, &impatient, "job-slow").await.unwrap();
        let err = warehouse.wait_for_load(&table, "job-slow", &impatient).await.unwrap_err();
        assert!(matches!(err, WarehouseError::Timeout { .. }), "{err}");
        assert!(err.is_retryable());

        let patient = LoadJobConfig::for_platform(Platform::Lichess);
        let outcome = warehouse.wait_for_load(&table, "job-slow", &patient).await.unwrap();
        assert_eq!(outcome.rows_loaded, 5000);
        assert_eq!(warehouse.loads(&table).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn waiting_on_an_unknown_job_fails() {
        let dir = tempdir().unwrap();
        let warehouse = LocalWarehouse::new(dir.path().join("wh"));
        let table = TableRef::raw_games("proj", "dev_games", Platform::Lichess);
        let config = LoadJobConfig::for_platform(Platform::Lichess);
        let err = warehouse.wait_for_load(&table, "nope", &config).await.unwrap_err();
        assert!(matches!(err, WarehouseError::JobFailed { .. }), "{err}");
    }

    #[test]
    fn coercion_accepts_numeric_strings() {
        assert_eq!(as_i64(&JsonValue::String("1500".into())), Some(1500));
        assert_eq!(as_i64(&serde_json::json!(1.5)), None);
        assert_eq!(as_f64(&JsonValue::String("88.5".into())), Some(88.5));
        assert_eq!(as_bool(&JsonValue::String("TRUE".into())), Some(true));
        assert_eq!(
            as_datetime_micros(&JsonValue::String("1970-01-01 00:00:01.000001".into())),
            Some(1_000_001)
        );
    }
}
