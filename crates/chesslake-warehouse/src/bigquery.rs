//! BigQuery REST backend: multipart load job upload under a caller-chosen
//! job id, then poll the job to completion.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use tokio::fs;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, Instrument};
use uuid::Uuid;

use crate::{io_err, LoadJobConfig, LoadOutcome, TableInfo, TableRef, Warehouse, WarehouseError};

pub const BIGQUERY_API_BASE: &str = "https://bigquery.googleapis.com";

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub api_base: String,
    pub access_token: String,
    pub location: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl BigQueryConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            api_base: BIGQUERY_API_BASE.to_string(),
            access_token: access_token.into(),
            location: None,
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done { output_rows: u64 },
}

#[derive(Debug, Clone)]
pub struct BigQueryWarehouse {
    client: reqwest::Client,
    config: BigQueryConfig,
}

impl BigQueryWarehouse {
    pub fn new(config: BigQueryConfig) -> Result<Self, WarehouseError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn upload_url(&self, project: &str) -> String {
        format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.config.api_base.trim_end_matches('/'),
            project
        )
    }

    fn job_url(&self, project: &str, job_id: &str) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/jobs/{}",
            self.config.api_base.trim_end_matches('/'),
            project,
            job_id
        )
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}",
            self.config.api_base.trim_end_matches('/'),
            table.project,
            table.dataset,
            table.table
        )
    }

    async fn read_json(response: reqwest::Response) -> Result<JsonValue, WarehouseError> {
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(WarehouseError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }
        serde_json::from_slice(&body).map_err(|e| WarehouseError::Response(e.to_string()))
    }

    async fn poll_job(&self, project: &str, job_id: &str) -> Result<u64, WarehouseError> {
        loop {
            let mut request = self
                .client
                .get(self.job_url(project, job_id))
                .bearer_auth(&self.config.access_token);
            if let Some(location) = &self.config.location {
                request = request.query(&[("location", location)]);
            }
            let body = Self::read_json(request.send().await?).await?;
            match parse_job_state(job_id, &body)? {
                JobState::Done { output_rows } => return Ok(output_rows),
                state => {
                    debug!(job_id, ?state, "load job not finished yet");
                    sleep(self.config.poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn submit_load(
        &self,
        table: &TableRef,
        path: &Path,
        config: &LoadJobConfig,
        job_id: &str,
    ) -> Result<(), WarehouseError> {
        let data = fs::read(path).await.map_err(io_err("reading", path))?;
        let resource = job_resource(table, config, job_id, self.config.location.as_deref());
        let boundary = format!("chesslake-{}", Uuid::new_v4().simple());
        let body = multipart_body(&boundary, &resource, &data);

        let span = tracing::info_span!("bigquery_submit", table = %table, job_id = %job_id);
        async {
            let response = self
                .client
                .post(self.upload_url(&table.project))
                .bearer_auth(&self.config.access_token)
                .header(CONTENT_TYPE, format!("multipart/related; boundary={boundary}"))
                .body(body)
                .send()
                .await?;
            // A resubmitted job id comes back as 409; the first upload stands.
            if response.status() == StatusCode::CONFLICT {
                info!("load job already exists");
                return Ok(());
            }
            let submitted = Self::read_json(response).await?;
            let state = parse_job_state(job_id, &submitted)?;
            info!(bytes = data.len(), ?state, "load job submitted");
            Ok::<_, WarehouseError>(())
        }
        .instrument(span)
        .await
    }

    async fn wait_for_load(
        &self,
        table: &TableRef,
        job_id: &str,
        config: &LoadJobConfig,
    ) -> Result<LoadOutcome, WarehouseError> {
        let span = tracing::info_span!("bigquery_wait", table = %table, job_id = %job_id);
        async {
            let rows_loaded = timeout(config.timeout, self.poll_job(&table.project, job_id))
                .await
                .map_err(|_| WarehouseError::Timeout {
                    job_id: job_id.to_string(),
                    waited: config.timeout,
                })??;
            info!(rows_loaded, "load job done");
            Ok::<_, WarehouseError>(LoadOutcome {
                job_id: job_id.to_string(),
                rows_loaded,
            })
        }
        .instrument(span)
        .await
    }

    async fn table_info(&self, table: &TableRef) -> Result<TableInfo, WarehouseError> {
        let response = self
            .client
            .get(self.table_url(table))
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(WarehouseError::TableNotFound(table.to_string()));
        }
        parse_table_info(&Self::read_json(response).await?)
    }
}

/// Load job resource as posted in the metadata part of the upload.
pub(crate) fn job_resource(
    table: &TableRef,
    config: &LoadJobConfig,
    job_id: &str,
    location: Option<&str>,
) -> JsonValue {
    let mut reference = json!({ "projectId": table.project, "jobId": job_id });
    if let Some(location) = location {
        reference["location"] = json!(location);
    }
    json!({
        "jobReference": reference,
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": table.project,
                    "datasetId": table.dataset,
                    "tableId": table.table,
                },
                "schema": config.schema,
                "sourceFormat": config.source_format,
                "writeDisposition": config.write_disposition,
                "createDisposition": "CREATE_IF_NEEDED",
                "timePartitioning": { "type": config.time_partitioning },
                "schemaUpdateOptions": config.schema_update_options,
            },
            "jobTimeoutMs": config.timeout.as_millis().to_string(),
        }
    })
}

pub(crate) fn multipart_body(boundary: &str, metadata: &JsonValue, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 1024);
    body.extend_from_slice(format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes());
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// BigQuery encodes int64 counters as JSON strings.
fn counter(value: Option<&JsonValue>) -> Option<u64> {
    match value? {
        JsonValue::String(s) => s.parse().ok(),
        JsonValue::Number(n) => n.as_u64(),
        _ => None,
    }
}

pub(crate) fn parse_job_state(job_id: &str, job: &JsonValue) -> Result<JobState, WarehouseError> {
    let status = job
        .get("status")
        .ok_or_else(|| WarehouseError::Response(format!("job {job_id} has no status")))?;
    match status.get("state").and_then(JsonValue::as_str) {
        Some("PENDING") => Ok(JobState::Pending),
        Some("RUNNING") => Ok(JobState::Running),
        Some("DONE") => {
            if let Some(error) = status.get("errorResult") {
                let reason = error
                    .get("message")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                return Err(WarehouseError::JobFailed {
                    job_id: job_id.to_string(),
                    reason,
                });
            }
            let output_rows = counter(job.pointer("/statistics/load/outputRows")).unwrap_or(0);
            Ok(JobState::Done { output_rows })
        }
        other => Err(WarehouseError::Response(format!(
            "job {job_id} reported unknown state {other:?}"
        ))),
    }
}

pub(crate) fn parse_table_info(table: &JsonValue) -> Result<TableInfo, WarehouseError> {
    let num_rows = counter(table.get("numRows"))
        .ok_or_else(|| WarehouseError::Response("table resource has no numRows".to_string()))?;
    let num_columns = table
        .pointer("/schema/fields")
        .and_then(JsonValue::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    Ok(TableInfo { num_rows, num_columns })
}

fn api_error_message(body: &[u8]) -> String {
    serde_json::from_slice::<JsonValue>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(JsonValue::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(500).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chesslake_core::Platform;

    #[test]
    fn job_resource_targets_table_with_append_and_relaxation() {
        let table = TableRef::raw_games("proj", "dev_games", Platform::ChessCom);
        let config = LoadJobConfig::for_platform(Platform::ChessCom).with_timeout(Duration::from_secs(90));
        let job = job_resource(&table, &config, "job-1", Some("EU"));

        assert_eq!(job["jobReference"]["jobId"], "job-1");
        assert_eq!(job["jobReference"]["location"], "EU");
        let load = &job["configuration"]["load"];
        assert_eq!(load["destinationTable"]["tableId"], "raw_games_chesscom");
        assert_eq!(load["sourceFormat"], "NEWLINE_DELIMITED_JSON");
        assert_eq!(load["writeDisposition"], "WRITE_APPEND");
        assert_eq!(load["timePartitioning"]["type"], "MONTH");
        assert_eq!(load["schemaUpdateOptions"][0], "ALLOW_FIELD_RELAXATION");
        assert_eq!(load["schema"]["fields"][12]["name"], "opponent_id");
        assert_eq!(load["schema"]["fields"][12]["type"], "INTEGER");
        assert_eq!(job["configuration"]["jobTimeoutMs"], "90000");
    }

    #[test]
    fn multipart_body_frames_metadata_then_data() {
        let body = multipart_body("B", &json!({"a": 1}), b"{\"x\":1}\n");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--B\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{\"a\":1}\r\n--B\r\n"));
        assert!(text.contains("application/octet-stream\r\n\r\n{\"x\":1}\n\r\n--B--\r\n"));
    }

    #[test]
    fn job_states_parse() {
        let running = json!({"status": {"state": "RUNNING"}});
        assert_eq!(parse_job_state("j", &running).unwrap(), JobState::Running);

        let done = json!({"status": {"state": "DONE"}, "statistics": {"load": {"outputRows": "42"}}});
        assert_eq!(parse_job_state("j", &done).unwrap(), JobState::Done { output_rows: 42 });

        let failed = json!({"status": {"state": "DONE", "errorResult": {"message": "bad row"}}});
        let err = parse_job_state("j", &failed).unwrap_err();
        assert!(matches!(err, WarehouseError::JobFailed { ref reason, .. } if reason == "bad row"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn table_info_reads_string_counters() {
        let table = json!({"numRows": "1200", "schema": {"fields": [{"name": "a"}, {"name": "b"}]}});
        assert_eq!(
            parse_table_info(&table).unwrap(),
            TableInfo {
                num_rows: 1200,
                num_columns: 2
            }
        );
        assert!(parse_table_info(&json!({})).is_err());
    }

    #[test]
    fn api_errors_prefer_the_structured_message() {
        assert_eq!(api_error_message(br#"{"error":{"code":403,"message":"denied"}}"#), "denied");
        assert_eq!(api_error_message(b"plain"), "plain");
    }
}
