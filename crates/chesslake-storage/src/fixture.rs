//! Fixture-backed `JsonSource` used to replay captured API responses.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{parse_ndjson, ApiRequest, FetchError, JsonSource};

#[derive(Debug, Clone)]
pub enum FixtureResponse {
    Json(JsonValue),
    Ndjson(Vec<JsonValue>),
    Status(u16),
}

/// Routes are matched on the request URL alone; query parameters are
/// recorded but not part of the key.
#[derive(Debug, Default)]
pub struct FixtureSource {
    routes: HashMap<String, FixtureResponse>,
    requests: Mutex<Vec<ApiRequest>>,
}

#[derive(Debug, Deserialize)]
struct RouteManifest {
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    url: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    status: Option<u16>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_json(mut self, url: impl Into<String>, value: JsonValue) -> Self {
        self.routes.insert(url.into(), FixtureResponse::Json(value));
        self
    }

    pub fn with_ndjson(mut self, url: impl Into<String>, values: Vec<JsonValue>) -> Self {
        self.routes.insert(url.into(), FixtureResponse::Ndjson(values));
        self
    }

    pub fn with_status(mut self, url: impl Into<String>, status: u16) -> Self {
        self.routes.insert(url.into(), FixtureResponse::Status(status));
        self
    }

    /// Load a `routes.json` manifest. Files ending in `.ndjson` are served as
    /// NDJSON, everything else as a single JSON document.
    pub fn from_manifest(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let path = path.as_ref();
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let manifest: RouteManifest = serde_json::from_str(&fs::read_to_string(path)?)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut source = Self::new();
        for entry in manifest.routes {
            let response = match (&entry.file, entry.status) {
                (_, Some(status)) => FixtureResponse::Status(status),
                (Some(file), None) => {
                    let body = fs::read(base.join(file))?;
                    if file.ends_with(".ndjson") {
                        FixtureResponse::Ndjson(
                            parse_ndjson(&entry.url, &body).map_err(|e| {
                                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                            })?,
                        )
                    } else {
                        FixtureResponse::Json(serde_json::from_slice(&body).map_err(|e| {
                            std::io::Error::new(std::io::ErrorKind::InvalidData, e)
                        })?)
                    }
                }
                (None, None) => FixtureResponse::Status(404),
            };
            source.routes.insert(entry.url, response);
        }
        Ok(source)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn lookup(&self, request: &ApiRequest) -> Result<FixtureResponse, FetchError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        match self.routes.get(&request.url) {
            Some(FixtureResponse::Status(status)) => Err(FetchError::HttpStatus {
                status: *status,
                url: request.url.clone(),
            }),
            Some(response) => Ok(response.clone()),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: request.url.clone(),
            }),
        }
    }
}

#[async_trait]
impl JsonSource for FixtureSource {
    async fn get_json(&self, request: &ApiRequest) -> Result<JsonValue, FetchError> {
        match self.lookup(request)? {
            FixtureResponse::Json(value) => Ok(value),
            FixtureResponse::Ndjson(values) => Ok(JsonValue::Array(values)),
            FixtureResponse::Status(status) => Err(FetchError::HttpStatus {
                status,
                url: request.url.clone(),
            }),
        }
    }

    async fn get_ndjson(&self, request: &ApiRequest) -> Result<Vec<JsonValue>, FetchError> {
        match self.lookup(request)? {
            FixtureResponse::Ndjson(values) => Ok(values),
            FixtureResponse::Json(JsonValue::Array(values)) => Ok(values),
            FixtureResponse::Json(value) => Ok(vec![value]),
            FixtureResponse::Status(status) => Err(FetchError::HttpStatus {
                status,
                url: request.url.clone(),
            }),
        }
    }
}
