use crate::config::{DeviceInfo, ParameterEncoding, UploadConfig};
use crate::error::RequestBuildError;
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Parameter that carries the base64 encoded log file.
pub const LOG_FILE_PARAMETER: &str = "logFile";

/// Fully prepared POST request for one log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl UploadRequest {
    /// Read `file` and build the request described by `config`.
    ///
    /// The header provider is invoked here, so every request carries
    /// freshly issued values.
    pub async fn build(config: &UploadConfig, device: &DeviceInfo, file: &Path) -> Result<Self, RequestBuildError> {
        let contents = tokio::fs::read(file)
            .await
            .map_err(|source| RequestBuildError::ReadArtifact {
                path: file.to_path_buf(),
                source,
            })?;

        let mut parameters = (config.parameter_builder)(device);
        parameters.insert(
            LOG_FILE_PARAMETER.to_string(),
            Value::String(base64::engine::general_purpose::STANDARD.encode(contents)),
        );

        let (content_type, body) = match config.parameter_encoding {
            ParameterEncoding::Json => ("application/json", serde_json::to_vec(&parameters)?),
            ParameterEncoding::Form => ("application/x-www-form-urlencoded", form_encode(&parameters)?),
        };

        let headers = config
            .header_provider
            .as_ref()
            .map(|provider| provider())
            .unwrap_or_default();

        Ok(UploadRequest {
            url: config.target_url.clone(),
            headers,
            content_type,
            body,
        })
    }
}

fn form_encode(parameters: &BTreeMap<String, Value>) -> Result<Vec<u8>, RequestBuildError> {
    let mut pairs = Vec::with_capacity(parameters.len());
    for (key, value) in parameters {
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            Value::Array(_) | Value::Object(_) => {
                return Err(RequestBuildError::UnsupportedFormValue(key.clone()));
            }
        };
        pairs.push(format!("{}={}", urlencoding::encode(key), urlencoding::encode(&value)));
    }
    Ok(pairs.join("&").into_bytes())
}

/// Status returned by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
}

/// Failure to obtain any response at all.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Connection(String),
}

/// HTTP client collaborator that performs the actual request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and report the response status.
    ///
    /// Non-2xx statuses are returned as `Ok`; classification happens in
    /// the uploader.
    async fn send(&self, request: UploadRequest) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by `reqwest`.
#[cfg(feature = "http")]
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    /// Construct a transport whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: UploadRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, request.content_type);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.body(request.body).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Connection(format!("request timed out: {}", e))
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        Ok(TransportResponse {
            status: resp.status().as_u16(),
        })
    }
}

/// Transport that answers every request with a fixed status and keeps the
/// requests it saw.
///
/// Useful for measuring the pipeline without network I/O, and for tests.
#[derive(Debug)]
pub struct StubTransport {
    status: AtomicU16,
    requests: Mutex<Vec<UploadRequest>>,
}

impl StubTransport {
    pub fn new(status: u16) -> Self {
        StubTransport {
            status: AtomicU16::new(status),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Change the status returned from now on.
    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<UploadRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new(200)
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(&self, request: UploadRequest) -> Result<TransportResponse, TransportError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        Ok(TransportResponse {
            status: self.status.load(Ordering::SeqCst),
        })
    }
}
