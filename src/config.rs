use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builds the request parameters for an upload from host details.
pub type ParameterBuilder = Arc<dyn Fn(&DeviceInfo) -> BTreeMap<String, Value> + Send + Sync>;

/// Returns headers for an upload request, e.g. a freshly issued auth token.
/// Evaluated once per request.
pub type HeaderProvider = Arc<dyn Fn() -> BTreeMap<String, String> + Send + Sync>;

/// How request parameters are put into the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterEncoding {
    /// `application/json` object.
    #[default]
    Json,
    /// `application/x-www-form-urlencoded`; values must be scalars.
    Form,
}

/// Host and application details sent along with every upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_identifier: String,
    pub device_model: String,
    pub device_name: String,
    pub system_name: String,
    pub system_version: String,
    pub app_version: String,
    pub app_build_version: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            device_identifier: "n/A".to_string(),
            device_model: "n/A".to_string(),
            device_name: "n/A".to_string(),
            system_name: "n/A".to_string(),
            system_version: "n/A".to_string(),
            app_version: "undefined".to_string(),
            app_build_version: "undefined".to_string(),
        }
    }
}

impl DeviceInfo {
    /// Details of the running host. Application versions stay `undefined`
    /// until set with [`DeviceInfo::with_app_version`].
    pub fn current() -> Self {
        let name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "n/A".to_string());

        DeviceInfo {
            device_identifier: name.clone(),
            device_model: std::env::consts::ARCH.to_string(),
            device_name: name,
            system_name: std::env::consts::OS.to_string(),
            system_version: std::env::consts::FAMILY.to_string(),
            ..DeviceInfo::default()
        }
    }

    pub fn with_app_version(mut self, version: impl Into<String>, build: impl Into<String>) -> Self {
        self.app_version = version.into();
        self.app_build_version = build.into();
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.device_identifier = identifier.into();
        self
    }
}

/// Parameters sent when no custom builder is configured.
pub fn default_parameters(info: &DeviceInfo) -> BTreeMap<String, Value> {
    [
        ("deviceIdentifier", &info.device_identifier),
        ("deviceModel", &info.device_model),
        ("deviceName", &info.device_name),
        ("systemName", &info.system_name),
        ("systemVersion", &info.system_version),
        ("appVersion", &info.app_version),
        ("appBuildVersion", &info.app_build_version),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), Value::String(value.clone())))
    .collect()
}

/// Upload settings of one destination.
#[derive(Clone)]
pub struct UploadConfig {
    /// Endpoint the finalized log files are POSTed to.
    pub target_url: String,
    pub parameter_builder: ParameterBuilder,
    pub header_provider: Option<HeaderProvider>,
    pub parameter_encoding: ParameterEncoding,
    /// Keep successfully uploaded files under `successful/`. Default `false`.
    pub store_successful_uploads: bool,
    /// Keep failed files under `failed/` for later retries. Default `true`.
    pub store_failed_uploads: bool,
    /// Retry `failed/` after the next successful upload. Default `true`;
    /// only effective together with `store_failed_uploads`.
    pub auto_retry_failed_uploads: bool,
    /// Root of the staging areas; each destination uses `<home>/<id>/`.
    pub uploader_home: PathBuf,
    /// Upper bound for a single transport call.
    pub request_timeout: Duration,
}

impl UploadConfig {
    pub fn new(target_url: impl Into<String>, uploader_home: impl Into<PathBuf>) -> Self {
        UploadConfig {
            target_url: target_url.into(),
            parameter_builder: Arc::new(default_parameters),
            header_provider: None,
            parameter_encoding: ParameterEncoding::default(),
            store_successful_uploads: false,
            store_failed_uploads: true,
            auto_retry_failed_uploads: true,
            uploader_home: uploader_home.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_parameters<F>(mut self, builder: F) -> Self
    where
        F: Fn(&DeviceInfo) -> BTreeMap<String, Value> + Send + Sync + 'static,
    {
        self.parameter_builder = Arc::new(builder);
        self
    }

    pub fn with_headers<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> BTreeMap<String, String> + Send + Sync + 'static,
    {
        self.header_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_encoding(mut self, encoding: ParameterEncoding) -> Self {
        self.parameter_encoding = encoding;
        self
    }

    pub fn store_successful(mut self, store: bool) -> Self {
        self.store_successful_uploads = store;
        self
    }

    pub fn store_failed(mut self, store: bool) -> Self {
        self.store_failed_uploads = store;
        self
    }

    pub fn auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry_failed_uploads = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Auto-retry only makes sense when failed files are kept.
    pub fn auto_retry_enabled(&self) -> bool {
        self.auto_retry_failed_uploads && self.store_failed_uploads
    }
}

impl fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadConfig")
            .field("target_url", &self.target_url)
            .field("header_provider", &self.header_provider.is_some())
            .field("parameter_encoding", &self.parameter_encoding)
            .field("store_successful_uploads", &self.store_successful_uploads)
            .field("store_failed_uploads", &self.store_failed_uploads)
            .field("auto_retry_failed_uploads", &self.auto_retry_failed_uploads)
            .field("uploader_home", &self.uploader_home)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
