use crate::config::UploadConfig;
use crate::encoder::{JsonEncoder, RecordEncoder};
use crate::error::{BatchResult, RegistryError, UploadError, UploadResult};
use crate::record::FieldSelection;
use crate::sink::{FileSink, Lane, LogSink};
use crate::staging::StagingArea;
use crate::uploader::Uploader;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything needed to register a destination.
#[derive(Clone)]
pub struct DestinationConfig {
    pub id: String,
    pub file_path: PathBuf,
    pub encoder: Arc<dyn RecordEncoder>,
    pub fields: FieldSelection,
    pub upload: Option<UploadConfig>,
}

impl DestinationConfig {
    /// Destination writing JSON records to `file_path`, without upload
    /// settings.
    pub fn json(id: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        DestinationConfig {
            id: id.into(),
            file_path: file_path.into(),
            encoder: Arc::new(JsonEncoder),
            fields: FieldSelection::default(),
            upload: None,
        }
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn RecordEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_fields(mut self, fields: FieldSelection) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_upload(mut self, upload: UploadConfig) -> Self {
        self.upload = Some(upload);
        self
    }
}

/// One logical log stream: its sink, its upload settings and the lock that
/// keeps at most one upload of it in flight.
pub struct Destination {
    sink: FileSink,
    config: Option<UploadConfig>,
    upload_lock: Mutex<()>,
}

impl Destination {
    pub fn new(lane: &Lane, settings: DestinationConfig) -> Self {
        let sink = FileSink::new(lane, settings.id, settings.file_path, settings.encoder, settings.fields);
        Destination {
            sink,
            config: settings.upload,
            upload_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        self.sink.id()
    }

    pub fn sink(&self) -> &FileSink {
        &self.sink
    }

    pub fn config(&self) -> Option<&UploadConfig> {
        self.config.as_ref()
    }

    /// Staging area of this destination below `config.uploader_home`.
    pub fn staging(&self, config: &UploadConfig) -> StagingArea {
        StagingArea::new(&config.uploader_home, self.id(), self.sink.extension())
    }

    pub fn upload_lock(&self) -> &Mutex<()> {
        &self.upload_lock
    }
}

/// Which stored files a bulk delete removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cleanup {
    All,
    Successful,
}

/// Process-wide set of destinations sharing one sink lane and one uploader.
///
/// Construct it explicitly, hand references to whoever needs it and call
/// [`Registry::shutdown`] before exiting so live files are synced.
pub struct Registry {
    lane: Lane,
    lane_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    uploader: Arc<dyn Uploader>,
    destinations: RwLock<Vec<Arc<Destination>>>,
}

impl Registry {
    /// Create a registry and spawn its lane on the current Tokio runtime.
    pub fn new(uploader: Arc<dyn Uploader>) -> Self {
        let (lane, handle) = Lane::spawn();
        Registry {
            lane,
            lane_task: std::sync::Mutex::new(Some(handle)),
            uploader,
            destinations: RwLock::new(Vec::new()),
        }
    }

    pub fn lane(&self) -> &Lane {
        &self.lane
    }

    /// Register and activate a destination. Its live file is opened right
    /// away.
    pub fn add_destination(&self, settings: DestinationConfig) -> Result<Arc<Destination>, RegistryError> {
        let mut destinations = self.destinations.write().unwrap_or_else(|e| e.into_inner());
        if destinations.iter().any(|d| d.id() == settings.id) {
            return Err(RegistryError::DuplicateDestination(settings.id));
        }

        let destination = Arc::new(Destination::new(&self.lane, settings));
        destination.sink().open();
        destinations.push(Arc::clone(&destination));
        Ok(destination)
    }

    /// Unregister a destination and close its live file.
    pub async fn remove_destination(&self, id: &str) -> Option<Arc<Destination>> {
        let removed = {
            let mut destinations = self.destinations.write().unwrap_or_else(|e| e.into_inner());
            let index = destinations.iter().position(|d| d.id() == id)?;
            destinations.remove(index)
        };
        removed.sink().close().await;
        Some(removed)
    }

    pub fn destination(&self, id: &str) -> Option<Arc<Destination>> {
        self.snapshot().into_iter().find(|d| d.id() == id)
    }

    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        self.snapshot()
    }

    /// Sinks of every registered destination, for front-ends that fan out.
    pub fn sinks(&self) -> Vec<Arc<dyn LogSink>> {
        self.snapshot()
            .into_iter()
            .map(|d| Arc::new(d.sink().clone()) as Arc<dyn LogSink>)
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<Destination>> {
        self.destinations.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn configured(&self) -> Vec<Arc<Destination>> {
        self.snapshot().into_iter().filter(|d| d.config().is_some()).collect()
    }

    /// Upload the live log file of the destination `id`.
    pub async fn upload_logs(&self, id: &str) -> UploadResult {
        match self.destination(id) {
            Some(destination) => self.uploader.upload(&destination).await,
            None => {
                error!(destination = %id, "log upload failed: {}", UploadError::MissingDestination);
                Err(UploadError::MissingDestination)
            }
        }
    }

    /// Retry the failed uploads of the destination `id`.
    pub async fn retry_failed(&self, id: &str) -> BatchResult {
        match self.destination(id) {
            Some(destination) => self.uploader.retry_failed(&destination).await,
            None => BatchResult::single(id, Err(UploadError::MissingDestination)),
        }
    }

    /// Upload every configured destination, one entry per destination.
    pub async fn upload_all(&self) -> BatchResult {
        let mut batch = BatchResult::new();
        for destination in self.configured() {
            let file_name = destination.sink().file_name();
            let result = self.uploader.upload(&destination).await;
            batch.push(destination.id(), file_name, result);
        }
        batch
    }

    /// Retry failed uploads of every configured destination, one entry per
    /// file.
    pub async fn retry_all_failed(&self) -> BatchResult {
        let mut batch = BatchResult::new();
        for destination in self.configured() {
            batch.extend(self.uploader.retry_failed(&destination).await);
        }
        batch
    }

    /// Delete every stored upload (staged, successful and failed).
    ///
    /// Stops at the first destination that cannot be cleaned; destinations
    /// processed before it stay deleted.
    pub async fn delete_all_stored_logs(&self) -> bool {
        self.delete_stored(Cleanup::All).await
    }

    /// Delete the files kept after successful uploads.
    pub async fn delete_successful_logs(&self) -> bool {
        self.delete_stored(Cleanup::Successful).await
    }

    async fn delete_stored(&self, cleanup: Cleanup) -> bool {
        let destinations = self.configured();
        if destinations.is_empty() {
            warn!("there are no uploaders with stored log files");
            return true;
        }

        for destination in destinations {
            let Some(config) = destination.config() else {
                continue;
            };
            let staging = destination.staging(config);
            let _guard = destination.upload_lock().lock().await;
            let deleted = match cleanup {
                Cleanup::All => staging.clear_all().await,
                Cleanup::Successful => staging.clear_successful().await,
            };
            if let Err(e) = deleted {
                error!(
                    destination = %destination.id(),
                    path = %staging.root().display(),
                    "failed to delete stored log files: {}",
                    e
                );
                return false;
            }
        }
        info!(?cleanup, "deleted stored log files");
        true
    }

    /// Wait for background retries, close every live file and stop the lane.
    pub async fn shutdown(&self) {
        self.uploader.drain().await;
        for destination in self.snapshot() {
            destination.sink().close().await;
        }
        self.lane.shutdown().await;

        let handle = self.lane_task.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("sink lane ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceInfo;
    use crate::error::NetworkError;
    use crate::record::{Level, LogRecord};
    use crate::transport::StubTransport;
    use crate::uploader::DefaultUploader;

    fn registry(status: u16) -> (Registry, Arc<StubTransport>) {
        let stub = Arc::new(StubTransport::new(status));
        let uploader = DefaultUploader::new(stub.clone(), DeviceInfo::default());
        (Registry::new(Arc::new(uploader)), stub)
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(200);
        registry.add_destination(DestinationConfig::json("d1", dir.path().join("a.json"))).unwrap();
        let err = registry
            .add_destination(DestinationConfig::json("d1", dir.path().join("b.json")))
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::DuplicateDestination(id) if id == "d1"));
    }

    #[tokio::test]
    async fn added_destination_is_active_until_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(200);
        let dest = registry.add_destination(DestinationConfig::json("d1", dir.path().join("a.json"))).unwrap();
        assert!(dest.sink().is_open().await);
        assert!(dir.path().join("a.json").exists());

        registry.remove_destination("d1").await.unwrap();
        assert!(!dest.sink().is_open().await);
        assert!(registry.destination("d1").is_none());
    }

    #[tokio::test]
    async fn unknown_destination_is_missing() {
        let (registry, _) = registry(200);
        assert!(matches!(registry.upload_logs("nope").await, Err(UploadError::MissingDestination)));
        let batch = registry.retry_failed("nope").await;
        assert!(matches!(batch.entries()[0].result, Err(UploadError::MissingDestination)));
    }

    #[tokio::test]
    async fn upload_all_skips_unconfigured_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("uploads");
        let (registry, stub) = registry(401);
        registry
            .add_destination(
                DestinationConfig::json("d1", dir.path().join("d1.json")).with_upload(UploadConfig::new("http://a/", &home)),
            )
            .unwrap();
        registry.add_destination(DestinationConfig::json("plain", dir.path().join("plain.json"))).unwrap();
        registry
            .add_destination(
                DestinationConfig::json("d2", dir.path().join("d2.json")).with_upload(UploadConfig::new("http://b/", &home)),
            )
            .unwrap();
        for sink in registry.sinks() {
            sink.append(&LogRecord::new(Level::Info, "fan out"));
        }

        let batch = registry.upload_all().await;

        let ids: Vec<_> = batch.entries().iter().map(|e| e.destination_id.as_str()).collect();
        assert_eq!(ids, ["d1", "d2"]);
        assert_eq!(batch.entries()[0].file_name.as_deref(), Some("d1.json"));
        assert!(batch
            .entries()
            .iter()
            .all(|e| matches!(e.result, Err(UploadError::Network(NetworkError::Authentication)))));
        assert_eq!(stub.request_count(), 2);
    }

    #[tokio::test]
    async fn delete_all_with_nothing_configured_succeeds() {
        let (registry, _) = registry(200);
        assert!(registry.delete_all_stored_logs().await);
        assert!(registry.delete_successful_logs().await);
    }

    #[tokio::test]
    async fn shutdown_closes_live_files() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(200);
        let dest = registry.add_destination(DestinationConfig::json("d1", dir.path().join("a.json"))).unwrap();
        dest.sink().append(&LogRecord::new(Level::Info, "last words"));

        registry.shutdown().await;

        let raw = std::fs::read_to_string(dir.path().join("a.json")).unwrap();
        assert!(raw.contains("last words"));
        assert!(!dest.sink().is_open().await);
    }
}
