use crate::config::{DeviceInfo, UploadConfig};
use crate::error::{BatchResult, NetworkError, UploadError, UploadResult};
use crate::registry::Destination;
use crate::staging::{timestamped_files, Outcome, StagingArea};
use crate::transport::{Transport, TransportError, UploadRequest};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Moves finalized log files of a [`Destination`] to the remote endpoint.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Finalize the destination's live file and upload it.
    async fn upload(&self, destination: &Arc<Destination>) -> UploadResult;

    /// Re-submit every file in the destination's `failed/` folder.
    async fn retry_failed(&self, destination: &Arc<Destination>) -> BatchResult;

    /// Wait for background work (auto-retries) started by earlier uploads.
    async fn drain(&self) {}
}

struct Inner {
    transport: Arc<dyn Transport>,
    device: DeviceInfo,
    background: Mutex<JoinSet<()>>,
}

/// Default [`Uploader`]: stage, request, classify, archive.
///
/// Uploads and retries of one destination are serialized through the
/// destination's upload lock; different destinations proceed in parallel.
#[derive(Clone)]
pub struct DefaultUploader {
    inner: Arc<Inner>,
}

impl DefaultUploader {
    pub fn new(transport: Arc<dyn Transport>, device: DeviceInfo) -> Self {
        DefaultUploader {
            inner: Arc::new(Inner {
                transport,
                device,
                background: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.inner.device
    }

    async fn upload_locked(&self, destination: &Destination, config: &UploadConfig, staging: &StagingArea) -> UploadResult {
        let sink = destination.sink();
        self.adopt_leftovers(destination, config, staging).await;
        let artifact = sink.finalize().await?;

        let staged = staging.stage(&artifact).await;
        // Producers write to a fresh live file while the request is in flight.
        sink.open();
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                error!(destination = %destination.id(), path = %artifact.display(), "failed to move log file into staging: {}", e);
                if let Err(archive_err) = staging.archive(&artifact, Outcome::Failed, true).await {
                    warn!(
                        destination = %destination.id(),
                        path = %artifact.display(),
                        "log file stays next to the live file until the next upload: {}",
                        archive_err
                    );
                }
                return Err(UploadError::LogFile(e.to_string()));
            }
        };

        self.deliver(destination.id(), config, staging, &staged).await
    }

    /// Move artifacts that never reached the staging area (a failed move, an
    /// interrupted finalize) into `failed/` so retries pick them up.
    async fn adopt_leftovers(&self, destination: &Destination, config: &UploadConfig, staging: &StagingArea) {
        let sink = destination.sink();
        let leftovers = match timestamped_files(sink.artifact_dir(), &sink.artifact_stem(), sink.extension()).await {
            Ok(leftovers) => leftovers,
            Err(e) => {
                warn!(destination = %destination.id(), "failed to look for leftover log files: {}", e);
                return;
            }
        };

        for file in leftovers {
            match staging.archive(&file, Outcome::Failed, config.store_failed_uploads).await {
                Ok(_) => debug!(destination = %destination.id(), path = %file.display(), "adopted leftover log file"),
                Err(e) => warn!(destination = %destination.id(), path = %file.display(), "failed to adopt leftover log file: {}", e),
            }
        }
    }

    /// Build the request for a staged file, send it and archive the file
    /// according to the outcome.
    async fn deliver(&self, id: &str, config: &UploadConfig, staging: &StagingArea, staged: &Path) -> UploadResult {
        let result = match UploadRequest::build(config, &self.inner.device, staged).await {
            Ok(request) => self.send(config, request).await,
            Err(e) => Err(UploadError::RequestBuild(e)),
        };

        let (outcome, store) = match &result {
            Ok(()) => (Outcome::Successful, config.store_successful_uploads),
            Err(_) => (Outcome::Failed, config.store_failed_uploads),
        };
        if let Err(e) = staging.archive(staged, outcome, store).await {
            warn!(destination = %id, path = %staged.display(), ?outcome, "file handling after log upload failed: {}", e);
        }

        result
    }

    async fn send(&self, config: &UploadConfig, request: UploadRequest) -> UploadResult {
        let sent = tokio::time::timeout(config.request_timeout, self.inner.transport.send(request))
            .await
            .unwrap_or(Err(TransportError::Timeout(config.request_timeout)));

        match sent {
            Ok(response) => match NetworkError::from_status(response.status) {
                None => Ok(()),
                Some(e) => Err(UploadError::Network(e)),
            },
            Err(e) => Err(UploadError::Network(NetworkError::Connection(e.to_string()))),
        }
    }

    async fn retry_locked(&self, destination: &Destination, config: &UploadConfig, staging: &StagingArea) -> BatchResult {
        let id = destination.id();
        let files = match staging.failed_files().await {
            Ok(files) => files,
            Err(e) => {
                error!(destination = %id, "failed to list failed log uploads: {}", e);
                return BatchResult::single(id, Err(UploadError::LogFile(e.to_string())));
            }
        };

        let mut batch = BatchResult::new();
        for file in files {
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned());
            let result = match staging.unstage_failed(&file).await {
                Ok(staged) => self.deliver(id, config, staging, &staged).await,
                Err(e) => Err(UploadError::LogFile(e.to_string())),
            };

            let shown = name.as_deref().unwrap_or("n/A");
            match &result {
                Ok(()) => debug!(destination = %id, file = shown, "upload of failed log file succeeded"),
                Err(e) => error!(destination = %id, file = shown, "upload of failed log file failed: {}", e),
            }
            batch.push(id, name, result);
        }
        batch
    }

    fn spawn_retry(&self, destination: Arc<Destination>) {
        let uploader = self.clone();
        let Ok(mut background) = self.inner.background.lock() else {
            warn!(destination = %destination.id(), "skipping automatic retry of failed log uploads");
            return;
        };
        reap_finished(&mut background);
        background.spawn(async move {
            let results = uploader.retry_failed(&destination).await;
            debug!(
                destination = %destination.id(),
                files = results.len(),
                failed = results.failures().count(),
                "automatic retry of failed log uploads finished"
            );
        });
    }
}

fn reap_finished(background: &mut JoinSet<()>) {
    while let Some(joined) = background.try_join_next() {
        if let Err(e) = joined {
            warn!("automatic retry task ended abnormally: {}", e);
        }
    }
}

#[async_trait]
impl Uploader for DefaultUploader {
    async fn upload(&self, destination: &Arc<Destination>) -> UploadResult {
        let Some(config) = destination.config() else {
            return Err(UploadError::MissingConfiguration);
        };
        let staging = destination.staging(config);

        let result = {
            let _guard = destination.upload_lock().lock().await;
            self.upload_locked(destination, config, &staging).await
        };

        match &result {
            Ok(()) => {
                info!(destination = %destination.id(), "log upload succeeded");
                if config.auto_retry_enabled() && staging.has_failed_files().await {
                    self.spawn_retry(Arc::clone(destination));
                }
            }
            Err(e) => error!(destination = %destination.id(), "log upload failed: {}", e),
        }
        result
    }

    async fn retry_failed(&self, destination: &Arc<Destination>) -> BatchResult {
        let Some(config) = destination.config() else {
            return BatchResult::single(destination.id(), Err(UploadError::MissingConfiguration));
        };
        let staging = destination.staging(config);

        let _guard = destination.upload_lock().lock().await;
        self.retry_locked(destination, config, &staging).await
    }

    async fn drain(&self) {
        loop {
            let mut pending = match self.inner.background.lock() {
                Ok(mut background) => std::mem::take(&mut *background),
                Err(_) => return,
            };
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(e) = joined {
                    warn!("automatic retry task ended abnormally: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DestinationConfig;
    use crate::sink::{Lane, LogSink};
    use crate::record::{Level, LogRecord};
    use crate::transport::StubTransport;

    struct Fixture {
        _dir: tempfile::TempDir,
        home: std::path::PathBuf,
        lane: Lane,
        stub: Arc<StubTransport>,
        uploader: DefaultUploader,
    }

    fn fixture(status: u16) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("uploads");
        let (lane, _handle) = Lane::spawn();
        let stub = Arc::new(StubTransport::new(status));
        let uploader = DefaultUploader::new(stub.clone(), DeviceInfo::default());
        Fixture { _dir: dir, home, lane, stub, uploader }
    }

    fn destination(fx: &Fixture, config: Option<UploadConfig>) -> Arc<Destination> {
        let mut settings = DestinationConfig::json("d1", fx.home.parent().unwrap().join("live/d1.json"));
        if let Some(config) = config {
            settings = settings.with_upload(config);
        }
        Arc::new(Destination::new(&fx.lane, settings))
    }

    fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).filter(|p| p.is_file()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn missing_configuration_is_reported() {
        let fx = fixture(200);
        let dest = destination(&fx, None);
        assert!(matches!(fx.uploader.upload(&dest).await, Err(UploadError::MissingConfiguration)));

        let batch = fx.uploader.retry_failed(&dest).await;
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch.entries()[0].result, Err(UploadError::MissingConfiguration)));
    }

    #[tokio::test]
    async fn missing_live_file_is_a_log_file_error() {
        let fx = fixture(200);
        let dest = destination(&fx, Some(UploadConfig::new("http://localhost/", &fx.home)));
        assert!(matches!(fx.uploader.upload(&dest).await, Err(UploadError::LogFile(_))));
        assert_eq!(fx.stub.request_count(), 0);
    }

    #[tokio::test]
    async fn success_deletes_by_default_and_reopens_sink() {
        let fx = fixture(200);
        let dest = destination(&fx, Some(UploadConfig::new("http://localhost/", &fx.home)));
        dest.sink().append(&LogRecord::new(Level::Info, "hello"));

        fx.uploader.upload(&dest).await.unwrap();

        assert_eq!(fx.stub.request_count(), 1);
        assert!(files_in(&fx.home.join("d1")).is_empty());
        assert!(files_in(&fx.home.join("d1/successful")).is_empty());
        assert!(dest.sink().is_open().await);
    }

    #[tokio::test]
    async fn success_is_kept_when_configured() {
        let fx = fixture(200);
        let config = UploadConfig::new("http://localhost/", &fx.home).store_successful(true);
        let dest = destination(&fx, Some(config));
        dest.sink().append(&LogRecord::new(Level::Info, "hello"));

        fx.uploader.upload(&dest).await.unwrap();

        let kept = files_in(&fx.home.join("d1/successful"));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].extension().unwrap(), "json");
        assert!(files_in(&fx.home.join("d1")).is_empty());
    }

    #[tokio::test]
    async fn failure_without_store_deletes() {
        let fx = fixture(500);
        let config = UploadConfig::new("http://localhost/", &fx.home).store_failed(false);
        let dest = destination(&fx, Some(config));
        dest.sink().append(&LogRecord::new(Level::Error, "boom"));

        let result = fx.uploader.upload(&dest).await;
        assert!(matches!(result, Err(UploadError::Network(NetworkError::ServerError(500)))));
        assert!(files_in(&fx.home.join("d1/failed")).is_empty());
        assert!(files_in(&fx.home.join("d1")).is_empty());
    }

    #[tokio::test]
    async fn retry_processes_every_file_independently() {
        let fx = fixture(200);
        let dest = destination(&fx, Some(UploadConfig::new("http://localhost/", &fx.home)));
        let failed = fx.home.join("d1/failed");
        std::fs::create_dir_all(&failed).unwrap();
        std::fs::write(failed.join("1.json"), b"[]").unwrap();
        std::fs::write(failed.join("2.json"), b"[]").unwrap();
        std::fs::write(failed.join("skip.txt"), b"").unwrap();

        let batch = fx.uploader.retry_failed(&dest).await;

        assert_eq!(batch.len(), 2);
        assert!(batch.all_succeeded());
        let names: Vec<_> = batch.entries().iter().map(|e| e.file_name.clone().unwrap()).collect();
        assert_eq!(names, ["1.json", "2.json"]);
        assert_eq!(files_in(&failed), vec![failed.join("skip.txt")]);
    }

    #[tokio::test]
    async fn retry_without_failed_dir_is_empty() {
        let fx = fixture(200);
        let dest = destination(&fx, Some(UploadConfig::new("http://localhost/", &fx.home)));
        assert!(fx.uploader.retry_failed(&dest).await.is_empty());
    }

    #[tokio::test]
    async fn finished_retries_do_not_accumulate() {
        let fx = fixture(200);
        let dest = destination(&fx, Some(UploadConfig::new("http://localhost/", &fx.home)));
        let failed = fx.home.join("d1/failed");

        for i in 0..10 {
            std::fs::create_dir_all(&failed).unwrap();
            std::fs::write(failed.join(format!("{}.json", i)), b"[]").unwrap();
            dest.sink().append(&LogRecord::new(Level::Info, "tick"));
            fx.uploader.upload(&dest).await.unwrap();

            tokio::time::timeout(std::time::Duration::from_secs(5), async {
                while fx.stub.request_count() < 2 * (i + 1) || !files_in(&failed).is_empty() {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        assert!(fx.uploader.inner.background.lock().unwrap().len() <= 2);
        fx.uploader.drain().await;
        assert!(fx.uploader.inner.background.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unstageable_artifact_is_kept_for_retry() {
        let fx = fixture(200);
        let config = UploadConfig::new("http://localhost/", &fx.home).auto_retry(false);
        let dest = destination(&fx, Some(config));
        // A plain file where the staging directory should be.
        std::fs::create_dir_all(&fx.home).unwrap();
        std::fs::write(fx.home.join("d1"), b"").unwrap();
        dest.sink().append(&LogRecord::new(Level::Error, "first"));

        let result = fx.uploader.upload(&dest).await;
        assert!(matches!(result, Err(UploadError::LogFile(_))));
        assert_eq!(fx.stub.request_count(), 0);

        std::fs::remove_file(fx.home.join("d1")).unwrap();
        dest.sink().append(&LogRecord::new(Level::Info, "second"));
        fx.uploader.upload(&dest).await.unwrap();

        let failed = files_in(&fx.home.join("d1/failed"));
        assert_eq!(failed.len(), 1);
        assert!(std::fs::read_to_string(&failed[0]).unwrap().contains("first"));
        assert_eq!(fx.stub.request_count(), 1);

        let batch = fx.uploader.retry_failed(&dest).await;
        assert!(batch.all_succeeded());
        assert_eq!(batch.len(), 1);
    }

    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn send(&self, _request: UploadRequest) -> Result<crate::transport::TransportResponse, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stuck_transport_times_out_as_connection_error() {
        let fx = fixture(200);
        let uploader = DefaultUploader::new(Arc::new(HangingTransport), DeviceInfo::default());
        let config = UploadConfig::new("http://localhost/", &fx.home)
            .with_timeout(std::time::Duration::from_millis(50));
        let dest = destination(&fx, Some(config));
        dest.sink().append(&LogRecord::new(Level::Info, "slow"));

        let result = uploader.upload(&dest).await;
        assert!(matches!(result, Err(UploadError::Network(NetworkError::Connection(_)))));
        assert_eq!(files_in(&fx.home.join("d1/failed")).len(), 1);
    }
}
