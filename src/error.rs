use std::fmt;
use std::path::PathBuf;

/// Outcome of a single upload: `Ok(())` or the reason it failed.
pub type UploadResult = Result<(), UploadError>;

/// Errors reported by upload and retry operations.
#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error("no destination is registered with the given identifier")]
    MissingDestination,

    #[error("destination has no upload configuration")]
    MissingConfiguration,

    #[error("log file could not be prepared for upload: {0}")]
    LogFile(String),

    #[error("upload request could not be built: {0}")]
    RequestBuild(#[from] RequestBuildError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

/// Classification of a failed request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("could not reach the endpoint: {0}")]
    Connection(String),

    #[error("endpoint rejected the credentials (401)")]
    Authentication,

    #[error("endpoint reported a client error ({0})")]
    ClientError(u16),

    #[error("endpoint reported a server error ({0})")]
    ServerError(u16),
}

impl NetworkError {
    /// Classify a response status; `None` for 2xx.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 => Some(NetworkError::Authentication),
            400..=499 => Some(NetworkError::ClientError(status)),
            500..=599 => Some(NetworkError::ServerError(status)),
            other => Some(NetworkError::Connection(format!("unexpected HTTP status {}", other))),
        }
    }
}

/// Failures while turning a staged file into a transport request.
#[derive(thiserror::Error, Debug)]
pub enum RequestBuildError {
    #[error("failed to read {path}: {source}")]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode request parameters: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("parameter `{0}` cannot be form-encoded")]
    UnsupportedFormValue(String),
}

/// Failures of the finalize step of a [`FileSink`](crate::sink::FileSink).
#[derive(thiserror::Error, Debug)]
pub enum FinalizeError {
    #[error("no live log file at {0}")]
    MissingLiveFile(PathBuf),

    #[error("file operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sink lane has shut down")]
    LaneClosed,
}

impl FinalizeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FinalizeError::Io { path: path.into(), source }
    }
}

impl From<FinalizeError> for UploadError {
    fn from(err: FinalizeError) -> Self {
        UploadError::LogFile(err.to_string())
    }
}

/// Errors returned when managing registered destinations.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("destination `{0}` is already registered")]
    DuplicateDestination(String),
}

/// One outcome inside a [`BatchResult`].
#[derive(Debug)]
pub struct BatchEntry {
    pub destination_id: String,
    /// File the outcome belongs to; `None` when the operation failed before
    /// a file was selected.
    pub file_name: Option<String>,
    pub result: UploadResult,
}

impl fmt::Display for BatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self.file_name.as_deref().unwrap_or("n/A");
        match &self.result {
            Ok(()) => write!(f, "{}/{}: uploaded", self.destination_id, file),
            Err(e) => write!(f, "{}/{}: {}", self.destination_id, file, e),
        }
    }
}

/// Ordered outcomes of an operation spanning several files or destinations.
#[derive(Debug, Default)]
pub struct BatchResult {
    entries: Vec<BatchEntry>,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch holding a single entry that applies to the whole destination.
    pub fn single(destination_id: impl Into<String>, result: UploadResult) -> Self {
        let mut batch = Self::new();
        batch.push(destination_id, None, result);
        batch
    }

    pub fn push(&mut self, destination_id: impl Into<String>, file_name: Option<String>, result: UploadResult) {
        self.entries.push(BatchEntry {
            destination_id: destination_id.into(),
            file_name,
            result,
        });
    }

    pub fn extend(&mut self, other: BatchResult) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.entries.iter().all(|e| e.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchEntry> {
        self.entries.iter().filter(|e| e.result.is_err())
    }
}

impl IntoIterator for BatchResult {
    type Item = BatchEntry;
    type IntoIter = std::vec::IntoIter<BatchEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(NetworkError::from_status(200), None);
        assert_eq!(NetworkError::from_status(204), None);
        assert_eq!(NetworkError::from_status(401), Some(NetworkError::Authentication));
        assert_eq!(NetworkError::from_status(400), Some(NetworkError::ClientError(400)));
        assert_eq!(NetworkError::from_status(499), Some(NetworkError::ClientError(499)));
        assert_eq!(NetworkError::from_status(503), Some(NetworkError::ServerError(503)));
        assert!(matches!(NetworkError::from_status(302), Some(NetworkError::Connection(_))));
    }

    #[test]
    fn batch_reports_failures_in_order() {
        let mut batch = BatchResult::new();
        batch.push("d1", Some("a.json".into()), Ok(()));
        batch.push("d1", Some("b.json".into()), Err(NetworkError::ServerError(500).into()));
        batch.extend(BatchResult::single("d2", Err(UploadError::MissingConfiguration)));

        assert_eq!(batch.len(), 3);
        assert!(!batch.all_succeeded());
        let failed: Vec<_> = batch.failures().map(|e| e.to_string()).collect();
        assert_eq!(
            failed,
            [
                "d1/b.json: network error: endpoint reported a server error (500)",
                "d2/n/A: destination has no upload configuration",
            ]
        );
    }
}
