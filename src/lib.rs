//! Durable, append-only log sink with deferred upload.
//!
//! Records are appended to a live file per destination, the file is
//! finalized into a complete document, moved into a staging area and
//! posted to an HTTP endpoint. Outcomes are archived under `successful/`
//! or `failed/`; failed files are retried on demand or after the next
//! successful upload.

pub mod record;
pub mod encoder;
pub mod sink;
pub mod layer;
pub mod staging;
pub mod config;
pub mod transport;
pub mod error;
pub mod uploader;
pub mod registry;

pub mod init;
pub mod env;

pub use config::{DeviceInfo, ParameterEncoding, UploadConfig};
pub use error::{BatchEntry, BatchResult, NetworkError, UploadError, UploadResult};
pub use record::{FieldSelection, Level, LogRecord};
pub use registry::{Destination, DestinationConfig, Registry};
pub use sink::{FileSink, LogSink};
pub use uploader::{DefaultUploader, Uploader};
