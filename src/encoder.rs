use crate::record::SerializedRecord;

/// Error returned when a record cannot be turned into a frame.
#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("encoded frame contains a line break")]
    EmbeddedNewline,
}

/// Encoding capability injected into a [`FileSink`](crate::sink::FileSink).
///
/// The sink stores one frame per line while a file is live and asks the
/// encoder to wrap the complete frames into a single document on finalize.
/// Frames therefore must not contain `\n`.
pub trait RecordEncoder: Send + Sync + 'static {
    /// Encode a single record into one frame.
    fn encode(&self, record: &SerializedRecord) -> Result<Vec<u8>, EncodeError>;

    /// Wrap frames (in append order) into one independently parseable document.
    fn wrap_sequence(&self, frames: &[&[u8]]) -> Vec<u8>;

    /// Extension used when the live file path has none.
    fn default_extension(&self) -> &'static str;
}

/// Finalized files are a JSON array of record objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl RecordEncoder for JsonEncoder {
    fn encode(&self, record: &SerializedRecord) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(record)?)
    }

    fn wrap_sequence(&self, frames: &[&[u8]]) -> Vec<u8> {
        let body: usize = frames.iter().map(|f| f.len() + 1).sum();
        let mut out = Vec::with_capacity(body + 2);
        out.push(b'[');
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(frame);
        }
        out.push(b']');
        out
    }

    fn default_extension(&self) -> &'static str {
        "json"
    }
}

/// Finalized files are newline-delimited JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesEncoder;

impl RecordEncoder for JsonLinesEncoder {
    fn encode(&self, record: &SerializedRecord) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(record)?)
    }

    fn wrap_sequence(&self, frames: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend_from_slice(frame);
            out.push(b'\n');
        }
        out
    }

    fn default_extension(&self) -> &'static str {
        "ndjson"
    }
}
