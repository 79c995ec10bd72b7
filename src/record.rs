use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a [`LogRecord`].
///
/// Serialized as its integer rank so artifacts stay compact and portable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Level {
    Verbose = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Severe = 5,
    None = 6,
}

/// Returned when decoding a level rank outside `0..=6`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown log level rank {0}")]
pub struct UnknownLevel(pub u8);

impl From<Level> for u8 {
    fn from(level: Level) -> u8 {
        level as u8
    }
}

impl TryFrom<u8> for Level {
    type Error = UnknownLevel;

    fn try_from(rank: u8) -> Result<Self, UnknownLevel> {
        match rank {
            0 => Ok(Level::Verbose),
            1 => Ok(Level::Debug),
            2 => Ok(Level::Info),
            3 => Ok(Level::Warning),
            4 => Ok(Level::Error),
            5 => Ok(Level::Severe),
            6 => Ok(Level::None),
            other => Err(UnknownLevel(other)),
        }
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Level::Verbose,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warning,
            _ => Level::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Verbose => "verbose",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Severe => "severe",
            Level::None => "none",
        };
        f.write_str(name)
    }
}

/// One structured log entry as handed over by the logging front-end.
///
/// Records are immutable once built; which optional fields end up on disk
/// is decided by the sink's [`FieldSelection`], not by the record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub source_function: Option<String>,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
    pub thread_label: Option<String>,
    pub destination_id: Option<String>,
}

impl LogRecord {
    /// Create a record stamped with the current time and thread.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        LogRecord {
            level,
            timestamp: Utc::now(),
            message: message.into(),
            source_function: None,
            source_file: None,
            source_line: None,
            thread_label: Some(current_thread_label()),
            destination_id: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source_file = Some(file.into());
        self.source_line = Some(line);
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.source_function = Some(function.into());
        self
    }

    pub fn with_thread_label(mut self, label: impl Into<String>) -> Self {
        self.thread_label = Some(label.into());
        self
    }

    pub fn with_destination(mut self, destination_id: impl Into<String>) -> Self {
        self.destination_id = Some(destination_id.into());
        self
    }
}

/// Label of the calling thread: `main`, `T: <name>` or `T: <id>`.
pub fn current_thread_label() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some("main") => "main".to_string(),
        Some(name) if !name.is_empty() => format!("T: {}", name),
        _ => format!("T: {:?}", thread.id()),
    }
}

/// Selects which optional [`LogRecord`] fields a sink writes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSelection {
    pub show_date: bool,
    pub show_level: bool,
    pub show_function_name: bool,
    pub show_file_name: bool,
    pub show_line_number: bool,
    pub show_thread_name: bool,
    pub show_destination_id: bool,
}

impl Default for FieldSelection {
    fn default() -> Self {
        FieldSelection {
            show_date: true,
            show_level: true,
            show_function_name: true,
            show_file_name: true,
            show_line_number: true,
            show_thread_name: false,
            show_destination_id: false,
        }
    }
}

impl FieldSelection {
    /// Selection used for diagnostics emitted by this crate: call-site
    /// details point into the sink itself and carry no information.
    pub fn internal(self) -> Self {
        FieldSelection {
            show_function_name: false,
            show_file_name: false,
            show_line_number: false,
            ..self
        }
    }
}

/// Sparse, serializable projection of a [`LogRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,
    /// Seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<f64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_identifier: Option<String>,
}

impl SerializedRecord {
    pub fn project(record: &LogRecord, fields: &FieldSelection) -> Self {
        fn keep<T: Clone>(show: bool, value: &Option<T>) -> Option<T> {
            if show {
                value.clone()
            } else {
                None
            }
        }

        SerializedRecord {
            level: fields.show_level.then_some(record.level),
            date: fields.show_date.then(|| epoch_seconds(&record.timestamp)),
            message: record.message.clone(),
            function_name: keep(fields.show_function_name, &record.source_function),
            file_name: keep(fields.show_file_name, &record.source_file),
            line_number: keep(fields.show_line_number, &record.source_line),
            thread_name: keep(fields.show_thread_name, &record.thread_label),
            log_identifier: keep(fields.show_destination_id, &record.destination_id),
        }
    }
}

fn epoch_seconds(timestamp: &DateTime<Utc>) -> f64 {
    timestamp.timestamp() as f64 + f64::from(timestamp.timestamp_subsec_nanos()) / 1e9
}
