use crate::record::{current_thread_label, Level, LogRecord};
use crate::sink::LogSink;
use chrono::Utc;
use std::cell::Cell;
use std::fmt::Write as _;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Diagnostics of the sink lane itself are never written back into a sink:
/// a failing disk would otherwise feed its own error records forever.
const LANE_TARGET: &str = "tracing_upload_sink::sink";
const CRATE_TARGET: &str = "tracing_upload_sink";

/// Whether `target` is `module` or one of its submodules.
fn within(target: &str, module: &str) -> bool {
    match target.strip_prefix(module) {
        Some(rest) => rest.is_empty() || rest.starts_with("::"),
        None => false,
    }
}

thread_local! {
    static IN_LAYER: Cell<bool> = const { Cell::new(false) };
}

/// `tracing_subscriber` layer that turns events into [`LogRecord`]s and
/// appends them to every configured [`LogSink`].
///
/// Appending only enqueues work on the sink lane, so application threads
/// never wait for file I/O. Events below `min_level` are ignored.
pub struct UploadLogLayer {
    sinks: Vec<Arc<dyn LogSink>>,
    min_level: Level,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Events handed to the sinks.
    pub forwarded_events: Arc<AtomicU64>,
}

impl UploadLogLayer {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>, min_level: Level) -> Self {
        Self {
            sinks,
            min_level,
            total_events: Arc::new(AtomicU64::new(0)),
            forwarded_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<S> Layer<S> for UploadLogLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let meta = event.metadata();
        let level = Level::from(meta.level());
        if level < self.min_level || within(meta.target(), LANE_TARGET) {
            return;
        }
        if IN_LAYER.with(|flag| flag.replace(true)) {
            return;
        }

        let mut message = String::new();
        let mut extra = String::new();
        event.record(&mut FieldVisitor {
            message: &mut message,
            extra: &mut extra,
        });
        if !extra.is_empty() {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&extra);
        }

        let record = LogRecord {
            level,
            timestamp: Utc::now(),
            message,
            source_function: meta.module_path().map(|s| s.to_string()),
            source_file: meta.file().map(|s| s.to_string()),
            source_line: meta.line(),
            thread_label: Some(current_thread_label()),
            destination_id: None,
        };

        let internal = within(meta.target(), CRATE_TARGET);
        for sink in &self.sinks {
            if internal {
                sink.append_internal(&record);
            } else {
                sink.append(&record);
            }
        }
        self.forwarded_events.fetch_add(1, Ordering::Relaxed);

        IN_LAYER.with(|flag| flag.set(false));
    }
}

/// Collects the `message` field and renders the remaining fields as
/// `key=value` pairs.
pub struct FieldVisitor<'a> {
    pub message: &'a mut String,
    pub extra: &'a mut String,
}

impl FieldVisitor<'_> {
    fn push_extra(&mut self, field: &Field, value: std::fmt::Arguments<'_>) {
        if !self.extra.is_empty() {
            self.extra.push(' ');
        }
        let _ = write!(self.extra, "{}={}", field.name(), value);
    }
}

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_extra(field, format_args!("{:?}", value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push_extra(field, format_args!("{}", value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push_extra(field, format_args!("{}", value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push_extra(field, format_args!("{}", value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.push_extra(field, format_args!("{:?}", value));
        }
    }
}
