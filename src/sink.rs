use crate::encoder::{EncodeError, RecordEncoder};
use crate::error::FinalizeError;
use crate::record::{FieldSelection, LogRecord, SerializedRecord};
use crate::staging::{timestamped_files, unique_file_path};
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Destination for [`LogRecord`]s produced by the logging front-end.
///
/// `append` is called on application threads: it must only enqueue work
/// and must never report an error to the caller. Failures are logged and
/// the record is dropped.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Queue a record for writing.
    fn append(&self, record: &LogRecord);

    /// Queue a diagnostic emitted by this crate itself.
    ///
    /// Default implementation forwards to [`LogSink::append`].
    fn append_internal(&self, record: &LogRecord) {
        self.append(record);
    }

    /// Wait until every record appended before this call is on stable
    /// storage. Default implementation is a no-op.
    async fn flush(&self) {}
}

/// Counters shared between a [`Lane`] and its handles.
#[derive(Debug, Default)]
pub struct LaneStats {
    /// Frames written to a live file.
    pub appended: AtomicU64,
    /// Frames lost because the file could not be opened or written, or the
    /// lane was already shut down.
    pub dropped: AtomicU64,
}

#[derive(Debug)]
struct Target {
    id: String,
    path: PathBuf,
}

enum Command {
    Open {
        target: Arc<Target>,
        done: Option<oneshot::Sender<bool>>,
    },
    Append {
        target: Arc<Target>,
        frame: Vec<u8>,
    },
    Flush {
        target: Arc<Target>,
        done: oneshot::Sender<()>,
    },
    Close {
        target: Arc<Target>,
        done: oneshot::Sender<()>,
    },
    Finalize {
        target: Arc<Target>,
        encoder: Arc<dyn RecordEncoder>,
        extension: String,
        done: oneshot::Sender<Result<PathBuf, FinalizeError>>,
    },
    IsOpen {
        target: Arc<Target>,
        done: oneshot::Sender<bool>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Serialized background lane that owns every live file handle.
///
/// All sinks created on one lane share a single Tokio task, so appends,
/// flushes and finalizes against a destination are applied strictly in
/// submission order and never interleave.
#[derive(Clone)]
pub struct Lane {
    sender: mpsc::UnboundedSender<Command>,
    stats: Arc<LaneStats>,
}

impl Lane {
    /// Spawn the lane task on the current Tokio runtime.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(LaneStats::default());
        let handle = tokio::spawn(run_lane(rx, Arc::clone(&stats)));
        (Lane { sender: tx, stats }, handle)
    }

    pub fn stats(&self) -> &LaneStats {
        &self.stats
    }

    /// Close every live file and stop the lane task.
    ///
    /// Commands submitted afterwards are dropped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.submit(Command::Shutdown { done: tx }) {
            let _ = rx.await;
        }
    }

    fn submit(&self, command: Command) -> bool {
        self.sender.send(command).is_ok()
    }
}

struct LiveFile {
    path: PathBuf,
    file: File,
}

async fn run_lane(mut rx: mpsc::UnboundedReceiver<Command>, stats: Arc<LaneStats>) {
    let mut live: HashMap<String, LiveFile> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Open { target, done } => {
                let opened = open_live(&mut live, &target).await;
                if let Some(done) = done {
                    let _ = done.send(opened);
                }
            }
            Command::Append { target, frame } => {
                if !live.contains_key(&target.id) && !open_live(&mut live, &target).await {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let Some(entry) = live.get_mut(&target.id) else {
                    continue;
                };
                match entry.file.write_all(&frame).await {
                    Ok(()) => {
                        stats.appended.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        error!(destination = %target.id, path = %target.path.display(), "failed to append log record: {}", e);
                        // Part of the frame may have reached the file.
                        open_live(&mut live, &target).await;
                    }
                }
            }
            Command::Flush { target, done } => {
                if let Some(entry) = live.get_mut(&target.id) {
                    if let Err(e) = sync_live(entry).await {
                        warn!(destination = %target.id, "failed to flush log file: {}", e);
                    }
                }
                let _ = done.send(());
            }
            Command::Close { target, done } => {
                if let Some(entry) = live.remove(&target.id) {
                    close_live(&target.id, entry).await;
                }
                let _ = done.send(());
            }
            Command::Finalize {
                target,
                encoder,
                extension,
                done,
            } => {
                if let Some(entry) = live.remove(&target.id) {
                    close_live(&target.id, entry).await;
                }
                let result = finalize_file(&target, encoder.as_ref(), &extension).await;
                if let Err(e) = &result {
                    warn!(destination = %target.id, "failed to finalize log file: {}", e);
                }
                let _ = done.send(result);
            }
            Command::IsOpen { target, done } => {
                let _ = done.send(live.contains_key(&target.id));
            }
            Command::Shutdown { done } => {
                close_all(&mut live).await;
                rx.close();
                let _ = done.send(());
                return;
            }
        }
    }

    close_all(&mut live).await;
}

/// Open (or reopen) the live file of `target`. An already open handle is
/// closed first so a destination never holds two handles.
async fn open_live(live: &mut HashMap<String, LiveFile>, target: &Target) -> bool {
    if let Some(previous) = live.remove(&target.id) {
        close_live(&target.id, previous).await;
    }

    if let Some(parent) = target.path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            error!(destination = %target.id, path = %parent.display(), "unable to create log directory: {}", e);
            return false;
        }
    }

    match trim_torn_tail(&target.path).await {
        Ok(0) => {}
        Ok(torn) => {
            warn!(destination = %target.id, bytes = torn, "discarded incomplete trailing log record");
        }
        Err(e) => {
            error!(destination = %target.id, path = %target.path.display(), "unable to repair log file: {}", e);
            return false;
        }
    }

    match OpenOptions::new().create(true).append(true).open(&target.path).await {
        Ok(file) => {
            debug!(destination = %target.id, path = %target.path.display(), "opened live log file");
            live.insert(
                target.id.clone(),
                LiveFile {
                    path: target.path.clone(),
                    file,
                },
            );
            true
        }
        Err(e) => {
            error!(destination = %target.id, path = %target.path.display(), "unable to open log file: {}", e);
            false
        }
    }
}

/// Cut bytes after the last line break, left by an interrupted write, so
/// the next frame starts on its own line. Returns the number of bytes cut.
async fn trim_torn_tail(path: &Path) -> std::io::Result<u64> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();

    let mut buf = vec![0u8; 4096];
    let mut end = len;
    let keep = loop {
        if end == 0 {
            break 0;
        }
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(chunk).await?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            break start + pos as u64 + 1;
        }
        end = start;
    };

    if keep < len {
        file.set_len(keep).await?;
        file.sync_all().await?;
    }
    Ok(len - keep)
}

async fn sync_live(entry: &mut LiveFile) -> std::io::Result<()> {
    entry.file.flush().await?;
    entry.file.sync_all().await
}

async fn close_live(id: &str, mut entry: LiveFile) {
    if let Err(e) = sync_live(&mut entry).await {
        warn!(destination = %id, path = %entry.path.display(), "failed to sync log file before closing: {}", e);
    }
}

async fn close_all(live: &mut HashMap<String, LiveFile>) {
    for (id, entry) in live.drain() {
        close_live(&id, entry).await;
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Split live file contents into complete frames. Returns the number of
/// trailing bytes that lack a terminator.
fn split_frames(raw: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut frames = Vec::new();
    let mut rest = raw;
    while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
        if pos > 0 {
            frames.push(&rest[..pos]);
        }
        rest = &rest[pos + 1..];
    }
    (frames, rest.len())
}

fn artifact_stem(target: &Target) -> String {
    target
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| target.id.clone())
}

fn artifact_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Settle temporary artifacts left by an interrupted finalize.
///
/// A temporary file is complete once the detached file is gone, so it is
/// promoted to an artifact; otherwise the detached file still holds the
/// records and the temporary file is discarded.
async fn settle_pending_artifacts(target: &Target, extension: &str, detached: &Path) -> Result<(), FinalizeError> {
    let dir = artifact_dir(&target.path);
    let tmp_extension = if extension.is_empty() {
        "tmp".to_string()
    } else {
        format!("{}.tmp", extension)
    };
    let pending = timestamped_files(dir, &artifact_stem(target), &tmp_extension)
        .await
        .map_err(|e| FinalizeError::io(dir, e))?;
    if pending.is_empty() {
        return Ok(());
    }

    let detached_exists = fs::try_exists(detached)
        .await
        .map_err(|e| FinalizeError::io(detached, e))?;
    for tmp in pending {
        if detached_exists {
            fs::remove_file(&tmp).await.map_err(|e| FinalizeError::io(&tmp, e))?;
        } else {
            let artifact = tmp.with_extension("");
            warn!(destination = %target.id, path = %artifact.display(), "recovered artifact of an interrupted finalize");
            fs::rename(&tmp, &artifact)
                .await
                .map_err(|e| FinalizeError::io(&tmp, e))?;
        }
    }
    Ok(())
}

async fn finalize_file(
    target: &Target,
    encoder: &dyn RecordEncoder,
    extension: &str,
) -> Result<PathBuf, FinalizeError> {
    let live_path = &target.path;
    let detached = with_suffix(live_path, ".detached");
    settle_pending_artifacts(target, extension, &detached).await?;

    match fs::metadata(live_path).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(FinalizeError::MissingLiveFile(live_path.clone()));
        }
        Err(e) => return Err(FinalizeError::io(live_path, e)),
    }

    // Records live in exactly one of: the live file, the detached file, the
    // artifact. A detached file left by an interrupted finalize is older
    // than the live file, so the live contents are appended to it.
    if fs::metadata(&detached).await.is_ok() {
        warn!(destination = %target.id, path = %detached.display(), "recovering records from an interrupted finalize");
        let pending = fs::read(live_path)
            .await
            .map_err(|e| FinalizeError::io(live_path, e))?;
        trim_torn_tail(&detached)
            .await
            .map_err(|e| FinalizeError::io(&detached, e))?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&detached)
            .await
            .map_err(|e| FinalizeError::io(&detached, e))?;
        file.write_all(&pending)
            .await
            .map_err(|e| FinalizeError::io(&detached, e))?;
        file.sync_all().await.map_err(|e| FinalizeError::io(&detached, e))?;
        fs::remove_file(live_path)
            .await
            .map_err(|e| FinalizeError::io(live_path, e))?;
    } else {
        fs::rename(live_path, &detached)
            .await
            .map_err(|e| FinalizeError::io(live_path, e))?;
    }

    let raw = fs::read(&detached)
        .await
        .map_err(|e| FinalizeError::io(&detached, e))?;
    let (frames, torn) = split_frames(&raw);
    if torn > 0 {
        warn!(destination = %target.id, bytes = torn, "dropping incomplete trailing log record");
    }
    let document = encoder.wrap_sequence(&frames);

    let dir = artifact_dir(live_path);
    let artifact = unique_file_path(dir, &artifact_stem(target), extension)
        .await
        .map_err(|e| FinalizeError::io(dir, e))?;
    let tmp = with_suffix(&artifact, ".tmp");

    let mut file = File::create(&tmp).await.map_err(|e| FinalizeError::io(&tmp, e))?;
    file.write_all(&document).await.map_err(|e| FinalizeError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| FinalizeError::io(&tmp, e))?;
    drop(file);
    // The synced temporary file takes over the records before the detached
    // file goes away; a leftover one is settled by the next finalize.
    fs::remove_file(&detached)
        .await
        .map_err(|e| FinalizeError::io(&detached, e))?;
    fs::rename(&tmp, &artifact)
        .await
        .map_err(|e| FinalizeError::io(&tmp, e))?;

    debug!(destination = %target.id, records = frames.len(), path = %artifact.display(), "finalized log file");
    Ok(artifact)
}

/// Sink that owns one append-only log file for a destination.
///
/// Cloning is cheap; every clone talks to the same live file through the
/// shared [`Lane`].
#[derive(Clone)]
pub struct FileSink {
    target: Arc<Target>,
    lane: Lane,
    encoder: Arc<dyn RecordEncoder>,
    fields: FieldSelection,
    extension: String,
}

impl FileSink {
    /// Create a sink for `path` on `lane`. The file itself is created on
    /// [`FileSink::open`] or on the first append.
    pub fn new(
        lane: &Lane,
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        encoder: Arc<dyn RecordEncoder>,
        fields: FieldSelection,
    ) -> Self {
        let path = path.into();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| encoder.default_extension().to_string());

        FileSink {
            target: Arc::new(Target { id: id.into(), path }),
            lane: lane.clone(),
            encoder,
            fields,
            extension,
        }
    }

    pub fn id(&self) -> &str {
        &self.target.id
    }

    pub fn path(&self) -> &Path {
        &self.target.path
    }

    /// Extension given to finalized artifacts.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn file_name(&self) -> Option<String> {
        self.target
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Directory finalized artifacts are written to.
    pub fn artifact_dir(&self) -> &Path {
        artifact_dir(&self.target.path)
    }

    /// Artifacts are named `<stem>-<secs>.<micros>.<ext>`.
    pub fn artifact_stem(&self) -> String {
        artifact_stem(&self.target)
    }

    pub fn fields(&self) -> FieldSelection {
        self.fields
    }

    /// Open the live file, closing a previously open handle first.
    ///
    /// Returns without waiting; failures are logged by the lane.
    pub fn open(&self) {
        let command = Command::Open {
            target: Arc::clone(&self.target),
            done: None,
        };
        if !self.lane.submit(command) {
            warn!(destination = %self.target.id, "cannot open log file: sink lane has shut down");
        }
    }

    /// Open the live file and wait for the outcome.
    pub async fn open_and_wait(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        let command = Command::Open {
            target: Arc::clone(&self.target),
            done: Some(tx),
        };
        self.lane.submit(command) && rx.await.unwrap_or(false)
    }

    /// Sync and release the live file handle. No-op when already closed.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.lane.submit(Command::Close {
            target: Arc::clone(&self.target),
            done: tx,
        }) {
            let _ = rx.await;
        }
    }

    /// Whether the lane currently holds a handle for this sink.
    pub async fn is_open(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.lane.submit(Command::IsOpen {
            target: Arc::clone(&self.target),
            done: tx,
        }) && rx.await.unwrap_or(false)
    }

    /// Turn the live file into a complete document and return its path.
    ///
    /// The artifact contains exactly the records appended before this call.
    /// The live file is gone afterwards; the next append (or
    /// [`FileSink::open`]) starts a fresh one.
    pub async fn finalize(&self) -> Result<PathBuf, FinalizeError> {
        let (tx, rx) = oneshot::channel();
        let command = Command::Finalize {
            target: Arc::clone(&self.target),
            encoder: Arc::clone(&self.encoder),
            extension: self.extension.clone(),
            done: tx,
        };
        if !self.lane.submit(command) {
            return Err(FinalizeError::LaneClosed);
        }
        rx.await.unwrap_or(Err(FinalizeError::LaneClosed))
    }

    fn write(&self, record: &LogRecord, fields: &FieldSelection) {
        let mut projected = SerializedRecord::project(record, fields);
        if fields.show_destination_id && projected.log_identifier.is_none() {
            projected.log_identifier = Some(self.target.id.clone());
        }

        let encoded = self.encoder.encode(&projected).and_then(|frame| {
            if frame.contains(&b'\n') {
                Err(EncodeError::EmbeddedNewline)
            } else {
                Ok(frame)
            }
        });
        let mut frame = match encoded {
            Ok(frame) => frame,
            Err(e) => {
                self.lane.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(destination = %self.target.id, "dropping log record: {}", e);
                return;
            }
        };
        frame.push(b'\n');

        let command = Command::Append {
            target: Arc::clone(&self.target),
            frame,
        };
        if !self.lane.submit(command) {
            self.lane.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl LogSink for FileSink {
    fn append(&self, record: &LogRecord) {
        self.write(record, &self.fields);
    }

    fn append_internal(&self, record: &LogRecord) {
        self.write(record, &self.fields.internal());
    }

    async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.lane.submit(Command::Flush {
            target: Arc::clone(&self.target),
            done: tx,
        }) {
            let _ = rx.await;
        }
    }
}
