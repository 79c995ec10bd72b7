//! Filesystem layout owned by the uploader.
//!
//! ```text
//! <home>/<destination-id>/<timestamp>.<ext>              staged, upload in flight
//! <home>/<destination-id>/successful/<timestamp>.<ext>   kept after success
//! <home>/<destination-id>/failed/<timestamp>.<ext>       kept after failure, retried later
//! ```

use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const SUCCESSFUL_DIR: &str = "successful";
const FAILED_DIR: &str = "failed";

/// Where an uploaded file ends up after its request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Successful,
    Failed,
}

impl Outcome {
    fn dir_name(self) -> &'static str {
        match self {
            Outcome::Successful => SUCCESSFUL_DIR,
            Outcome::Failed => FAILED_DIR,
        }
    }
}

/// Path `<dir>/<prefix>-<secs>.<micros>.<ext>` that does not exist yet.
///
/// The timestamp keeps names ordered by creation; a numeric suffix is
/// added if two files land in the same microsecond.
pub async fn unique_file_path(dir: &Path, prefix: &str, extension: &str) -> std::io::Result<PathBuf> {
    let now = Utc::now();
    let stamp = format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros());
    let base = if prefix.is_empty() {
        stamp
    } else {
        format!("{}-{}", prefix, stamp)
    };

    let name = |suffix: Option<u32>| {
        let stem = match suffix {
            Some(n) => format!("{}-{}", base, n),
            None => base.clone(),
        };
        if extension.is_empty() {
            stem
        } else {
            format!("{}.{}", stem, extension)
        }
    };

    let mut candidate = dir.join(name(None));
    let mut n = 1;
    while fs::try_exists(&candidate).await? {
        candidate = dir.join(name(Some(n)));
        n += 1;
    }
    Ok(candidate)
}

/// Whether `name` was produced by [`unique_file_path`] for a non-empty
/// `prefix` and `extension`, i.e. `<prefix>-<secs>.<micros>[-<n>].<ext>`.
pub fn is_timestamped_name(name: &str, prefix: &str, extension: &str) -> bool {
    let Some(rest) = name.strip_prefix(prefix).and_then(|r| r.strip_prefix('-')) else {
        return false;
    };
    let stamp = if extension.is_empty() {
        rest
    } else {
        match rest.strip_suffix(extension).and_then(|r| r.strip_suffix('.')) {
            Some(stamp) => stamp,
            None => return false,
        }
    };

    let (time, counter) = match stamp.split_once('-') {
        Some((time, counter)) => (time, Some(counter)),
        None => (stamp, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let valid_time = match time.split_once('.') {
        Some((secs, micros)) => digits(secs) && digits(micros),
        None => false,
    };
    valid_time && counter.map_or(true, digits)
}

/// Files in `dir` named like [`unique_file_path`] output for `prefix`,
/// oldest first. A missing directory yields nothing.
pub async fn timestamped_files(dir: &Path, prefix: &str, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let matches = name
            .to_str()
            .map(|n| is_timestamped_name(n, prefix, extension))
            .unwrap_or(false);
        if matches && entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Move a file, falling back to copy + delete when a rename is not possible
/// (for example across filesystems).
pub async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if fs::copy(from, to).await.is_err() {
                return Err(rename_err);
            }
            fs::remove_file(from).await
        }
    }
}

/// Staging area of one destination below the uploader home directory.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    extension: String,
}

impl StagingArea {
    pub fn new(home: &Path, destination_id: &str, extension: impl Into<String>) -> Self {
        StagingArea {
            root: home.join(destination_id),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn outcome_dir(&self, outcome: Outcome) -> PathBuf {
        self.root.join(outcome.dir_name())
    }

    /// Move a finalized artifact into the staging root under a fresh name.
    pub async fn stage(&self, artifact: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;
        let staged = unique_file_path(&self.root, "", &self.extension).await?;
        move_file(artifact, &staged).await?;
        Ok(staged)
    }

    /// Keep (`store == true`) or delete a staged file after its upload.
    ///
    /// Returns the archived path when the file was kept.
    pub async fn archive(&self, file: &Path, outcome: Outcome, store: bool) -> std::io::Result<Option<PathBuf>> {
        if !store {
            fs::remove_file(file).await?;
            return Ok(None);
        }

        let dir = self.outcome_dir(outcome);
        fs::create_dir_all(&dir).await?;
        let mut target = match file.file_name() {
            Some(name) => dir.join(name),
            None => unique_file_path(&dir, "", &self.extension).await?,
        };
        if fs::try_exists(&target).await? {
            target = unique_file_path(&dir, "", &self.extension).await?;
        }
        move_file(file, &target).await?;
        Ok(Some(target))
    }

    /// Failed files carrying this destination's extension, oldest first.
    /// A missing `failed/` directory means there is nothing to retry.
    pub async fn failed_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let dir = self.outcome_dir(Outcome::Failed);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let matches = path
                .extension()
                .map(|e| e.to_string_lossy() == self.extension.as_str())
                .unwrap_or(self.extension.is_empty());
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn has_failed_files(&self) -> bool {
        matches!(self.failed_files().await, Ok(files) if !files.is_empty())
    }

    /// Move a failed file back into the staging root so a concurrent
    /// failure archival cannot hand it out twice.
    pub async fn unstage_failed(&self, file: &Path) -> std::io::Result<PathBuf> {
        let staged = unique_file_path(&self.root, "", &self.extension).await?;
        move_file(file, &staged).await?;
        Ok(staged)
    }

    /// Delete everything below the staging root.
    pub async fn clear_all(&self) -> std::io::Result<()> {
        clear_dir(&self.root).await
    }

    /// Delete the contents of `successful/`.
    pub async fn clear_successful(&self) -> std::io::Result<()> {
        clear_dir(&self.outcome_dir(Outcome::Successful)).await
    }
}

async fn clear_dir(dir: &Path) -> std::io::Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(entry.path()).await?;
        } else {
            fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}
