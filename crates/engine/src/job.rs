//! Job storage: where the source comes from, where intermediate files live,
//! and where the finished artifact goes.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::format::ContainerKind;
use serde::Serialize;

const SOURCE_COPY_FILE: &str = "source";
const VIDEO_OUTPUT_FILE: &str = "video.mp4";
const AUDIO_OUTPUT_FILE: &str = "audio.mp4";
const RAW_AUDIO_FILE: &str = "audio.pcm";
const MERGED_FILE_STEM: &str = "merged";

static WORK_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Access to content addressed by URI rather than by path.
pub trait ContentResolver: Send + Sync {
    /// Open the content behind `uri` for reading.
    fn open_read(&self, uri: &str) -> ReframeResult<Box<dyn Read + Send>>;

    /// Copy a finished file into the content store; returns its URI.
    fn publish(&self, file: &Path, name: &str, mime_type: &str) -> ReframeResult<String>;
}

/// Source and destination of a job.
#[derive(Clone)]
pub enum JobStorage {
    /// Read from and write to local paths.
    LocalFile { source: PathBuf, output: PathBuf },
    /// Copy the source in through a resolver and publish the result back.
    ContentReference {
        source_uri: String,
        output_name: String,
        resolver: Arc<dyn ContentResolver>,
    },
}

impl fmt::Debug for JobStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStorage::LocalFile { source, output } => f
                .debug_struct("LocalFile")
                .field("source", source)
                .field("output", output)
                .finish(),
            JobStorage::ContentReference {
                source_uri,
                output_name,
                ..
            } => f
                .debug_struct("ContentReference")
                .field("source_uri", source_uri)
                .field("output_name", output_name)
                .finish_non_exhaustive(),
        }
    }
}

/// Where a finished artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLocation {
    File(PathBuf),
    Content(String),
}

impl fmt::Display for OutputLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputLocation::File(path) => write!(f, "{}", path.display()),
            OutputLocation::Content(uri) => f.write_str(uri),
        }
    }
}

/// One transcoding job and the working directory it owns.
#[derive(Debug, Clone)]
pub struct MediaJobSpec {
    pub storage: JobStorage,
    /// Holds every intermediate file; removed when the job ends.
    pub work_dir: PathBuf,
    pub container: ContainerKind,
}

impl MediaJobSpec {
    pub fn new(storage: JobStorage, work_dir: impl Into<PathBuf>, container: ContainerKind) -> Self {
        Self {
            storage,
            work_dir: work_dir.into(),
            container,
        }
    }

    /// Create a job with a new, empty working directory under `root`.
    pub fn in_fresh_work_dir(
        storage: JobStorage,
        root: &Path,
        container: ContainerKind,
    ) -> ReframeResult<Self> {
        std::fs::create_dir_all(root)?;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let pid = std::process::id();
        loop {
            let n = WORK_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
            let dir = root.join(format!("job-{stamp}-{pid}-{n}"));
            match std::fs::create_dir(&dir) {
                Ok(()) => {
                    tracing::debug!(work_dir = %dir.display(), "Created job working directory");
                    return Ok(Self::new(storage, dir, container));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Local path the pipelines read from.
    pub fn source_path(&self) -> PathBuf {
        match &self.storage {
            JobStorage::LocalFile { source, .. } => source.clone(),
            JobStorage::ContentReference { .. } => self.work_dir.join(SOURCE_COPY_FILE),
        }
    }

    pub fn video_output_path(&self) -> PathBuf {
        self.work_dir.join(VIDEO_OUTPUT_FILE)
    }

    pub fn audio_output_path(&self) -> PathBuf {
        self.work_dir.join(AUDIO_OUTPUT_FILE)
    }

    /// Staging file for decoded PCM.
    pub fn raw_audio_path(&self) -> PathBuf {
        self.work_dir.join(RAW_AUDIO_FILE)
    }

    /// Muxed container before any fast-start rewrite.
    pub fn merged_path(&self) -> PathBuf {
        self.work_dir
            .join(format!("{MERGED_FILE_STEM}.{}", self.container.extension()))
    }

    /// Where the finished artifact is written locally.
    pub fn final_path(&self) -> PathBuf {
        match &self.storage {
            JobStorage::LocalFile { output, .. } => output.clone(),
            JobStorage::ContentReference { output_name, .. } => self.work_dir.join(output_name),
        }
    }

    /// Stage the input. The working directory must be new or empty.
    pub fn prepare(&self) -> ReframeResult<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        if std::fs::read_dir(&self.work_dir)?.next().is_some() {
            return Err(ReframeError::config(format!(
                "working directory {} is not empty",
                self.work_dir.display()
            )));
        }

        match &self.storage {
            JobStorage::LocalFile { source, output } => {
                if !source.is_file() {
                    return Err(ReframeError::FileNotFound {
                        path: source.clone(),
                    });
                }
                if source == output {
                    return Err(ReframeError::config("output path must differ from the source"));
                }
                if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
            }
            JobStorage::ContentReference {
                source_uri,
                resolver,
                ..
            } => {
                let mut reader = resolver.open_read(source_uri)?;
                let mut file = std::fs::File::create(self.source_path())?;
                let bytes = std::io::copy(&mut reader, &mut file)?;
                tracing::info!(uri = %source_uri, bytes, "Copied source content into working directory");
            }
        }
        Ok(())
    }

    /// Hand the finished artifact to its destination.
    pub fn publish(&self) -> ReframeResult<OutputLocation> {
        match &self.storage {
            JobStorage::LocalFile { output, .. } => Ok(OutputLocation::File(output.clone())),
            JobStorage::ContentReference {
                output_name,
                resolver,
                ..
            } => {
                let uri = resolver.publish(&self.final_path(), output_name, self.container.mime_type())?;
                tracing::info!(%uri, "Published output");
                Ok(OutputLocation::Content(uri))
            }
        }
    }

    /// Remove a final output that lives outside the working directory.
    /// Returns whether a file was removed.
    pub fn discard_output(&self) -> ReframeResult<bool> {
        let JobStorage::LocalFile { output, .. } = &self.storage else {
            return Ok(false);
        };
        match std::fs::remove_file(output) {
            Ok(()) => {
                tracing::info!(output = %output.display(), "Removed output of unfinished job");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the working directory and everything in it. Idempotent.
    pub fn destroy(&self) -> ReframeResult<()> {
        match std::fs::remove_dir_all(&self.work_dir) {
            Ok(()) => {
                tracing::debug!(work_dir = %self.work_dir.display(), "Removed job working directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
