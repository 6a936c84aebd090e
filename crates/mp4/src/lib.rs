//! Reframe MPEG-4
//!
//! ISO base media file support used by the engine and the CLI:
//! - **Atoms / tree:** box header codec and an editable in-memory box tree
//! - **Fast start:** moves `moov` ahead of `mdat`, patching chunk offsets
//! - **Muxer / demuxer:** native MP4 writing and reading for elementary and merged files

pub mod atoms;
pub mod demuxer;
pub mod faststart;
pub mod muxer;
pub mod sample_entry;
pub mod tree;

use std::path::Path;
use std::sync::Arc;

use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::capability::{Demuxer, DemuxerFactory, Muxer, MuxerFactory};
use reframe_media::format::ContainerKind;

pub use demuxer::Mp4Demuxer;
pub use faststart::{fast_start, fast_start_bytes, fast_start_file, FastStartOutcome, FastStartReport};
pub use muxer::Mp4Muxer;
pub use tree::{scan_atoms, AtomSpan, BoxNode};

/// Opens MP4 files with [`Mp4Demuxer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeDemuxerFactory;

impl DemuxerFactory for NativeDemuxerFactory {
    fn open(&self, path: &Path) -> ReframeResult<Box<dyn Demuxer>> {
        Ok(Box::new(Mp4Demuxer::open(path)?))
    }
}

/// Writes MP4 natively and defers other containers to a platform muxer.
#[derive(Clone, Default)]
pub struct NativeMuxerFactory {
    fallback: Option<Arc<dyn MuxerFactory>>,
}

impl NativeMuxerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `fallback` for containers without native support.
    pub fn with_fallback(fallback: Arc<dyn MuxerFactory>) -> Self {
        Self {
            fallback: Some(fallback),
        }
    }
}

impl MuxerFactory for NativeMuxerFactory {
    fn supports(&self, kind: ContainerKind) -> bool {
        kind == ContainerKind::Mp4 || self.fallback.as_ref().is_some_and(|f| f.supports(kind))
    }

    fn create(&self, path: &Path, kind: ContainerKind) -> ReframeResult<Box<dyn Muxer>> {
        match (kind, &self.fallback) {
            (ContainerKind::Mp4, _) => Ok(Box::new(Mp4Muxer::create(path)?)),
            (_, Some(fallback)) if fallback.supports(kind) => fallback.create(path, kind),
            _ => Err(ReframeError::unsupported(format!(
                "no muxer available for {} output",
                kind.extension()
            ))),
        }
    }
}
