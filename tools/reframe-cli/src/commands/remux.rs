//! Merge elementary video and audio files into one container.

use std::path::PathBuf;
use std::sync::Arc;

use reframe_engine::{ContainerWriter, ElementaryOutput};
use reframe_media::format::{ContainerKind, MediaKind};
use reframe_mp4::{fast_start_file, NativeDemuxerFactory, NativeMuxerFactory};

pub fn run(
    video: Option<PathBuf>,
    audio: Option<PathBuf>,
    output: PathBuf,
    container: String,
    fast_start: bool,
) -> anyhow::Result<()> {
    let container: ContainerKind = container.parse()?;
    if video.is_none() && audio.is_none() {
        anyhow::bail!("Pass at least one of --video or --audio");
    }

    let writer = ContainerWriter::new(
        Arc::new(NativeMuxerFactory::new()),
        Arc::new(NativeDemuxerFactory),
        false,
    );
    let inputs = [
        ElementaryOutput {
            kind: MediaKind::Video,
            path: video,
        },
        ElementaryOutput {
            kind: MediaKind::Audio,
            path: audio,
        },
    ];

    let apply_fast_start = fast_start && container.supports_fast_start();
    let merged = if apply_fast_start {
        output.with_extension(format!("merging.{}", container.extension()))
    } else {
        output.clone()
    };

    let report = writer.merge(&inputs, container, &merged)?;
    println!("Merged {} samples into {}", report.samples(), merged.display());
    for track in &report.tracks {
        println!("  {} {} ({} samples)", track.kind, track.mime, track.samples);
    }

    if apply_fast_start {
        let result = fast_start_file(&merged, &output);
        let _ = std::fs::remove_file(&merged);
        let fs = result?;
        tracing::debug!(moov_size = fs.moov_size, offsets = fs.offsets_patched, "Fast start applied");
        println!("Wrote {} ({:?})", output.display(), fs.outcome);
    }

    Ok(())
}
