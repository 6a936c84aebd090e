//! Full jobs against in-process codecs: real MP4 in, real MP4 out.

mod support;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use reframe_common::config::{AudioStaging, EngineConfig};
use reframe_common::error::ReframeError;
use reframe_media::capability::Demuxer;
use reframe_media::format::{mime, ContainerKind, MediaKind};
use reframe_mp4::atoms::{MDAT, MOOV};
use reframe_mp4::{scan_atoms, FastStartOutcome, Mp4Demuxer};
use reframe_engine::{
    AudioEncodeSpec, AudioPipeline, CodecPreset, Engine, JobOutcome, JobProgress, JobStage, JobStorage,
    MediaJobSpec, OutputLocation, TrackPipeline, VideoEncodeSpec,
};

use support::{
    platform, source_audio_frames, source_video_frames, test_root, write_source, FakeOptions,
    Ledger,
};

const SECONDS: i64 = 3;

fn config_for(root: &Path) -> EngineConfig {
    EngineConfig {
        work_root: root.join("jobs"),
        ..EngineConfig::default()
    }
}

fn local_job(root: &Path, output: &str, container: ContainerKind) -> MediaJobSpec {
    let source = root.join("source.mp4");
    write_source(&source, SECONDS);
    MediaJobSpec::in_fresh_work_dir(
        JobStorage::LocalFile {
            source,
            output: root.join("out").join(output),
        },
        &root.join("jobs"),
        container,
    )
    .unwrap()
}

fn atom_order(path: &Path) -> Vec<String> {
    let mut file = std::fs::File::open(path).unwrap();
    let len = file.metadata().unwrap().len();
    scan_atoms(&mut file, len)
        .unwrap()
        .into_iter()
        .filter(|a| a.kind == MOOV || a.kind == MDAT)
        .map(|a| a.kind.to_string())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mp4_job_produces_fast_start_output_with_both_tracks() {
    let root = test_root("mp4_job");
    let ledger = Ledger::new();
    let job = local_job(&root, "final.mp4", ContainerKind::Mp4);
    let work_dir = job.work_dir.clone();
    let final_path = root.join("out/final.mp4");

    let stages = Arc::new(Mutex::new(Vec::new()));
    let seen = stages.clone();
    let preset = CodecPreset::H264AacMp4;
    let engine = Engine::new(
        job,
        preset.video_spec(),
        preset.audio_spec(),
        platform(&ledger, FakeOptions::default()),
        &config_for(&root),
    )
    .with_progress(Arc::new(move |p: JobProgress| seen.lock().unwrap().push(p.stage)));

    let outcome = engine.start().await.unwrap();
    let JobOutcome::Completed { output, report } = outcome else {
        panic!("job was cancelled");
    };
    assert_eq!(output, OutputLocation::File(final_path.clone()));

    assert_eq!(report.video.samples_read, source_video_frames(SECONDS) as u64);
    assert_eq!(report.video.frames_rendered, source_video_frames(SECONDS) as u64);
    assert_eq!(report.video.samples_written, source_video_frames(SECONDS) as u64);
    assert_eq!(report.video.frames_dropped, 0);

    let pcm_bytes = source_audio_frames(SECONDS) as u64 * 1024 * 2 * 2;
    assert_eq!(report.audio.pcm_bytes, pcm_bytes);
    assert!(report.audio.samples_written >= pcm_bytes.div_ceil(3_000));
    assert_eq!(report.merge.tracks.len(), 2);
    assert_eq!(
        report.fast_start.as_ref().map(|f| f.outcome),
        Some(FastStartOutcome::Rewritten)
    );

    assert_eq!(atom_order(&final_path), vec!["moov", "mdat"]);
    let demuxer = Mp4Demuxer::open(&final_path).unwrap();
    assert_eq!(demuxer.track_count(), 2);
    let formats: Vec<_> = (0..2).map(|i| demuxer.track_format(i).unwrap()).collect();
    let video = formats.iter().find(|f| f.kind() == Some(MediaKind::Video)).unwrap();
    let audio = formats.iter().find(|f| f.kind() == Some(MediaKind::Audio)).unwrap();
    assert_eq!(video.mime, mime::VIDEO_AVC);
    assert_eq!((video.width, video.height), (Some(320), Some(240)));
    assert_eq!(audio.mime, mime::AUDIO_AAC);
    assert_eq!((audio.sample_rate, audio.channel_count), (Some(44_100), Some(2)));
    assert!(video.duration_us.unwrap() > 0);
    assert!(audio.duration_us.unwrap() > 0);

    assert!(!work_dir.exists());
    assert!(ledger.created() >= 5);
    assert_eq!(ledger.outstanding(), 0);

    let stages = stages.lock().unwrap();
    assert_eq!(stages.first(), Some(&JobStage::Preparing));
    assert_eq!(stages.last(), Some(&JobStage::Complete));
    assert!(stages.contains(&JobStage::FastStart));
    drop(stages);

    std::fs::remove_dir_all(&root).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn webm_job_goes_through_the_fallback_muxer() {
    let root = test_root("webm_job");
    let ledger = Ledger::new();
    let job = local_job(&root, "final.webm", ContainerKind::WebM);
    let work_dir = job.work_dir.clone();
    let preset = CodecPreset::Vp9OpusWebm;
    let engine = Engine::new(
        job,
        preset.video_spec(),
        preset.audio_spec(),
        platform(
            &ledger,
            FakeOptions {
                webm: true,
                ..FakeOptions::default()
            },
        ),
        &config_for(&root),
    );

    let outcome = engine.start().await.unwrap();
    let JobOutcome::Completed { report, .. } = outcome else {
        panic!("job was cancelled");
    };
    assert!(report.fast_start.is_none());

    let written = std::fs::read_to_string(root.join("out/final.webm")).unwrap();
    assert!(written.starts_with("webm "));
    let tracks = ledger.webm_tracks.lock().unwrap().clone();
    assert_eq!(tracks.len(), 2);
    assert!(tracks.contains(&mime::VIDEO_VP9.to_string()));
    assert!(tracks.contains(&mime::AUDIO_OPUS.to_string()));

    assert!(!work_dir.exists());
    assert_eq!(ledger.outstanding(), 0);
    std::fs::remove_dir_all(&root).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn webm_without_a_platform_muxer_fails_and_cleans_up() {
    let root = test_root("webm_unsupported");
    let ledger = Ledger::new();
    let job = local_job(&root, "final.webm", ContainerKind::WebM);
    let work_dir = job.work_dir.clone();
    let preset = CodecPreset::Vp9OpusWebm;
    let engine = Engine::new(
        job,
        preset.video_spec(),
        preset.audio_spec(),
        platform(&ledger, FakeOptions::default()),
        &config_for(&root),
    );

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, ReframeError::Unsupported { .. }));
    assert!(!work_dir.exists());
    assert!(!root.join("out/final.webm").exists());
    assert_eq!(ledger.outstanding(), 0);
    std::fs::remove_dir_all(&root).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_mid_job_cancels_and_releases_everything() {
    let root = test_root("stop_job");
    let ledger = Ledger::new();
    let job = local_job(&root, "final.mp4", ContainerKind::Mp4);
    let work_dir = job.work_dir.clone();
    let preset = CodecPreset::H264AacMp4;
    let engine = Arc::new(Engine::new(
        job,
        preset.video_spec(),
        preset.audio_spec(),
        platform(
            &ledger,
            FakeOptions {
                frame_delay: Duration::from_millis(20),
                ..FakeOptions::default()
            },
        ),
        &config_for(&root),
    ));

    let running = engine.clone();
    let handle = tokio::spawn(async move { running.start().await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.stop().await;
    engine.stop().await;

    let outcome = handle.await.unwrap().unwrap();
    assert!(outcome.is_cancelled());
    assert!(engine.is_cancelled());
    assert!(!work_dir.exists());
    assert!(!root.join("out/final.mp4").exists());
    assert_eq!(ledger.outstanding(), 0);
    std::fs::remove_dir_all(&root).unwrap();
}

/// Run an MP4 job that stops itself from its `stage` progress callback.
/// Returns whether the final output existed at that moment.
async fn stop_from_progress(name: &str, stage: JobStage) -> bool {
    let root = test_root(name);
    let ledger = Ledger::new();
    let job = local_job(&root, "final.mp4", ContainerKind::Mp4);
    let work_dir = job.work_dir.clone();
    let final_path = root.join("out/final.mp4");

    let slot: Arc<OnceLock<Weak<Engine>>> = Arc::new(OnceLock::new());
    let target = slot.clone();
    let existed = Arc::new(AtomicBool::new(false));
    let observed = existed.clone();
    let watched = final_path.clone();
    let preset = CodecPreset::H264AacMp4;
    let engine = Arc::new(
        Engine::new(
            job,
            preset.video_spec(),
            preset.audio_spec(),
            platform(&ledger, FakeOptions::default()),
            &config_for(&root),
        )
        .with_progress(Arc::new(move |p: JobProgress| {
            if p.stage != stage {
                return;
            }
            observed.store(watched.exists(), Ordering::SeqCst);
            let Some(engine) = target.get().and_then(Weak::upgrade) else {
                return;
            };
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(engine.stop())
            });
        })),
    );
    assert!(slot.set(Arc::downgrade(&engine)).is_ok());

    let running = engine.clone();
    let outcome = tokio::spawn(async move { running.start().await })
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_cancelled());
    assert!(!work_dir.exists());
    assert!(!final_path.exists());
    assert_eq!(ledger.outstanding(), 0);
    std::fs::remove_dir_all(&root).unwrap();
    existed.load(Ordering::SeqCst)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_during_fast_start_leaves_no_output() {
    let existed = stop_from_progress("stop_fast_start", JobStage::FastStart).await;
    assert!(!existed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_after_output_is_written_removes_it() {
    let existed = stop_from_progress("stop_publishing", JobStage::Publishing).await;
    assert!(existed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_frames_do_not_fail_the_job() {
    let root = test_root("dropped_frames");
    let ledger = Ledger::new();
    let job = local_job(&root, "final.mp4", ContainerKind::Mp4);
    let preset = CodecPreset::H264AacMp4;
    let engine = Engine::new(
        job,
        preset.video_spec(),
        preset.audio_spec(),
        platform(
            &ledger,
            FakeOptions {
                drop_every: Some(5),
                ..FakeOptions::default()
            },
        ),
        &config_for(&root),
    );

    let outcome = engine.start().await.unwrap();
    let JobOutcome::Completed { report, .. } = outcome else {
        panic!("job was cancelled");
    };
    let frames = source_video_frames(SECONDS) as u64;
    assert_eq!(report.video.frames_dropped, frames / 5);
    assert_eq!(report.video.frames_rendered, frames - frames / 5);
    assert_eq!(report.video.samples_written, frames - frames / 5);
    assert!((report.video.drop_rate() - 20.0).abs() < 1e-9);
    assert_eq!(ledger.outstanding(), 0);
    std::fs::remove_dir_all(&root).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_encoder_fails_before_any_output() {
    let root = test_root("bad_codec");
    let ledger = Ledger::new();
    let job = local_job(&root, "final.mp4", ContainerKind::Mp4);
    let work_dir = job.work_dir.clone();
    let engine = Engine::new(
        job,
        VideoEncodeSpec::new("video/x-unknown"),
        AudioEncodeSpec::new(mime::AUDIO_AAC),
        platform(&ledger, FakeOptions::default()),
        &config_for(&root),
    );

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, ReframeError::CodecConfig { .. }));
    assert!(!work_dir.exists());
    assert!(!root.join("out/final.mp4").exists());
    assert_eq!(ledger.outstanding(), 0);

    let again = engine.start().await.unwrap_err();
    assert!(matches!(again, ReframeError::Config { .. }));
    std::fs::remove_dir_all(&root).unwrap();
}

fn audio_pts_for(name: &str, configure: impl FnOnce(&mut EngineConfig)) -> u64 {
    let root = test_root(name);
    let ledger = Ledger::new();
    let source = root.join("source.mp4");
    write_source(&source, SECONDS);
    let staging_path = root.join("audio.pcm");
    let output = root.join("audio.mp4");
    let mut config = config_for(&root);
    configure(&mut config);

    let pipeline = AudioPipeline::new(
        &source,
        &output,
        &staging_path,
        CodecPreset::H264AacMp4.audio_spec(),
        platform(&ledger, FakeOptions::default()),
        &config,
    );
    let report = pipeline.run().unwrap();
    assert!(!pipeline.is_running());
    assert_eq!(report.output.as_deref(), Some(output.as_path()));
    assert!(!staging_path.exists());

    let pts = ledger.audio_pts.lock().unwrap().clone();
    assert_eq!(pts.first(), Some(&0));
    assert!(pts.windows(2).all(|w| w[0] < w[1]), "timestamps not increasing");
    let total_us = report.pcm_bytes as i64 * 1_000_000 / (44_100 * 4);
    assert!(*pts.last().unwrap() < total_us);

    let demuxer = Mp4Demuxer::open(&output).unwrap();
    assert_eq!(demuxer.track_count(), 1);
    assert_eq!(ledger.outstanding(), 0);
    std::fs::remove_dir_all(&root).unwrap();
    report.pcm_bytes
}

#[test]
fn audio_timestamps_increase_with_direct_staging() {
    audio_pts_for("pts_direct", |c| c.audio_staging = AudioStaging::Direct);
}

#[test]
fn audio_timestamps_increase_with_file_staging() {
    audio_pts_for("pts_file", |c| c.audio_staging = AudioStaging::TempFile);
}

#[test]
fn tight_pcm_limit_still_encodes_everything() {
    let unbounded = audio_pts_for("pcm_unbounded", |c| c.audio_staging = AudioStaging::Direct);
    let bounded = audio_pts_for("pcm_bounded", |c| {
        c.audio_staging = AudioStaging::Direct;
        c.pipeline.max_staged_pcm_bytes = 1;
    });
    assert!(unbounded > 0);
    assert_eq!(bounded, unbounded);
}

#[test]
fn missing_source_fails_and_repeated_stop_is_harmless() {
    let root = test_root("missing_source");
    let ledger = Ledger::new();
    let pipeline = reframe_engine::VideoPipeline::new(
        root.join("missing.mp4"),
        root.join("video.mp4"),
        CodecPreset::H264AacMp4.video_spec(),
        platform(&ledger, FakeOptions::default()),
        &config_for(&root),
    );
    assert!(matches!(
        pipeline.run().unwrap_err(),
        ReframeError::FileNotFound { .. }
    ));

    pipeline.stop();
    pipeline.stop();
    assert_eq!(ledger.outstanding(), 0);
    std::fs::remove_dir_all(&root).unwrap();
}
