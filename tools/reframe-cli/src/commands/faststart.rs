//! Rewrite an MP4 for progressive playback.

use std::path::PathBuf;

use reframe_mp4::{fast_start_file, FastStartOutcome};

pub fn run(input: PathBuf, output: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let output = output.unwrap_or_else(|| input.with_extension("faststart.mp4"));
    let report = fast_start_file(&input, &output)
        .map_err(|e| anyhow::anyhow!("Fast start failed for {}: {e}", input.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match report.outcome {
        FastStartOutcome::Rewritten => {
            println!("Rewrote {} -> {}", input.display(), output.display());
            println!("  moov: {} bytes", report.moov_size);
            println!("  media moved by {} bytes", report.media_shift);
            println!("  chunk offsets patched: {}", report.offsets_patched);
            if report.tables_upgraded > 0 {
                println!("  tables widened to 64-bit: {}", report.tables_upgraded);
            }
        }
        FastStartOutcome::AlreadyFastStart => {
            println!(
                "{} already starts with its movie header; copied to {}",
                input.display(),
                output.display()
            );
        }
    }
    Ok(())
}
