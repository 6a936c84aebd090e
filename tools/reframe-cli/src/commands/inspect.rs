//! Show the box layout and tracks of an MP4 file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use reframe_common::clock::JobClock;
use reframe_mp4::atoms::{MDAT, MOOV};
use reframe_mp4::{scan_atoms, BoxNode, Mp4Demuxer};

pub fn run(path: PathBuf, tree: bool, json: bool) -> anyhow::Result<()> {
    let demuxer = Mp4Demuxer::open(&path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;

    if json {
        let formats: Vec<_> = demuxer.tracks().iter().map(|t| &t.format).collect();
        println!("{}", serde_json::to_string_pretty(&formats)?);
        return Ok(());
    }

    let mut file = File::open(&path)?;
    let len = file.metadata()?.len();
    let atoms = scan_atoms(&mut file, len)?;

    println!("File: {} ({} bytes)", path.display(), len);
    println!();
    println!("Top-level boxes:");
    for atom in &atoms {
        println!("  {} @ {} ({} bytes)", atom.kind, atom.offset, atom.size);
    }
    let streamable = atoms.iter().position(|a| a.kind == MOOV)
        < atoms.iter().position(|a| a.kind == MDAT);
    println!("  Fast start: {}", if streamable { "yes" } else { "no" });
    println!();

    println!("Tracks:");
    for (index, track) in demuxer.tracks().iter().enumerate() {
        let f = &track.format;
        let duration = JobClock::us_to_secs(f.duration_us.unwrap_or(0));
        let keys = track.samples.iter().filter(|s| s.key).count();
        match (f.width, f.height, f.sample_rate, f.channel_count) {
            (Some(w), Some(h), _, _) => println!(
                "  #{index} {} {w}x{h} @ {}fps ({duration:.2}s, {} samples, {keys} key)",
                f.mime,
                f.frame_rate.unwrap_or(0),
                track.samples.len()
            ),
            (_, _, Some(rate), Some(channels)) => println!(
                "  #{index} {} {rate}Hz x{channels} ({duration:.2}s, {} samples)",
                f.mime,
                track.samples.len()
            ),
            _ => println!("  #{index} {} ({} samples)", f.mime, track.samples.len()),
        }
    }

    if tree {
        if let Some(moov) = atoms.iter().find(|a| a.kind == MOOV) {
            file.seek(SeekFrom::Start(moov.offset))?;
            let mut bytes = vec![0u8; moov.size as usize];
            file.read_exact(&mut bytes)?;
            let node = BoxNode::parse(&bytes)?;
            println!();
            println!("Movie header:");
            node.visit(1, &mut |b, depth| {
                println!("{}{} ({} bytes)", "  ".repeat(depth), b.kind, b.encoded_len());
            });
        }
    }

    Ok(())
}
