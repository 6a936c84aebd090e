//! List codec presets and fragment effects.

use reframe_engine::{CodecPreset, FragmentEffect};

pub fn run() -> anyhow::Result<()> {
    println!("Codec presets:");
    for preset in [
        CodecPreset::H264AacMp4,
        CodecPreset::H265AacMp4,
        CodecPreset::Vp9OpusWebm,
    ] {
        println!(
            "  {:<16} video {:<22} audio {:<18} .{}",
            preset.to_string(),
            preset.video_codec(),
            preset.audio_codec(),
            preset.container().extension()
        );
    }
    println!();

    println!("Fragment effects:");
    for effect in FragmentEffect::ALL {
        println!("  {}", effect.name());
    }
    Ok(())
}
