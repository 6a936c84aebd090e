//! Print the effective engine configuration.

use reframe_common::config::EngineConfig;

pub fn run(init: bool) -> anyhow::Result<()> {
    let path = EngineConfig::path();
    let config = EngineConfig::load();

    if init && !path.exists() {
        config.save()?;
        println!("Wrote defaults to {}", path.display());
    }

    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
