pub mod config;
pub mod faststart;
pub mod inspect;
pub mod presets;
pub mod remux;
