//! Reframe Media Model
//!
//! Data contracts shared by the container code and the transcoding engine:
//! - **Formats:** track/codec formats, buffer flags and metadata, container kinds
//! - **Capabilities:** the demuxer, codec, GPU and muxer traits platform adapters implement
//! - **Surfaces:** opaque render-target handles passed between adapters
//! - **Track Locator:** selects the first audio or video track of a source

pub mod capability;
pub mod format;
pub mod locator;
pub mod surface;

pub use capability::*;
pub use format::*;
pub use locator::*;
pub use surface::*;
