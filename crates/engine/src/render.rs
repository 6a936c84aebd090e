//! GPU render surface between the video decoder and encoder.
//!
//! The decoder renders each frame into an external image owned by this
//! surface. [`RenderSurface::render_frame`] latches that image, draws it
//! through the job's effect program onto the encoder's input surface, stamps
//! the presentation time and swaps.

use std::time::Duration;

use reframe_common::clock::JobClock;
use reframe_common::error::ReframeResult;
use reframe_media::capability::{GpuContext, ProgramId};
use reframe_media::surface::SurfaceHandle;

use crate::effect::{FragmentEffect, VERTEX_SHADER};
use crate::resource::Owned;

/// What happened to one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Drawn and submitted to the encoder.
    Rendered,
    /// No image arrived in time; the frame is skipped.
    Dropped,
}

pub struct RenderSurface {
    gpu: Owned<dyn GpuContext>,
    program: ProgramId,
    decoder_target: SurfaceHandle,
    effect: FragmentEffect,
    image_timeout: Duration,
    rendered: u64,
    dropped: u64,
}

impl RenderSurface {
    /// Bind `gpu` to the encoder's input surface and prepare the effect
    /// program and the image the decoder renders into.
    pub fn new(
        gpu: Box<dyn GpuContext>,
        encoder_input: &SurfaceHandle,
        effect: FragmentEffect,
        image_timeout: Duration,
    ) -> ReframeResult<Self> {
        let mut gpu = Owned::new(gpu);
        gpu.bind_output(encoder_input)?;
        gpu.make_current()?;
        let program = gpu.compile_program(VERTEX_SHADER, effect.fragment_shader())?;
        let decoder_target = gpu.create_external_image()?;

        tracing::debug!(
            %effect,
            encoder_surface = encoder_input.id(),
            decoder_surface = decoder_target.id(),
            "Render surface ready"
        );

        Ok(Self {
            gpu,
            program,
            decoder_target,
            effect,
            image_timeout,
            rendered: 0,
            dropped: 0,
        })
    }

    /// Handle the decoder must be configured with.
    pub fn decoder_target(&self) -> &SurfaceHandle {
        &self.decoder_target
    }

    pub fn effect(&self) -> FragmentEffect {
        self.effect
    }

    /// Draw the most recently decoded image and submit it at `pts_us`.
    ///
    /// A missing image is not fatal: the frame is counted as dropped.
    pub fn render_frame(&mut self, pts_us: i64) -> ReframeResult<FrameOutcome> {
        if let Err(e) = self.gpu.await_new_image(self.image_timeout) {
            self.dropped += 1;
            tracing::warn!(pts_us, error = %e, "Decoded image did not arrive; dropping frame");
            return Ok(FrameOutcome::Dropped);
        }

        self.gpu.draw_external_image(self.program)?;
        self.gpu.set_presentation_time(JobClock::us_to_ns(pts_us))?;
        self.gpu.swap_buffers()?;
        self.rendered += 1;
        Ok(FrameOutcome::Rendered)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.rendered
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped
    }

    /// Free the GPU context. Dropping the surface does the same.
    pub fn release(self) {
        tracing::debug!(
            rendered = self.rendered,
            dropped = self.dropped,
            "Releasing render surface"
        );
    }
}
