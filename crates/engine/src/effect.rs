//! Fragment effects applied while re-rendering decoded frames.
//!
//! Each effect is a GLSL ES fragment program sampling the decoder's external
//! image. [`FragmentEffect::apply`] is the same math on the CPU, used to
//! check adapters and in tests.

use std::fmt;
use std::str::FromStr;

use reframe_common::error::ReframeError;
use serde::{Deserialize, Serialize};

/// Luma weights used by [`FragmentEffect::Monochrome`].
pub const MONOCHROME_WEIGHTS: [f32; 3] = [0.298912, 0.586611, 0.114478];

/// Cells per axis for [`FragmentEffect::Mosaic`].
pub const MOSAIC_GRID: f32 = 30.0;

/// Shared vertex program: full-screen quad with the image transform applied
/// to texture coordinates.
pub const VERTEX_SHADER: &str = "\
uniform mat4 uMVPMatrix;
uniform mat4 uSTMatrix;
attribute vec4 aPosition;
attribute vec4 aTextureCoord;
varying vec2 vTextureCoord;
void main() {
    gl_Position = uMVPMatrix * aPosition;
    vTextureCoord = (uSTMatrix * aTextureCoord).xy;
}
";

const IDENTITY_SHADER: &str = "\
#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 vTextureCoord;
uniform samplerExternalOES sTexture;
void main() {
    gl_FragColor = texture2D(sTexture, vTextureCoord);
}
";

const FLIP_SHADER: &str = "\
#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 vTextureCoord;
uniform samplerExternalOES sTexture;
void main() {
    vec2 flipped = vec2(1.0 - vTextureCoord.x, vTextureCoord.y);
    gl_FragColor = texture2D(sTexture, flipped);
}
";

const MONOCHROME_SHADER: &str = "\
#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 vTextureCoord;
uniform samplerExternalOES sTexture;
const vec3 weights = vec3(0.298912, 0.586611, 0.114478);
void main() {
    vec4 color = texture2D(sTexture, vTextureCoord);
    float luma = dot(color.rgb, weights);
    gl_FragColor = vec4(vec3(luma), color.a);
}
";

const MOSAIC_SHADER: &str = "\
#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 vTextureCoord;
uniform samplerExternalOES sTexture;
const float grid = 30.0;
void main() {
    vec2 cell = floor(vTextureCoord * grid) / grid;
    gl_FragColor = texture2D(sTexture, cell);
}
";

/// Built-in effect programs. Chosen once per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentEffect {
    #[default]
    Identity,
    HorizontalFlip,
    Monochrome,
    Mosaic,
}

impl FragmentEffect {
    pub const ALL: [FragmentEffect; 4] = [
        FragmentEffect::Identity,
        FragmentEffect::HorizontalFlip,
        FragmentEffect::Monochrome,
        FragmentEffect::Mosaic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FragmentEffect::Identity => "identity",
            FragmentEffect::HorizontalFlip => "horizontal_flip",
            FragmentEffect::Monochrome => "monochrome",
            FragmentEffect::Mosaic => "mosaic",
        }
    }

    pub fn fragment_shader(self) -> &'static str {
        match self {
            FragmentEffect::Identity => IDENTITY_SHADER,
            FragmentEffect::HorizontalFlip => FLIP_SHADER,
            FragmentEffect::Monochrome => MONOCHROME_SHADER,
            FragmentEffect::Mosaic => MOSAIC_SHADER,
        }
    }

    /// Where in the source image the output texel at `(u, v)` samples.
    pub fn map_uv(self, u: f32, v: f32) -> (f32, f32) {
        match self {
            FragmentEffect::HorizontalFlip => (1.0 - u, v),
            FragmentEffect::Mosaic => (
                (u * MOSAIC_GRID).floor() / MOSAIC_GRID,
                (v * MOSAIC_GRID).floor() / MOSAIC_GRID,
            ),
            FragmentEffect::Identity | FragmentEffect::Monochrome => (u, v),
        }
    }

    /// Color transform applied to the sampled texel.
    pub fn shade(self, rgba: [f32; 4]) -> [f32; 4] {
        match self {
            FragmentEffect::Monochrome => {
                let [r, g, b, a] = rgba;
                let luma = r * MONOCHROME_WEIGHTS[0]
                    + g * MONOCHROME_WEIGHTS[1]
                    + b * MONOCHROME_WEIGHTS[2];
                [luma, luma, luma, a]
            }
            _ => rgba,
        }
    }

    /// Output color at `(u, v)` given a sampler over the source image.
    pub fn apply<F>(self, u: f32, v: f32, sample: F) -> [f32; 4]
    where
        F: Fn(f32, f32) -> [f32; 4],
    {
        let (su, sv) = self.map_uv(u, v);
        self.shade(sample(su, sv))
    }
}

impl fmt::Display for FragmentEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FragmentEffect {
    type Err = ReframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "identity" | "default" | "none" => Ok(FragmentEffect::Identity),
            "horizontal_flip" | "flip" => Ok(FragmentEffect::HorizontalFlip),
            "monochrome" | "mono" | "grayscale" => Ok(FragmentEffect::Monochrome),
            "mosaic" | "pixelate" => Ok(FragmentEffect::Mosaic),
            other => Err(ReframeError::config(format!(
                "Unknown effect: {other}. Use: identity, flip, monochrome, mosaic"
            ))),
        }
    }
}
