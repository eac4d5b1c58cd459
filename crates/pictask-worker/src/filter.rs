//! Image filters known to the worker.
//!
//! Every filter decodes any supported input format and re-encodes the result as PNG.

use image::{DynamicImage, ImageFormat};
use std::{fmt, io::Cursor, str::FromStr};

/// Gaussian sigma used by `blur`.
pub const BLUR_SIGMA: f32 = 30.0;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("encode image: {0}")]
    Encode(#[source] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Blur,
    Grayscale,
    Invert,
    Sepia,
}

impl Filter {
    pub const ALL: [Filter; 4] = [Self::Blur, Self::Grayscale, Self::Invert, Self::Sepia];

    pub fn name(self) -> &'static str {
        match self {
            Self::Blur => "blur",
            Self::Grayscale => "grayscale",
            Self::Invert => "invert",
            Self::Sepia => "sepia",
        }
    }

    fn transform(self, img: DynamicImage) -> DynamicImage {
        match self {
            Self::Blur => img.blur(BLUR_SIGMA),
            Self::Grayscale => img.grayscale(),
            Self::Invert => {
                let mut img = img;
                img.invert();
                img
            }
            Self::Sepia => sepia(img),
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    /// Names match case-insensitively.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let wanted = name.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| FilterError::UnknownOperation(wanted.to_string()))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decode `input`, apply the filter named `operation`, and return PNG bytes.
///
/// CPU-bound; callers on an async runtime should run this on the blocking pool.
pub fn apply(operation: &str, input: &[u8]) -> Result<Vec<u8>, FilterError> {
    let filter: Filter = operation.parse()?;
    let img = image::load_from_memory(input).map_err(FilterError::Decode)?;
    let out = filter.transform(img);

    let mut buf = Cursor::new(Vec::new());
    out.write_to(&mut buf, ImageFormat::Png)
        .map_err(FilterError::Encode)?;
    Ok(buf.into_inner())
}

fn sepia(img: DynamicImage) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    for px in rgba.pixels_mut() {
        let [r, g, b, a] = px.0;
        let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
        px.0 = [
            clamp_channel(0.393 * r + 0.769 * g + 0.189 * b),
            clamp_channel(0.349 * r + 0.686 * g + 0.168 * b),
            clamp_channel(0.272 * r + 0.534 * g + 0.131 * b),
            a,
        ];
    }
    DynamicImage::ImageRgba8(rgba)
}

fn clamp_channel(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}
