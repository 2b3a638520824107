use anyhow::{anyhow, Result};
use image::RgbImage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Yuyv,
    Nv12,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"NV12" => Some(Self::Nv12),
            _ => None,
        }
    }
}

/// Convert a captured buffer to an RGB frame. Trailing padding beyond the
/// expected frame size is ignored.
pub(crate) fn to_rgb_image(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage> {
    let w = width as usize;
    let h = height as usize;
    let area = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    let expected = match format {
        PixelFormat::Rgb24 => area * 3,
        PixelFormat::Yuyv => area * 2,
        PixelFormat::Nv12 => area + nv12_chroma_stride(w) * h.div_ceil(2),
    };
    let pixels = pixels.get(..expected).ok_or_else(|| {
        anyhow!(
            "{:?} frame too short: expected {}, got {}",
            format,
            expected,
            pixels.len()
        )
    })?;

    let rgb = match format {
        PixelFormat::Rgb24 => pixels.to_vec(),
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, area),
        PixelFormat::Nv12 => nv12_to_rgb(pixels, w, h)?,
    };
    RgbImage::from_raw(width, height, rgb).ok_or_else(|| anyhow!("RGB buffer size mismatch"))
}

fn yuyv_to_rgb(pixels: &[u8], area: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(area * 3);
    for chunk in pixels.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        push_yuv(&mut rgb, chunk[0] as f32, u, v);
        push_yuv(&mut rgb, chunk[2] as f32, u, v);
    }
    rgb
}

/// Interleaved UV row length; odd widths round up to a whole chroma pair.
fn nv12_chroma_stride(w: usize) -> usize {
    w.div_ceil(2) * 2
}

fn nv12_to_rgb(pixels: &[u8], w: usize, h: usize) -> Result<Vec<u8>> {
    let y_plane = w * h;
    let stride = nv12_chroma_stride(w);
    let mut rgb = Vec::with_capacity(y_plane * 3);
    for j in 0..h {
        for i in 0..w {
            let uv_index = y_plane + (j / 2) * stride + (i / 2) * 2;
            let (y, uv) = pixels
                .get(j * w + i)
                .zip(pixels.get(uv_index..uv_index + 2))
                .ok_or_else(|| anyhow!("NV12 sample ({}, {}) out of bounds", i, j))?;
            push_yuv(&mut rgb, *y as f32, uv[0] as f32 - 128.0, uv[1] as f32 - 128.0);
        }
    }
    Ok(rgb)
}

fn push_yuv(rgb: &mut Vec<u8>, y: f32, u: f32, v: f32) {
    rgb.push(clamp_to_u8(y + 1.402_f32 * v));
    rgb.push(clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v));
    rgb.push(clamp_to_u8(y + 1.772_f32 * u));
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
