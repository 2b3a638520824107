use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};

use crate::error::{PipelineError, PipelineResult};

/// Decode an image file into an RGB frame.
pub fn load_image(path: &Path) -> PipelineResult<RgbImage> {
    let img = image::open(path)
        .map_err(|err| PipelineError::Io(format!("failed to decode {}: {}", path.display(), err)))?;
    Ok(img.into_rgb8())
}

/// Write a frame to `path` in the format implied by its extension.
pub fn save_image(frame: &RgbImage, path: &Path) -> PipelineResult<()> {
    let format = ImageFormat::from_path(path).map_err(|err| {
        PipelineError::Encoding(format!("no encoder for {}: {}", path.display(), err))
    })?;
    frame.save_with_format(path, format).map_err(|err| match err {
        image::ImageError::IoError(io) => {
            PipelineError::Io(format!("failed to write {}: {}", path.display(), io))
        }
        other => PipelineError::Encoding(format!("failed to encode {}: {}", path.display(), other)),
    })
}

/// Compress a frame to JPEG for transport.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> PipelineResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::with_capacity(frame.as_raw().len() / 8));
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(frame)
        .map_err(PipelineError::encoding)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn jpeg_starts_with_soi_marker() -> PipelineResult<()> {
        let frame = RgbImage::from_pixel(16, 16, Rgb([120, 40, 200]));
        let jpeg = encode_jpeg(&frame, 80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn png_round_trip_is_lossless() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("frame.png");
        let frame = RgbImage::from_fn(5, 3, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 7]));
        save_image(&frame, &path)?;
        assert_eq!(load_image(&path)?, frame);
        Ok(())
    }

    #[test]
    fn load_rejects_garbage() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not a jpeg")?;
        assert!(matches!(load_image(&path), Err(PipelineError::Io(_))));
        Ok(())
    }
}
