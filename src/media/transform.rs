//! Optional post-processing of cached images.
//!
//! Both operations rewrite the file in place and never touch animated
//! formats (GIF, WebP): decoding those yields only the first frame and
//! re-encoding would silently drop the animation. They are synchronous and
//! CPU-bound; async callers run them on the blocking pool.

use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, Rgba};
use rand::Rng;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Near-white value written into the chosen corner pixel.
const CORNER_VALUE: u8 = 254;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),
}

/// What a transform did to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    Applied,
    /// Animated format or empty image; file left untouched.
    Skipped,
}

impl TransformOutcome {
    pub fn applied(self) -> bool {
        self == TransformOutcome::Applied
    }
}

/// Formats whose files may carry several frames.
pub fn is_animated_format(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Gif | ImageFormat::WebP)
}

/// Sets one randomly chosen corner pixel to near-white.
///
/// Changes the file hash without a visible difference.
pub fn adjust_corner_pixel(path: &Path) -> Result<TransformOutcome, TransformError> {
    rewrite(path, |image, format| {
        let (width, height) = image.dimensions();
        let corners = [(0, 0), (width - 1, 0), (0, height - 1), (width - 1, height - 1)];
        let (x, y) = corners[rand::thread_rng().gen_range(0..corners.len())];

        // JPEG has no alpha channel
        if format == ImageFormat::Jpeg {
            let mut rgb = image.to_rgb8();
            rgb.put_pixel(x, y, Rgb([CORNER_VALUE; 3]));
            DynamicImage::ImageRgb8(rgb)
        } else {
            let mut rgba = image.to_rgba8();
            rgba.put_pixel(x, y, Rgba([CORNER_VALUE, CORNER_VALUE, CORNER_VALUE, u8::MAX]));
            DynamicImage::ImageRgba8(rgba)
        }
    })
}

/// Rotates the image 180 degrees.
pub fn rotate_180(path: &Path) -> Result<TransformOutcome, TransformError> {
    rewrite(path, |image, _| image.rotate180())
}

fn rewrite<F>(path: &Path, edit: F) -> Result<TransformOutcome, TransformError>
where
    F: FnOnce(DynamicImage, ImageFormat) -> DynamicImage,
{
    let io_err = |source| TransformError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = std::fs::read(path).map_err(io_err)?;
    let format = image::guess_format(&bytes)?;
    if is_animated_format(format) {
        tracing::debug!(path = %path.display(), format = ?format, "Skipping transform of animated image");
        return Ok(TransformOutcome::Skipped);
    }

    let image = image::load_from_memory_with_format(&bytes, format)?;
    if image.width() == 0 || image.height() == 0 {
        return Ok(TransformOutcome::Skipped);
    }
    let edited = edit(image, format);

    // Encode next to the target, then swap it in so readers never see a half-written file
    let tmp = path.with_extension(format!("{}.transform.part", uuid::Uuid::new_v4().simple()));
    if let Err(e) = edited.save_with_format(&tmp, format) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(TransformOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use tempfile::TempDir;

    fn write_png(dir: &TempDir, name: &str, image: RgbaImage) -> PathBuf {
        let path = dir.path().join(name);
        DynamicImage::ImageRgba8(image)
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        path
    }

    #[test]
    fn test_adjust_changes_exactly_one_corner() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "a.png", RgbaImage::from_pixel(4, 3, Rgba([0, 0, 0, 255])));

        assert_eq!(adjust_corner_pixel(&path).unwrap(), TransformOutcome::Applied);

        let img = image::open(&path).unwrap().to_rgba8();
        let near_white = Rgba([254, 254, 254, 255]);
        let changed = [(0, 0), (3, 0), (0, 2), (3, 2)]
            .iter()
            .filter(|(x, y)| *img.get_pixel(*x, *y) == near_white)
            .count();
        assert_eq!(changed, 1);
        assert_eq!(*img.get_pixel(1, 1), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_rotate_180_swaps_pixels() {
        let dir = TempDir::new().unwrap();
        let mut img = RgbaImage::from_pixel(2, 1, Rgba([255, 0, 0, 255]));
        img.put_pixel(1, 0, Rgba([0, 0, 255, 255]));
        let path = write_png(&dir, "r.png", img);

        assert!(rotate_180(&path).unwrap().applied());

        let rotated = image::open(&path).unwrap().to_rgba8();
        assert_eq!(*rotated.get_pixel(0, 0), Rgba([0, 0, 255, 255]));
        assert_eq!(*rotated.get_pixel(1, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_concurrent_rewrites_of_one_file() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "c.png", RgbaImage::from_pixel(8, 8, Rgba([10, 20, 30, 255])));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        rotate_180(&path)
                    } else {
                        adjust_corner_pixel(&path)
                    }
                })
            })
            .collect();
        for thread in threads {
            assert!(thread.join().unwrap().unwrap().applied());
        }

        assert!(image::open(&path).is_ok());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["c.png".to_string()]);
    }

    #[test]
    fn test_animated_formats_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("anim.gif");
        let bytes = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;".to_vec();
        std::fs::write(&path, &bytes).unwrap();

        assert_eq!(rotate_180(&path).unwrap(), TransformOutcome::Skipped);
        assert_eq!(adjust_corner_pixel(&path).unwrap(), TransformOutcome::Skipped);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.jpg");
        std::fs::write(&path, b"definitely not an image").unwrap();
        assert!(matches!(rotate_180(&path), Err(TransformError::Image(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            rotate_180(&dir.path().join("missing.png")),
            Err(TransformError::Io { .. })
        ));
    }
}
