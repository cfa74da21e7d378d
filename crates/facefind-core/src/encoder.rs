//! Face encoder: decode an image, find faces with the Haar cascade and turn
//! each face into a normalised 100x100 grayscale patch.

use crate::detector::{CascadeError, FaceRect, HaarCascade};
use crate::types::{is_permitted_image, DetectionResult, FaceEncoding, FACE_CANVAS_SIZE};
use image::ImageDecoder;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

// BT.601 luma weights in 14-bit fixed point.
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("not a permitted image type: {0}")]
    UnsupportedExtension(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode: {0}")]
    Image(#[from] image::ImageError),
}

/// Anything that turns an image file into face encodings.
///
/// Detection failure is a normal outcome: unreadable, corrupt or faceless
/// images all produce an empty result.
pub trait FaceEncoder: Send + Sync {
    fn detect(&self, image_path: &Path) -> DetectionResult;
}

impl<T: FaceEncoder + ?Sized> FaceEncoder for &T {
    fn detect(&self, image_path: &Path) -> DetectionResult {
        (**self).detect(image_path)
    }
}

impl<T: FaceEncoder + ?Sized> FaceEncoder for Arc<T> {
    fn detect(&self, image_path: &Path) -> DetectionResult {
        (**self).detect(image_path)
    }
}

/// A decoded 8-bit grayscale image.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Production encoder backed by a [`HaarCascade`].
pub struct HaarEncoder {
    cascade: HaarCascade,
}

impl HaarEncoder {
    /// Load the cascade XML at `cascade_path`.
    pub fn load(cascade_path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        Ok(Self::from_cascade(HaarCascade::load(cascade_path)?))
    }

    pub fn from_cascade(cascade: HaarCascade) -> Self {
        Self { cascade }
    }

    /// Face rectangles in an image file, for diagnostics.
    pub fn detect_faces(&self, image_path: &Path) -> Result<Vec<FaceRect>, EncoderError> {
        let frame = open_image(image_path)?;
        Ok(self.cascade.detect(&frame.data, frame.width, frame.height))
    }

    /// Like [`FaceEncoder::detect`] but surfaces decode errors.
    pub fn encode_file(&self, image_path: &Path) -> Result<DetectionResult, EncoderError> {
        let frame = open_image(image_path)?;
        Ok(self.encode_frame(&frame))
    }

    pub fn encode_frame(&self, frame: &Frame) -> DetectionResult {
        self.cascade
            .detect(&frame.data, frame.width, frame.height)
            .iter()
            .filter_map(|rect| encode_region(frame, rect))
            .collect()
    }
}

impl FaceEncoder for HaarEncoder {
    fn detect(&self, image_path: &Path) -> DetectionResult {
        match self.encode_file(image_path) {
            Ok(encodings) => {
                tracing::debug!(path = %image_path.display(), faces = encodings.len(), "encoded image");
                encodings
            }
            Err(e) => {
                tracing::debug!(path = %image_path.display(), error = %e, "skipping unreadable image");
                Vec::new()
            }
        }
    }
}

fn open_image(image_path: &Path) -> Result<Frame, EncoderError> {
    if !is_permitted_image(image_path) {
        return Err(EncoderError::UnsupportedExtension(
            image_path.display().to_string(),
        ));
    }
    load_grayscale(image_path)
}

/// Decode an image file, apply its EXIF orientation and convert to BT.601 luma.
pub fn load_grayscale(path: &Path) -> Result<Frame, EncoderError> {
    let mut decoder = image::ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = image::DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);

    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let data = rgb
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            ((r as u32 * LUMA_R + g as u32 * LUMA_G + b as u32 * LUMA_B + (1 << (LUMA_SHIFT - 1)))
                >> LUMA_SHIFT) as u8
        })
        .collect();

    Ok(Frame { data, width, height })
}

/// Crop `rect` (clipped to the frame) and encode it.
fn encode_region(frame: &Frame, rect: &FaceRect) -> Option<FaceEncoding> {
    let (fw, fh) = (frame.width as i32, frame.height as i32);
    let x0 = rect.x.clamp(0, fw);
    let y0 = rect.y.clamp(0, fh);
    let x1 = (rect.x + rect.width).clamp(0, fw);
    let y1 = (rect.y + rect.height).clamp(0, fh);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let (cw, ch) = ((x1 - x0) as usize, (y1 - y0) as usize);
    let stride = frame.width as usize;
    let mut crop = Vec::with_capacity(cw * ch);
    for y in y0 as usize..y1 as usize {
        let row = y * stride;
        crop.extend_from_slice(&frame.data[row + x0 as usize..row + x1 as usize]);
    }

    let patch = resize_area(&crop, cw, ch, FACE_CANVAS_SIZE, FACE_CANVAS_SIZE);
    FaceEncoding::from_patch(&patch).ok()
}

/// Area-interpolated resize.
///
/// Shrinking averages every source pixel the destination cell covers,
/// weighted by the covered fraction. Enlarging (on either axis) uses the
/// area-mode bilinear rule, which snaps to the nearest source pixel except
/// across source pixel boundaries.
pub fn resize_area(src: &[u8], sw: usize, sh: usize, dw: usize, dh: usize) -> Vec<u8> {
    let scale_x = sw as f64 / dw as f64;
    let scale_y = sh as f64 / dh as f64;

    if scale_x >= 1.0 && scale_y >= 1.0 {
        shrink_area(src, sw, sh, dw, dh, scale_x, scale_y)
    } else {
        enlarge_area(src, sw, sh, dw, dh, scale_x, scale_y)
    }
}

/// Per destination index, the `(source index, weight)` pairs it averages.
fn area_weights(ssize: usize, dsize: usize, scale: f64) -> Vec<Vec<(usize, f32)>> {
    (0..dsize)
        .map(|d| {
            let fs1 = d as f64 * scale;
            let fs2 = fs1 + scale;
            let cell = scale.min(ssize as f64 - fs1);
            let s2 = (fs2.floor() as usize).min(ssize - 1);
            let s1 = (fs1.ceil() as usize).min(s2);

            let mut taps = Vec::new();
            if s1 as f64 - fs1 > 1e-3 {
                taps.push((s1 - 1, ((s1 as f64 - fs1) / cell) as f32));
            }
            for s in s1..s2 {
                taps.push((s, (1.0 / cell) as f32));
            }
            if fs2 - s2 as f64 > 1e-3 {
                taps.push((s2, ((fs2 - s2 as f64).min(1.0).min(cell) / cell) as f32));
            }
            taps
        })
        .collect()
}

fn shrink_area(
    src: &[u8],
    sw: usize,
    sh: usize,
    dw: usize,
    dh: usize,
    scale_x: f64,
    scale_y: f64,
) -> Vec<u8> {
    let xw = area_weights(sw, dw, scale_x);
    let yw = area_weights(sh, dh, scale_y);
    let mut out = vec![0u8; dw * dh];

    for (dy, ytaps) in yw.iter().enumerate() {
        for (dx, xtaps) in xw.iter().enumerate() {
            let mut acc = 0.0f32;
            for &(sy, wy) in ytaps {
                let row = sy * sw;
                let line: f32 = xtaps
                    .iter()
                    .map(|&(sx, wx)| src[row + sx] as f32 * wx)
                    .sum();
                acc += line * wy;
            }
            out[dy * dw + dx] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Source index and fractional weight of the next pixel for area-mode enlarging.
fn area_linear_coeff(d: usize, ssize: usize, scale: f64) -> (usize, usize, f32) {
    let inv_scale = 1.0 / scale;
    let s = (d as f64 * scale).floor() as i64;
    let f = ((d + 1) as f64 - (s + 1) as f64 * inv_scale) as f32;
    let mut f = if f <= 0.0 { 0.0 } else { f - f.floor() };
    let mut s = s.max(0) as usize;
    if s >= ssize - 1 {
        s = ssize - 1;
        f = 0.0;
    }
    (s, (s + 1).min(ssize - 1), f)
}

fn enlarge_area(
    src: &[u8],
    sw: usize,
    sh: usize,
    dw: usize,
    dh: usize,
    scale_x: f64,
    scale_y: f64,
) -> Vec<u8> {
    let xs: Vec<_> = (0..dw).map(|d| area_linear_coeff(d, sw, scale_x)).collect();
    let mut out = vec![0u8; dw * dh];

    for dy in 0..dh {
        let (y0, y1, fy) = area_linear_coeff(dy, sh, scale_y);
        for (dx, &(x0, x1, fx)) in xs.iter().enumerate() {
            let tl = src[y0 * sw + x0] as f32;
            let tr = src[y0 * sw + x1] as f32;
            let bl = src[y1 * sw + x0] as f32;
            let br = src[y1 * sw + x1] as f32;
            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;
            out[dy * dw + dx] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::stub_cascade_xml;
    use crate::types::ENCODING_DIM;
    use tempfile::TempDir;

    fn encoder(accept: bool) -> HaarEncoder {
        let xml = if accept {
            stub_cascade_xml(-1.0, 1.0)
        } else {
            stub_cascade_xml(1.0, 0.0)
        };
        HaarEncoder::from_cascade(HaarCascade::parse(&xml).unwrap())
    }

    fn write_noise_png(dir: &TempDir, name: &str, w: u32, h: u32) -> std::path::PathBuf {
        let path = dir.path().join(name);
        image::GrayImage::from_fn(w, h, |x, y| image::Luma([((x * 7 + y * 13) % 256) as u8]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_resize_area_uniform() {
        let src = vec![77u8; 150 * 130];
        assert!(resize_area(&src, 150, 130, 100, 100).iter().all(|&p| p == 77));
        let small = vec![77u8; 64 * 70];
        assert!(resize_area(&small, 64, 70, 100, 100).iter().all(|&p| p == 77));
    }

    #[test]
    fn test_resize_area_block_average() {
        #[rustfmt::skip]
        let src = [
            0, 0, 100, 100,
            0, 0, 100, 100,
            50, 50, 200, 200,
            50, 50, 200, 201,
        ];
        assert_eq!(resize_area(&src, 4, 4, 2, 2), vec![0, 100, 50, 200]);
    }

    #[test]
    fn test_resize_area_fractional_coverage() {
        // Each output cell covers 1.5 source pixels.
        assert_eq!(resize_area(&[30, 60, 90], 3, 1, 2, 1), vec![40, 80]);
    }

    #[test]
    fn test_resize_area_enlarge_snaps() {
        assert_eq!(resize_area(&[10, 200], 2, 1, 4, 1), vec![10, 10, 200, 200]);
    }

    #[test]
    fn test_load_grayscale_bt601() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rgb.png");
        let mut img = image::RgbImage::new(3, 1);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        img.put_pixel(1, 0, image::Rgb([0, 255, 0]));
        img.put_pixel(2, 0, image::Rgb([255, 255, 255]));
        img.save(&path).unwrap();

        let frame = load_grayscale(&path).unwrap();
        assert_eq!((frame.width, frame.height), (3, 1));
        assert_eq!(frame.data, vec![76, 150, 255]);
    }

    #[test]
    fn test_faceless_image_yields_empty() {
        let dir = TempDir::new().unwrap();
        let path = write_noise_png(&dir, "plain.png", 160, 120);
        assert!(encoder(false).detect(&path).is_empty());
    }

    #[test]
    fn test_unreadable_images_yield_empty() {
        let dir = TempDir::new().unwrap();
        let corrupt = dir.path().join("broken.jpg");
        std::fs::write(&corrupt, b"definitely not a jpeg").unwrap();
        let gif = write_noise_png(&dir, "frame.png", 120, 120);
        let renamed = dir.path().join("frame.gif");
        std::fs::rename(&gif, &renamed).unwrap();

        let enc = encoder(true);
        assert!(enc.detect(&corrupt).is_empty());
        assert!(enc.detect(&renamed).is_empty());
        assert!(enc.detect(&dir.path().join("missing.png")).is_empty());
        assert!(matches!(
            enc.encode_file(&renamed),
            Err(EncoderError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn test_detected_faces_become_normalized_encodings() {
        let dir = TempDir::new().unwrap();
        let path = write_noise_png(&dir, "crowd.png", 120, 120);
        let encodings = encoder(true).detect(&path);
        assert!(!encodings.is_empty());
        for enc in &encodings {
            assert_eq!(enc.values().len(), ENCODING_DIM);
            assert!(enc.values().iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_encode_region_clips_to_frame() {
        let frame = Frame {
            data: vec![255u8; 80 * 80],
            width: 80,
            height: 80,
        };
        let rect = FaceRect { x: 40, y: 40, width: 70, height: 70 };
        let enc = encode_region(&frame, &rect).unwrap();
        assert!(enc.values().iter().all(|&v| v == 1.0));

        let outside = FaceRect { x: 90, y: 0, width: 10, height: 10 };
        assert!(encode_region(&frame, &outside).is_none());
    }
}
