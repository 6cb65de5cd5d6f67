use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

use super::undistort::undistort;
use crate::calibration::CalibrationProfile;
use crate::frame::{ImageTensor, Intrinsics, CHANNELS};

/// Pixel budget the resize step aims for (384 x 512).
pub const TARGET_PIXELS: u32 = 384 * 512;

/// Output height and width are cropped to multiples of this.
pub const ALIGNMENT: u32 = 8;

/// Channel order of the output tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    /// Blue, green, red (OpenCV layout).
    #[default]
    Bgr,
}

/// Decode a compressed color image. Undecodable payloads yield `None`.
pub fn decode_color(bytes: &[u8]) -> Option<RgbImage> {
    image::load_from_memory(bytes)
        .ok()
        .map(|image| image.into_rgb8())
}

/// Aspect-preserving size whose area approaches `target_pixels`.
///
/// Returns `(height, width)` before alignment cropping.
pub fn scaled_size(height: u32, width: u32, target_pixels: u32) -> (u32, u32) {
    let scale = (target_pixels as f64 / (height as f64 * width as f64)).sqrt();
    let h1 = (height as f64 * scale).round() as u32;
    let w1 = (width as f64 * scale).round() as u32;
    (h1, w1)
}

/// Largest multiple of `ALIGNMENT` not above `value`.
pub fn align_down(value: u32) -> u32 {
    value - value % ALIGNMENT
}

/// Rescale `[fx, fy, cx, cy]` from `(h0, w0)` to `(h1, w1)`.
pub fn scale_intrinsics(intrinsics: Intrinsics, h0: u32, w0: u32, h1: u32, w1: u32) -> Intrinsics {
    let sx = w1 as f64 / w0 as f64;
    let sy = h1 as f64 / h0 as f64;
    let [fx, fy, cx, cy] = intrinsics;
    [fx * sx, fy * sy, cx * sx, cy * sy]
}

/// Geometric normalization applied to every decoded frame.
#[derive(Clone, Debug)]
pub struct Normalizer {
    calibration: CalibrationProfile,
    target_pixels: u32,
    order: ChannelOrder,
}

impl Normalizer {
    pub fn new(calibration: CalibrationProfile) -> Self {
        Self {
            calibration,
            target_pixels: TARGET_PIXELS,
            order: ChannelOrder::default(),
        }
    }

    pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_target_pixels(mut self, target_pixels: u32) -> Self {
        self.target_pixels = target_pixels;
        self
    }

    pub fn calibration(&self) -> &CalibrationProfile {
        &self.calibration
    }

    /// Undistort, resize to the pixel budget, crop to 8-alignment and
    /// convert to a `[1, 3, H, W]` tensor with matching intrinsics.
    pub fn normalize(&self, image: RgbImage) -> Result<(ImageTensor, Intrinsics)> {
        let image = match self.calibration.distortion() {
            Some(distortion) => undistort(&image, &self.calibration, distortion),
            None => image,
        };

        let (w0, h0) = image.dimensions();
        if w0 == 0 || h0 == 0 {
            return Err(anyhow!("empty frame {}x{}", w0, h0));
        }

        let (h1, w1) = scaled_size(h0, w0, self.target_pixels);
        let (h_out, w_out) = (align_down(h1), align_down(w1));
        if h_out == 0 || w_out == 0 {
            return Err(anyhow!(
                "frame {}x{} too small: resized to {}x{}, nothing left after {}-alignment",
                w0,
                h0,
                w1,
                h1,
                ALIGNMENT
            ));
        }

        let resized = if (w1, h1) == (w0, h0) {
            image
        } else {
            imageops::resize(&image, w1, h1, FilterType::Triangle)
        };
        let cropped = imageops::crop_imm(&resized, 0, 0, w_out, h_out).to_image();

        let tensor = to_planar(&cropped, self.order)?;
        let intrinsics = scale_intrinsics(self.calibration.intrinsics(), h0, w0, h1, w1);
        Ok((tensor, intrinsics))
    }
}

fn to_planar(image: &RgbImage, order: ChannelOrder) -> Result<ImageTensor> {
    let (width, height) = image.dimensions();
    let plane = width as usize * height as usize;
    let mut data = vec![0u8; plane * CHANNELS];
    let sources: [usize; CHANNELS] = match order {
        ChannelOrder::Rgb => [0, 1, 2],
        ChannelOrder::Bgr => [2, 1, 0],
    };

    for (i, pixel) in image.pixels().enumerate() {
        for (c, &src) in sources.iter().enumerate() {
            data[c * plane + i] = pixel[src];
        }
    }

    ImageTensor::from_planar(height as usize, width as usize, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([10, 20, 30]))
    }

    #[test]
    fn vga_frame_scales_to_budget_exactly() {
        assert_eq!(scaled_size(480, 640, TARGET_PIXELS), (384, 512));
    }

    #[test]
    fn align_down_drops_remainder() {
        assert_eq!(align_down(384), 384);
        assert_eq!(align_down(391), 384);
        assert_eq!(align_down(7), 0);
    }

    #[test]
    fn vga_frame_normalizes_to_384x512() -> Result<()> {
        let calib = CalibrationProfile::parse("300 300 320 240")?;
        let (tensor, intrinsics) = Normalizer::new(calib).normalize(solid(640, 480))?;
        assert_eq!(tensor.shape(), [1, 3, 384, 512]);
        let expected = [240.0, 240.0, 256.0, 192.0];
        for (got, want) in intrinsics.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{} != {}", got, want);
        }
        Ok(())
    }

    #[test]
    fn odd_sizes_are_cropped_to_multiples_of_eight() -> Result<()> {
        let calib = CalibrationProfile::pinhole(400.0, 410.0, 250.0, 166.0);
        let normalizer = Normalizer::new(calib);
        for (w, h) in [(500, 333), (1280, 720), (97, 1001), (1920, 1080)] {
            let (tensor, intrinsics) = normalizer.normalize(solid(w, h))?;
            assert_eq!(tensor.height() % 8, 0, "{}x{}", w, h);
            assert_eq!(tensor.width() % 8, 0, "{}x{}", w, h);

            let (h1, w1) = scaled_size(h, w, TARGET_PIXELS);
            assert_eq!(tensor.height() as u32, align_down(h1));
            assert_eq!(tensor.width() as u32, align_down(w1));
            assert!((intrinsics[0] / 400.0 - w1 as f64 / w as f64).abs() < 1e-9);
            assert!((intrinsics[1] / 410.0 - h1 as f64 / h as f64).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn channel_order_is_applied() -> Result<()> {
        assert_eq!(ChannelOrder::default(), ChannelOrder::Bgr);
        let calib = CalibrationProfile::pinhole(300.0, 300.0, 320.0, 240.0);
        let (bgr, _) = Normalizer::new(calib.clone()).normalize(solid(640, 480))?;
        assert_eq!(bgr.get(0, 0, 0), 30);
        assert_eq!(bgr.get(2, 0, 0), 10);

        let (rgb, _) = Normalizer::new(calib)
            .with_channel_order(ChannelOrder::Rgb)
            .normalize(solid(640, 480))?;
        assert_eq!(rgb.get(0, 100, 100), 10);
        assert_eq!(rgb.get(1, 100, 100), 20);
        Ok(())
    }

    #[test]
    fn tiny_budget_that_crops_to_nothing_is_an_error() -> Result<()> {
        let calib = CalibrationProfile::pinhole(300.0, 300.0, 320.0, 240.0);
        let result = Normalizer::new(calib)
            .with_target_pixels(16)
            .normalize(solid(640, 480));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn garbage_bytes_do_not_decode() {
        assert!(decode_color(b"definitely not a jpeg").is_none());
        assert!(decode_color(&[]).is_none());
    }
}
