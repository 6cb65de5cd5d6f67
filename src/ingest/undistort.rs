use image::{Rgb, RgbImage};

use crate::calibration::{CalibrationProfile, Distortion};

/// Remove lens distortion, keeping the same camera matrix for the output.
///
/// Every output pixel is projected to normalized coordinates, pushed through
/// the distortion model and sampled bilinearly from the source. Samples that
/// fall outside the source are left black.
pub(crate) fn undistort(
    image: &RgbImage,
    calibration: &CalibrationProfile,
    distortion: &Distortion,
) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut out = RgbImage::new(width, height);
    let CalibrationProfile { fx, fy, cx, cy, .. } = *calibration;

    for v in 0..height {
        let y = (v as f64 - cy) / fy;
        for u in 0..width {
            let x = (u as f64 - cx) / fx;
            let (xd, yd) = distortion.distort(x, y);
            if let Some(pixel) = sample_bilinear(image, xd * fx + cx, yd * fy + cy) {
                out.put_pixel(u, v, pixel);
            }
        }
    }

    out
}

fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> Option<Rgb<u8>> {
    let (width, height) = image.dimensions();
    if !x.is_finite() || !y.is_finite() {
        return None;
    }
    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;
    if x < 0.0 || y < 0.0 || x > max_x || y > max_y {
        return None;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let ax = x - x0 as f64;
    let ay = y - y0 as f64;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let top = p00[c] as f64 * (1.0 - ax) + p10[c] as f64 * ax;
        let bottom = p01[c] as f64 * (1.0 - ax) + p11[c] as f64 * ax;
        *slot = (top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8;
    }
    Some(Rgb(out))
}
