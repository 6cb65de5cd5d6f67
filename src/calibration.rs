//! Pinhole camera calibration.
//!
//! A calibration source is a single whitespace-delimited row:
//!
//! ```text
//! fx fy cx cy [k1 k2 p1 p2 [k3 [k4 k5 k6 [s1 s2 s3 s4 [tx ty]]]]]
//! ```
//!
//! Any values after the first four are lens distortion coefficients in the
//! OpenCV order: radial/tangential, rational, thin prism, then sensor tilt.
//! A row carries 4, 5, 8, 12 or 14 of them; absent terms are zero.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Coefficient counts the distortion model accepts.
pub const DISTORTION_COEFF_COUNTS: [usize; 5] = [4, 5, 8, 12, 14];

/// Maximum number of distortion coefficients the undistortion model accepts.
pub const MAX_DISTORTION_COEFFS: usize = 14;

/// Immutable pinhole calibration with optional lens distortion.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationProfile {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    distortion: Option<Distortion>,
}

/// Lens distortion coefficients `k1 k2 p1 p2 k3 k4 k5 k6 s1 s2 s3 s4 tx ty`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub k4: f64,
    pub k5: f64,
    pub k6: f64,
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
    pub s4: f64,
    /// Sensor tilt angles in radians.
    pub tau_x: f64,
    pub tau_y: f64,
    tilt: Option<[[f64; 3]; 3]>,
}

impl Distortion {
    fn from_coeffs(coeffs: &[f64]) -> Result<Self> {
        if !DISTORTION_COEFF_COUNTS.contains(&coeffs.len()) {
            return Err(anyhow!(
                "unsupported number of distortion coefficients: got {}, expected 4, 5, 8, 12 or 14",
                coeffs.len()
            ));
        }
        let mut c = [0.0f64; MAX_DISTORTION_COEFFS];
        c[..coeffs.len()].copy_from_slice(coeffs);
        let (tau_x, tau_y) = (c[12], c[13]);
        let tilt = if tau_x != 0.0 || tau_y != 0.0 {
            Some(tilt_matrix(tau_x, tau_y))
        } else {
            None
        };
        Ok(Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
            k4: c[5],
            k5: c[6],
            k6: c[7],
            s1: c[8],
            s2: c[9],
            s3: c[10],
            s4: c[11],
            tau_x,
            tau_y,
            tilt,
        })
    }

    /// Map an undistorted normalized image point to its distorted position.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6)
            / (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6);
        let xd = x * radial
            + 2.0 * self.p1 * x * y
            + self.p2 * (r2 + 2.0 * x * x)
            + self.s1 * r2
            + self.s2 * r4;
        let yd = y * radial
            + self.p1 * (r2 + 2.0 * y * y)
            + 2.0 * self.p2 * x * y
            + self.s3 * r2
            + self.s4 * r4;

        match &self.tilt {
            Some(m) => {
                let px = m[0][0] * xd + m[0][1] * yd + m[0][2];
                let py = m[1][0] * xd + m[1][1] * yd + m[1][2];
                let pz = m[2][0] * xd + m[2][1] * yd + m[2][2];
                let inv = if pz != 0.0 { 1.0 / pz } else { 1.0 };
                (px * inv, py * inv)
            }
            None => (xd, yd),
        }
    }
}

/// Projection onto a sensor tilted by `tau_x` about x and `tau_y` about y.
fn tilt_matrix(tau_x: f64, tau_y: f64) -> [[f64; 3]; 3] {
    let (sx, cx) = tau_x.sin_cos();
    let (sy, cy) = tau_y.sin_cos();
    let rot_x = [[1.0, 0.0, 0.0], [0.0, cx, sx], [0.0, -sx, cx]];
    let rot_y = [[cy, 0.0, -sy], [0.0, 1.0, 0.0], [sy, 0.0, cy]];
    let rot = matmul3(&rot_y, &rot_x);
    let proj_z = [
        [rot[2][2], 0.0, -rot[0][2]],
        [0.0, rot[2][2], -rot[1][2]],
        [0.0, 0.0, 1.0],
    ];
    matmul3(&proj_z, &rot)
}

fn matmul3(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

impl CalibrationProfile {
    /// Build a profile without distortion.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: None,
        }
    }

    /// Load a calibration row from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read calibration file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid calibration file {}", path.display()))
    }

    /// Parse a whitespace-delimited calibration row.
    pub fn parse(raw: &str) -> Result<Self> {
        let values = raw
            .split_whitespace()
            .map(|token| {
                token
                    .parse::<f64>()
                    .map_err(|_| anyhow!("calibration value '{}' is not a number", token))
            })
            .collect::<Result<Vec<f64>>>()?;

        if values.len() < 4 {
            return Err(anyhow!(
                "calibration needs at least 4 values (fx fy cx cy), got {}",
                values.len()
            ));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(anyhow!("calibration value {} is not finite", bad));
        }
        if values[0] <= 0.0 || values[1] <= 0.0 {
            return Err(anyhow!(
                "focal lengths must be positive: fx={} fy={}",
                values[0],
                values[1]
            ));
        }

        let distortion = if values.len() > 4 {
            Some(Distortion::from_coeffs(&values[4..])?)
        } else {
            None
        };

        Ok(Self {
            fx: values[0],
            fy: values[1],
            cx: values[2],
            cy: values[3],
            distortion,
        })
    }

    pub fn distortion(&self) -> Option<&Distortion> {
        self.distortion.as_ref()
    }

    /// 3x3 pinhole camera matrix, row-major.
    pub fn camera_matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }

    /// Intrinsics as `[fx, fy, cx, cy]`.
    pub fn intrinsics(&self) -> [f64; 4] {
        [self.fx, self.fy, self.cx, self.cy]
    }
}
