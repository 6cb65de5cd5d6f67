//! Normalized frame values handed to the perception pipeline.
//!
//! - `ImageTensor`: 8-bit pixels in `[1, 3, H, W]` (batch, channel, row, column) order.
//!   Channel order follows `ChannelOrder` (BGR by default).
//! - `Intrinsics`: `[fx, fy, cx, cy]` rescaled to the tensor's resolution.
//! - `Frame`: one yielded item of the ingest sequence.
//!
//! Frames are not retained by the ingestor; ownership moves to the consumer.

use anyhow::{anyhow, Result};

/// Pinhole intrinsics `[fx, fy, cx, cy]`.
pub type Intrinsics = [f64; 4];

/// Number of color channels in a normalized tensor.
pub const CHANNELS: usize = 3;

/// Dense `[1, 3, H, W]` tensor of 8-bit samples, channels as set by `ChannelOrder`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageTensor {
    shape: [usize; 4],
    data: Vec<u8>,
}

impl ImageTensor {
    /// Build a tensor from planar channel-first data.
    pub fn from_planar(height: usize, width: usize, data: Vec<u8>) -> Result<Self> {
        let expected = height
            .checked_mul(width)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| anyhow!("tensor dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "tensor length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            shape: [1, CHANNELS, height, width],
            data,
        })
    }

    /// `[batch, channels, height, width]`.
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn height(&self) -> usize {
        self.shape[2]
    }

    pub fn width(&self) -> usize {
        self.shape[3]
    }

    /// One channel plane, `height * width` samples row-major.
    pub fn channel(&self, c: usize) -> &[u8] {
        let plane = self.height() * self.width();
        &self.data[c * plane..(c + 1) * plane]
    }

    /// Sample at channel `c`, row `y`, column `x`.
    pub fn get(&self, c: usize, y: usize, x: usize) -> u8 {
        self.channel(c)[y * self.width() + x]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }
}

/// One normalized frame yielded by the ingestor.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Starts at 0 and increases by one per yielded frame.
    pub sequence: u64,
    pub image: ImageTensor,
    pub intrinsics: Intrinsics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_indexing_is_channel_first() -> Result<()> {
        // 1x2 image: red pixel then blue pixel.
        let data = vec![255, 0, 0, 0, 0, 255];
        let tensor = ImageTensor::from_planar(1, 2, data)?;
        assert_eq!(tensor.shape(), [1, 3, 1, 2]);
        assert_eq!(tensor.get(0, 0, 0), 255);
        assert_eq!(tensor.get(2, 0, 1), 255);
        assert_eq!(tensor.channel(1), &[0, 0]);
        Ok(())
    }

    #[test]
    fn rejects_length_mismatch() {
        assert!(ImageTensor::from_planar(2, 2, vec![0; 11]).is_err());
    }
}
