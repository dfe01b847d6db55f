//! Brightness filter over packed RGB pixels
//!
//! Pixels are packed as `0xRRGGBB`. Each channel is scaled by the filter
//! factor, truncated, and clamped at 255.

use std::sync::Arc;

use crate::error::LeafError;
use crate::task::{ForkJoinTask, TaskRange};

/// Default brightening factor (+20%)
pub const DEFAULT_BRIGHTNESS_FACTOR: f32 = 1.2;

/// Largest valid packed pixel
pub const MAX_PIXEL: u32 = 0x00FF_FFFF;

/// Scale every channel of a packed pixel by `factor`, clamping at 255
pub fn brighten_pixel(pixel: u32, factor: f32) -> u32 {
    let scale = |channel: u32| -> u32 { ((channel as f32 * factor) as u32).min(255) };

    let red = scale((pixel >> 16) & 0xFF);
    let green = scale((pixel >> 8) & 0xFF);
    let blue = scale(pixel & 0xFF);

    (red << 16) | (green << 8) | blue
}

/// Recursive brightness filter over a shared pixel buffer
#[derive(Clone)]
pub struct BrightnessFilter {
    pixels: Arc<[u32]>,
    factor: f32,
    range: TaskRange,
}

impl BrightnessFilter {
    /// Filter covering every pixel with the default factor
    pub fn new(pixels: impl Into<Arc<[u32]>>) -> Self {
        let pixels = pixels.into();
        let range = TaskRange::new(0, pixels.len());
        Self {
            pixels,
            factor: DEFAULT_BRIGHTNESS_FACTOR,
            range,
        }
    }

    /// Use a different brightening factor
    pub fn with_factor(mut self, factor: f32) -> Self {
        self.factor = factor;
        self
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }
}

impl ForkJoinTask for BrightnessFilter {
    type Output = Vec<u32>;

    fn range(&self) -> TaskRange {
        self.range
    }

    fn split(self) -> (Self, Self) {
        let (left, right) = self.range.split();
        let right = Self {
            pixels: Arc::clone(&self.pixels),
            factor: self.factor,
            range: right,
        };
        (Self { range: left, ..self }, right)
    }

    fn compute_leaf(self) -> Result<Self::Output, LeafError> {
        let mut output = Vec::with_capacity(self.range.len());
        for index in self.range.indices() {
            let pixel = self.pixels[index];
            if pixel > MAX_PIXEL {
                return Err(LeafError::at(
                    index,
                    format!("pixel {:#010x} has bits set above 0xFFFFFF", pixel),
                ));
            }
            output.push(brighten_pixel(pixel, self.factor));
        }
        Ok(output)
    }

    fn merge(mut left: Self::Output, right: Self::Output) -> Self::Output {
        left.extend(right);
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::compute_sequential;

    #[test]
    fn test_brighten_pixel_scales_and_clamps() {
        // 100 * 1.2 = 120, 200 * 1.2 = 240, 250 * 1.2 = 300 -> 255
        let pixel = (100 << 16) | (200 << 8) | 250;
        assert_eq!(brighten_pixel(pixel, 1.2), (120 << 16) | (240 << 8) | 255);
        assert_eq!(brighten_pixel(0, 1.2), 0);
        assert_eq!(brighten_pixel(MAX_PIXEL, 1.2), MAX_PIXEL);
    }

    #[test]
    fn test_filter_over_all_pixels() {
        let pixels: Vec<u32> = (0..3000).map(|i| (i * 2654435761_u64 % 0xC8C8C8) as u32).collect();
        let expected: Vec<u32> = pixels.iter().map(|&p| brighten_pixel(p, DEFAULT_BRIGHTNESS_FACTOR)).collect();

        let output = compute_sequential(BrightnessFilter::new(pixels), 1000).unwrap();
        assert_eq!(output, expected);
    }

    #[test]
    fn test_invalid_pixel_is_a_leaf_error() {
        let mut pixels = vec![0x101010_u32; 50];
        pixels[17] = 0xFF00_0000;

        let error = compute_sequential(BrightnessFilter::new(pixels), 8).unwrap_err();
        assert_eq!(error.range, TaskRange::new(17, 18));
    }

    #[test]
    fn test_custom_factor() {
        let filter = BrightnessFilter::new(vec![0x0A0A0A]).with_factor(2.0);
        assert_eq!(filter.factor(), 2.0);
        assert_eq!(compute_sequential(filter, 1000).unwrap(), vec![0x141414]);
    }
}
