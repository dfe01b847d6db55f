//! Ready-made task implementations

pub mod brightness;
pub mod slice_map;

pub use self::brightness::{brighten_pixel, BrightnessFilter, DEFAULT_BRIGHTNESS_FACTOR};
pub use self::slice_map::SliceMapTask;
