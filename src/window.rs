use image::{ImageBuffer, Luma};
use ndarray::ArrayView2;
use rayon::prelude::*;

use crate::enums::Polarity;
use crate::ingest::Calibration;
use crate::series::Series;

/// Smallest usable window width, in calibrated units. A degenerate width
/// (zero, negative, or an all-identical-value distribution in the
/// percentile fallback) clamps here so the rescale never divides by zero;
/// the output then behaves as a threshold at the window center.
pub const MIN_WINDOW_WIDTH: f32 = 1.0;

/// Per-viewing-session display mapping. Never persisted on a slice; the
/// same stored samples can be viewed under any number of window states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowState {
    pub width: f32,
    pub center: f32,
    pub invert: bool,
}

impl WindowState {
    pub fn new(width: f32, center: f32) -> Self {
        Self {
            width,
            center,
            invert: false,
        }
    }
}

/// 8-bit grayscale raster produced by the rendering pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn into_image(self) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        ImageBuffer::from_raw(self.width, self.height, self.pixels)
    }
}

/// Compose source-declared polarity with the user's invert toggle.
/// Inverting an already-inverted slice lands back on direct polarity.
pub fn apply_polarity(declared: Polarity, user_invert: bool) -> bool {
    declared.is_inverted() ^ user_invert
}

/// Map one raw sample to display intensity: calibrate, clip to the window,
/// rescale linearly to 8 bits. Monotonic non-decreasing in `raw` within
/// the window (non-increasing when inverted).
#[inline]
pub fn apply_window(raw: f32, state: &WindowState, calibration: Calibration) -> u8 {
    let width = state.width.max(MIN_WINDOW_WIDTH);
    let low = state.center - width / 2.0;

    let value = calibration.apply(raw);
    let scaled = ((value - low) / width * 255.0).clamp(0.0, 255.0) as u8;
    if state.invert { 255 - scaled } else { scaled }
}

/// Window a 2D raw-sample view into an 8-bit [`Frame`], one pixel per
/// sample, parallelized per pixel.
pub fn window_frame(view: ArrayView2<'_, f32>, state: &WindowState, calibration: Calibration) -> Frame {
    let (height, width) = view.dim();
    let pixels: Vec<u8> = view
        .into_par_iter()
        .map(|&raw| apply_window(raw, state, calibration))
        .collect();
    Frame {
        width: width as u32,
        height: height as u32,
        pixels,
    }
}

/// Nearest-rank percentile over an unsorted sample set.
fn percentile(sorted: &[f32], p: f32) -> f32 {
    debug_assert!(!sorted.is_empty());
    let rank = (p / 100.0 * (sorted.len() - 1) as f32).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Initial window for a series: the source-declared width/center when one
/// exists (first value of a multi-valued declaration), otherwise a
/// percentile estimate over the calibrated values of the representative
/// slice. Percentiles rather than min/max so a handful of saturated voxels
/// cannot blow the window open.
pub fn initial_window(series: &Series) -> WindowState {
    let Some(slice) = series.representative_slice() else {
        return WindowState::new(MIN_WINDOW_WIDTH, 0.0);
    };

    if let Some((width, center)) = slice.declared_window {
        return WindowState::new(width.max(MIN_WINDOW_WIDTH), center);
    }

    let mut values: Vec<f32> = slice
        .samples
        .iter()
        .map(|&raw| slice.calibration.apply(raw))
        .collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let p1 = percentile(&values, 1.0);
    let p99 = percentile(&values, 99.0);
    WindowState::new((p99 - p1).max(MIN_WINDOW_WIDTH), (p99 + p1) / 2.0)
}
