use ndarray::Array2;

use crate::enums::Polarity;
use crate::error::IngestError;

/// Linear raw-to-calibrated transform (`slope * raw + intercept`), supplied
/// per slice by the decoder. For CT this maps stored values to Hounsfield
/// units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    pub slope: f32,
    pub intercept: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

impl Calibration {
    #[inline]
    pub fn apply(&self, raw: f32) -> f32 {
        raw.mul_add(self.slope, self.intercept)
    }
}

/// Raw per-slice descriptor as handed over by the file-format decoder.
///
/// The payload is frame-major, row-major within a frame, with
/// `samples_per_pixel` interleaved channels. Nothing here is trusted until
/// [`validate`] has run.
#[derive(Clone, Debug)]
pub struct RawSlice {
    pub instance_number: Option<i32>,
    pub rows: usize,
    pub cols: usize,
    pub samples_per_pixel: usize,
    pub frames: usize,
    pub pixels: Vec<f32>,
    /// (row spacing, column spacing) in millimetres.
    pub pixel_spacing: (f32, f32),
    /// Patient-space position of the first sample, millimetres.
    pub position: [f32; 3],
    pub calibration: Calibration,
    pub polarity: Polarity,
    /// Source-declared window widths, possibly empty or multi-valued.
    pub window_widths: Vec<f32>,
    /// Source-declared window centers, possibly empty or multi-valued.
    pub window_centers: Vec<f32>,
}

impl RawSlice {
    /// A minimal single-frame monochrome descriptor; the common case, and
    /// what most tests start from.
    pub fn monochrome(rows: usize, cols: usize, pixels: Vec<f32>) -> Self {
        Self {
            instance_number: None,
            rows,
            cols,
            samples_per_pixel: 1,
            frames: 1,
            pixels,
            pixel_spacing: (1.0, 1.0),
            position: [0.0, 0.0, 0.0],
            calibration: Calibration::default(),
            polarity: Polarity::default(),
            window_widths: Vec::new(),
            window_centers: Vec::new(),
        }
    }
}

/// Validated, immutable 2D cross-sectional sample. Created once at
/// ingestion and never mutated; display parameters are applied downstream
/// without touching the stored samples.
#[derive(Clone, Debug)]
pub struct Slice {
    pub instance_number: Option<i32>,
    /// Raw (uncalibrated) single-channel samples, (rows, cols).
    pub samples: Array2<f32>,
    pub pixel_spacing: (f32, f32),
    pub position: [f32; 3],
    pub calibration: Calibration,
    pub polarity: Polarity,
    /// First declared (width, center) pair, when the source declared one.
    pub declared_window: Option<(f32, f32)>,
}

impl Slice {
    pub fn rows(&self) -> usize {
        self.samples.dim().0
    }

    pub fn cols(&self) -> usize {
        self.samples.dim().1
    }
}

/// Aggregate result of a batch load. Per-slice failures never abort the
/// batch; they are collected here with the index of the offending
/// descriptor.
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub loaded: usize,
    pub rejected: usize,
    pub failures: Vec<(usize, IngestError)>,
}

/// Validate one raw descriptor into an immutable [`Slice`].
///
/// Multi-frame payloads take the first frame canonically. Multi-sample
/// (e.g. RGB) payloads are collapsed to a single luminance channel by
/// averaging the samples of each pixel.
pub fn validate(raw: RawSlice) -> Result<Slice, IngestError> {
    if raw.rows == 0 || raw.cols == 0 {
        return Err(IngestError::ZeroDimensions);
    }
    if raw.pixels.is_empty() {
        return Err(IngestError::EmptyPixelData);
    }

    let samples_per_pixel = raw.samples_per_pixel.max(1);
    let frames = raw.frames.max(1);
    let expected = frames * raw.rows * raw.cols * samples_per_pixel;
    if raw.pixels.len() != expected {
        return Err(IngestError::DimensionMismatch {
            expected,
            actual: raw.pixels.len(),
        });
    }

    // First frame only; later frames of a multi-frame payload are dropped.
    let frame_len = raw.rows * raw.cols * samples_per_pixel;
    let frame = &raw.pixels[..frame_len];

    let luminance: Vec<f32> = if samples_per_pixel == 1 {
        frame.to_vec()
    } else {
        frame
            .chunks_exact(samples_per_pixel)
            .map(|px| px.iter().sum::<f32>() / samples_per_pixel as f32)
            .collect()
    };

    let samples = Array2::from_shape_vec((raw.rows, raw.cols), luminance)
        .map_err(|_| IngestError::DimensionMismatch {
            expected,
            actual: raw.pixels.len(),
        })?;

    let declared_window = match (
        raw.window_widths.first().copied(),
        raw.window_centers.first().copied(),
    ) {
        (Some(width), Some(center)) => Some((width, center)),
        _ => None,
    };

    Ok(Slice {
        instance_number: raw.instance_number,
        samples,
        pixel_spacing: raw.pixel_spacing,
        position: raw.position,
        calibration: raw.calibration,
        polarity: raw.polarity,
        declared_window,
    })
}

/// Validate a batch of descriptors, tolerating per-slice failures.
pub fn ingest_batch(raws: Vec<RawSlice>) -> (Vec<Slice>, LoadSummary) {
    let mut slices = Vec::with_capacity(raws.len());
    let mut summary = LoadSummary::default();

    for (index, raw) in raws.into_iter().enumerate() {
        match validate(raw) {
            Ok(slice) => {
                slices.push(slice);
                summary.loaded += 1;
            }
            Err(err) => {
                log::warn!("rejected slice {index}: {err}");
                summary.rejected += 1;
                summary.failures.push((index, err));
            }
        }
    }

    (slices, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_payload() {
        let raw = RawSlice::monochrome(4, 4, Vec::new());
        assert!(matches!(validate(raw), Err(IngestError::EmptyPixelData)));
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let raw = RawSlice::monochrome(4, 4, vec![0.0; 15]);
        match validate(raw) {
            Err(IngestError::DimensionMismatch { expected, actual }) => {
                assert_eq!(expected, 16);
                assert_eq!(actual, 15);
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_dimensions() {
        let raw = RawSlice::monochrome(0, 4, vec![0.0; 4]);
        assert!(matches!(validate(raw), Err(IngestError::ZeroDimensions)));
    }

    #[test]
    fn multiframe_takes_first_frame() {
        let mut raw = RawSlice::monochrome(2, 2, vec![1.0, 2.0, 3.0, 4.0, 9.0, 9.0, 9.0, 9.0]);
        raw.frames = 2;
        let slice = validate(raw).unwrap();
        assert_eq!(slice.samples[[0, 0]], 1.0);
        assert_eq!(slice.samples[[1, 1]], 4.0);
    }

    #[test]
    fn rgb_averages_to_luminance() {
        let mut raw = RawSlice::monochrome(1, 2, vec![30.0, 60.0, 90.0, 0.0, 0.0, 30.0]);
        raw.samples_per_pixel = 3;
        let slice = validate(raw).unwrap();
        assert_eq!(slice.samples[[0, 0]], 60.0);
        assert_eq!(slice.samples[[0, 1]], 10.0);
    }

    #[test]
    fn first_declared_window_is_canonical() {
        let mut raw = RawSlice::monochrome(1, 1, vec![0.0]);
        raw.window_widths = vec![400.0, 1500.0];
        raw.window_centers = vec![40.0, -600.0];
        let slice = validate(raw).unwrap();
        assert_eq!(slice.declared_window, Some((400.0, 40.0)));
    }

    #[test]
    fn batch_aggregates_failures_without_aborting() {
        let good = RawSlice::monochrome(2, 2, vec![0.0; 4]);
        let bad = RawSlice::monochrome(2, 2, Vec::new());
        let (slices, summary) = ingest_batch(vec![good.clone(), bad, good]);
        assert_eq!(slices.len(), 2);
        assert_eq!(summary.loaded, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.failures[0].0, 1);
    }
}
