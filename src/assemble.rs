use std::cmp::Ordering;

use ndarray::{Array3, s};

use crate::error::AssembleError;
use crate::ingest::Slice;
use crate::series::Series;
use crate::volume::Volume;

/// Spacing deltas deviating more than this fraction from the median are
/// reported as irregular.
const IRREGULAR_SPACING_TOLERANCE: f32 = 0.10;

/// Component of the patient-space position with the greatest spread across
/// the series. Slices of an axial CT stack vary almost only in z; the
/// dominant axis recovers the stacking direction without trusting any
/// orientation metadata.
fn dominant_axis(slices: &[Slice]) -> usize {
    let mut spread = [0.0f32; 3];
    for axis in 0..3 {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for slice in slices {
            min = min.min(slice.position[axis]);
            max = max.max(slice.position[axis]);
        }
        spread[axis] = if max >= min { max - min } else { 0.0 };
    }
    spread
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(axis, _)| axis)
        .unwrap_or(2)
}

/// Ordering comparator for two slices: an explicit instance number is
/// authoritative; position projected on the dominant axis breaks ties;
/// equal keys fall through to the stable sort's input order.
fn sort_key(a: &Slice, b: &Slice, axis: usize) -> Ordering {
    if let (Some(na), Some(nb)) = (a.instance_number, b.instance_number) {
        if na != nb {
            return na.cmp(&nb);
        }
    }
    a.position[axis]
        .partial_cmp(&b.position[axis])
        .unwrap_or(Ordering::Equal)
}

/// Median of consecutive position deltas along the dominant axis, used as
/// the inter-slice pitch when the source declares none. Returns 1.0 for
/// stacks too short to measure.
fn median_slice_spacing(ordered: &[&Slice], axis: usize) -> f32 {
    let mut deltas: Vec<f32> = ordered
        .windows(2)
        .map(|pair| (pair[1].position[axis] - pair[0].position[axis]).abs())
        .filter(|d| *d > 0.0)
        .collect();
    if deltas.is_empty() {
        return 1.0;
    }
    deltas.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let median = deltas[deltas.len() / 2];

    let irregular = deltas
        .iter()
        .any(|d| (d - median).abs() > median * IRREGULAR_SPACING_TOLERANCE);
    if irregular {
        log::warn!("irregular inter-slice spacing (median {median} mm); volume may be distorted");
    }
    median
}

/// Build the voxel grid for a series.
///
/// Slices are ordered by [`sort_key`], stacked along the depth axis, and
/// copied into an exclusively-owned `Array3<f32>` of raw values. Irregular
/// spacing is a warning, not a failure.
pub fn assemble(series: &Series) -> Result<Volume, AssembleError> {
    let slices = series.slices();
    if slices.is_empty() {
        return Err(AssembleError::NoValidSlices);
    }

    let first_dim = (slices[0].rows(), slices[0].cols());
    if slices
        .iter()
        .any(|slice| (slice.rows(), slice.cols()) != first_dim)
    {
        return Err(AssembleError::InconsistentDimensions);
    }

    let axis = dominant_axis(slices);
    let mut ordered: Vec<&Slice> = slices.iter().collect();
    ordered.sort_by(|a, b| sort_key(a, b, axis));

    let (rows, cols) = first_dim;
    let depth = ordered.len();
    let mut data = Array3::<f32>::zeros((depth, rows, cols));
    for (i, slice) in ordered.iter().enumerate() {
        data.slice_mut(s![i, .., ..]).assign(&slice.samples);
    }

    let (row_mm, col_mm) = ordered[0].pixel_spacing;
    let slice_mm = median_slice_spacing(&ordered, axis);
    let calibration = ordered[0].calibration;

    log::info!(
        "{}: assembled {depth}x{rows}x{cols} volume, spacing ({slice_mm}, {row_mm}, {col_mm}) mm",
        series.id
    );

    Ok(Volume::new(
        data,
        (slice_mm, row_mm, col_mm),
        calibration,
        series.revision(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{RawSlice, validate};
    use crate::series::SeriesId;

    fn slice(instance: Option<i32>, z: f32, fill: f32) -> Slice {
        let mut raw = RawSlice::monochrome(2, 2, vec![fill; 4]);
        raw.instance_number = instance;
        raw.position = [0.0, 0.0, z];
        validate(raw).unwrap()
    }

    fn series_of(slices: Vec<Slice>) -> Series {
        let mut series = Series::new(SeriesId(7), "CT");
        series.add_slices(slices);
        series
    }

    #[test]
    fn empty_series_fails() {
        let series = Series::new(SeriesId(7), "CT");
        assert!(matches!(assemble(&series), Err(AssembleError::NoValidSlices)));
    }

    #[test]
    fn inconsistent_dimensions_fail() {
        let odd = validate(RawSlice::monochrome(3, 3, vec![0.0; 9])).unwrap();
        let series = series_of(vec![slice(Some(1), 0.0, 0.0), odd]);
        assert!(matches!(
            assemble(&series),
            Err(AssembleError::InconsistentDimensions)
        ));
    }

    #[test]
    fn reverse_input_order_yields_identical_volume() {
        let forward = series_of(vec![
            slice(Some(1), 0.0, 10.0),
            slice(Some(2), 2.0, 20.0),
            slice(Some(3), 4.0, 30.0),
        ]);
        let reverse = series_of(vec![
            slice(Some(3), 4.0, 30.0),
            slice(Some(2), 2.0, 20.0),
            slice(Some(1), 0.0, 10.0),
        ]);

        let a = assemble(&forward).unwrap();
        let b = assemble(&reverse).unwrap();
        assert_eq!(a.data(), b.data());
        assert_eq!(a.spacing(), b.spacing());
    }

    #[test]
    fn instance_number_overrides_position() {
        // Positions disagree with instance numbers; the explicit index wins.
        let series = series_of(vec![
            slice(Some(2), 0.0, 20.0),
            slice(Some(1), 5.0, 10.0),
        ]);
        let volume = assemble(&series).unwrap();
        assert_eq!(volume.data()[[0, 0, 0]], 10.0);
        assert_eq!(volume.data()[[1, 0, 0]], 20.0);
    }

    #[test]
    fn missing_instance_numbers_fall_back_to_position() {
        let series = series_of(vec![
            slice(None, 6.0, 30.0),
            slice(None, 2.0, 10.0),
            slice(None, 4.0, 20.0),
        ]);
        let volume = assemble(&series).unwrap();
        assert_eq!(volume.data()[[0, 0, 0]], 10.0);
        assert_eq!(volume.data()[[2, 0, 0]], 30.0);
        // Consecutive deltas are 2.0, so the median pitch is 2.0.
        assert_eq!(volume.spacing().0, 2.0);
    }

    #[test]
    fn single_slice_defaults_to_unit_spacing() {
        let series = series_of(vec![slice(Some(1), 0.0, 1.0)]);
        let volume = assemble(&series).unwrap();
        assert_eq!(volume.spacing().0, 1.0);
    }
}
