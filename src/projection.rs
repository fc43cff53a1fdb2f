use ndarray::{Array2, ArrayView2, Axis as NdAxis, Zip};

use crate::enums::{Axis, ProjectionMode};
use crate::error::ComputeError;
use crate::volume::Volume;

fn axis_extent(volume: &Volume, axis: Axis) -> usize {
    let (depth, rows, cols) = volume.dim();
    match axis {
        Axis::Depth => depth,
        Axis::Rows => rows,
        Axis::Cols => cols,
    }
}

fn lane(volume: &Volume, axis: Axis, index: usize) -> ArrayView2<'_, f32> {
    let nd_axis = match axis {
        Axis::Depth => NdAxis(0),
        Axis::Rows => NdAxis(1),
        Axis::Cols => NdAxis(2),
    };
    volume.data().index_axis(nd_axis, index)
}

/// Reduce a slab of the volume along an axis.
///
/// The slab `[slab_start, slab_start + slab_thickness)` is clamped to the
/// volume extent; a thickness of zero or less degenerates to a single-slice
/// identity projection. Returns calibrated values.
pub fn project(
    volume: &Volume,
    axis: Axis,
    slab_start: usize,
    slab_thickness: isize,
    mode: ProjectionMode,
) -> Result<Array2<f32>, ComputeError> {
    let extent = axis_extent(volume, axis);
    if slab_start >= extent {
        return Err(ComputeError::IndexOutOfBounds {
            index: slab_start,
            extent,
        });
    }

    let thickness = slab_thickness.max(1) as usize;
    let slab_end = (slab_start + thickness).min(extent);
    let slab_len = slab_end - slab_start;

    let mut acc = lane(volume, axis, slab_start).to_owned();
    for index in slab_start + 1..slab_end {
        let view = lane(volume, axis, index);
        match mode {
            ProjectionMode::Max => {
                Zip::from(&mut acc).and(&view).par_for_each(|a, &v| *a = a.max(v));
            }
            ProjectionMode::Min => {
                Zip::from(&mut acc).and(&view).par_for_each(|a, &v| *a = a.min(v));
            }
            ProjectionMode::Average => {
                Zip::from(&mut acc).and(&view).par_for_each(|a, &v| *a += v);
            }
        }
    }

    if matches!(mode, ProjectionMode::Average) && slab_len > 1 {
        acc.mapv_inplace(|v| v / slab_len as f32);
    }

    Ok(acc.mapv(|raw| volume.calibrated(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Calibration;
    use ndarray::Array3;
    use rstest::rstest;

    fn volume() -> Volume {
        // Voxel value equals its depth index, so projections along depth
        // are easy to predict.
        let data = Array3::from_shape_fn((4, 2, 2), |(z, _, _)| z as f32 * 10.0);
        Volume::new(data, (1.0, 1.0, 1.0), Calibration::default(), 0)
    }

    #[rstest]
    #[case(ProjectionMode::Max, 30.0)]
    #[case(ProjectionMode::Min, 0.0)]
    #[case(ProjectionMode::Average, 15.0)]
    fn full_depth_slab_reduces(#[case] mode: ProjectionMode, #[case] expected: f32) {
        let projected = project(&volume(), Axis::Depth, 0, 4, mode).unwrap();
        assert_eq!(projected.dim(), (2, 2));
        assert_eq!(projected[[0, 0]], expected);
    }

    #[test]
    fn thickness_is_clamped_to_extent() {
        let projected = project(&volume(), Axis::Depth, 2, 100, ProjectionMode::Max).unwrap();
        assert_eq!(projected[[1, 1]], 30.0);
    }

    #[test]
    fn non_positive_thickness_is_identity() {
        let projected = project(&volume(), Axis::Depth, 1, 0, ProjectionMode::Average).unwrap();
        assert_eq!(projected[[0, 0]], 10.0);
        let projected = project(&volume(), Axis::Depth, 1, -5, ProjectionMode::Max).unwrap();
        assert_eq!(projected[[0, 0]], 10.0);
    }

    #[test]
    fn slab_start_out_of_range_is_an_error() {
        let err = project(&volume(), Axis::Depth, 4, 1, ProjectionMode::Max).unwrap_err();
        assert_eq!(err, ComputeError::IndexOutOfBounds { index: 4, extent: 4 });
    }

    #[test]
    fn row_axis_projection_has_transposed_extents() {
        let projected = project(&volume(), Axis::Rows, 0, 2, ProjectionMode::Max).unwrap();
        assert_eq!(projected.dim(), (4, 2));
    }

    #[test]
    fn projection_output_is_calibrated() {
        let data = Array3::from_elem((2, 2, 2), 100.0);
        let v = Volume::new(
            data,
            (1.0, 1.0, 1.0),
            Calibration {
                slope: 2.0,
                intercept: -50.0,
            },
            0,
        );
        let projected = project(&v, Axis::Depth, 0, 2, ProjectionMode::Average).unwrap();
        assert_eq!(projected[[0, 0]], 150.0);
    }
}
