use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::enums::{Interpolation, Orientation};
use crate::error::ComputeError;
use crate::volume::Volume;

/// Bilinear sample of a raw 2D view at fractional (y, x). Coordinates are
/// assumed pre-clamped to the view extent.
#[inline]
fn bilinear(view: &ArrayView2<'_, f32>, y: f32, x: f32) -> f32 {
    let (height, width) = view.dim();

    let y0 = y.floor() as usize;
    let x0 = x.floor() as usize;
    let y1 = (y0 + 1).min(height - 1);
    let x1 = (x0 + 1).min(width - 1);

    let dy = y - y0 as f32;
    let dx = x - x0 as f32;

    let v00 = view[[y0, x0]];
    let v01 = view[[y0, x1]];
    let v10 = view[[y1, x0]];
    let v11 = view[[y1, x1]];

    let top = v00.mul_add(1.0 - dx, v01 * dx);
    let bottom = v10.mul_add(1.0 - dx, v11 * dx);
    top.mul_add(1.0 - dy, bottom * dy)
}

/// Resample the volume along a canonical orthogonal plane.
///
/// The output raster is scaled per-axis to isotropic display spacing before
/// resampling, so anisotropic voxels (thick slices, fine in-plane pitch)
/// come out with correct aspect ratios. Returns *calibrated* values; the
/// caller windows them for display.
pub fn reconstruct_plane(
    volume: &Volume,
    orientation: Orientation,
    position: usize,
    interpolation: Interpolation,
) -> Result<Array2<f32>, ComputeError> {
    let view = volume
        .slice_view(position, orientation)
        .ok_or(ComputeError::IndexOutOfBounds {
            index: position,
            extent: volume.plane_extent(orientation),
        })?;

    let (src_height, src_width) = view.dim();
    let (out_width, out_height) = volume.plane_output_dim(orientation);
    let (out_width, out_height) = (out_width as usize, out_height as usize);

    // Already at display spacing: a straight calibrated copy.
    if (out_height, out_width) == (src_height, src_width) {
        return Ok(view.map(|&raw| volume.calibrated(raw)));
    }

    let values: Vec<f32> = (0..out_height)
        .into_par_iter()
        .flat_map(|y| {
            (0..out_width)
                .map(|x| {
                    // Normalized coordinates with half-pixel offset, mapped
                    // back into the source plane and clamped to its edges.
                    let norm_x = (x as f32 + 0.5) / out_width as f32;
                    let norm_y = (y as f32 + 0.5) / out_height as f32;
                    let src_x = (norm_x * src_width as f32 - 0.5)
                        .clamp(0.0, (src_width - 1) as f32);
                    let src_y = (norm_y * src_height as f32 - 0.5)
                        .clamp(0.0, (src_height - 1) as f32);

                    let raw = match interpolation {
                        Interpolation::Nearest => {
                            view[[src_y.round() as usize, src_x.round() as usize]]
                        }
                        Interpolation::Linear => bilinear(&view, src_y, src_x),
                    };
                    volume.calibrated(raw)
                })
                .collect::<Vec<f32>>()
        })
        .collect();

    Array2::from_shape_vec((out_height, out_width), values).map_err(|_| {
        ComputeError::IndexOutOfBounds {
            index: position,
            extent: volume.plane_extent(orientation),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Calibration;
    use ndarray::Array3;

    fn volume(spacing: (f32, f32, f32), intercept: f32) -> Volume {
        let data = Array3::from_shape_fn((4, 4, 4), |(z, y, x)| (z * 16 + y * 4 + x) as f32);
        Volume::new(
            data,
            spacing,
            Calibration {
                slope: 1.0,
                intercept,
            },
            0,
        )
    }

    #[test]
    fn out_of_range_position_is_an_error() {
        let v = volume((1.0, 1.0, 1.0), 0.0);
        let err = reconstruct_plane(&v, Orientation::Axial, 4, Interpolation::Linear).unwrap_err();
        assert_eq!(err, ComputeError::IndexOutOfBounds { index: 4, extent: 4 });
    }

    #[test]
    fn isotropic_axial_plane_is_a_calibrated_copy() {
        let v = volume((1.0, 1.0, 1.0), -1000.0);
        let plane = reconstruct_plane(&v, Orientation::Axial, 1, Interpolation::Nearest).unwrap();
        assert_eq!(plane.dim(), (4, 4));
        assert_eq!(plane[[0, 0]], 16.0 - 1000.0);
        assert_eq!(plane[[3, 3]], 31.0 - 1000.0);
    }

    #[test]
    fn anisotropic_coronal_plane_is_stretched() {
        // Inter-slice pitch twice the in-plane pitch: depth axis doubles.
        let v = volume((2.0, 1.0, 1.0), 0.0);
        let plane = reconstruct_plane(&v, Orientation::Coronal, 0, Interpolation::Linear).unwrap();
        assert_eq!(plane.dim(), (8, 4));
    }

    #[test]
    fn nearest_and_linear_agree_on_grid_points() {
        let v = volume((2.0, 1.0, 1.0), 0.0);
        let nearest =
            reconstruct_plane(&v, Orientation::Sagittal, 2, Interpolation::Nearest).unwrap();
        let linear =
            reconstruct_plane(&v, Orientation::Sagittal, 2, Interpolation::Linear).unwrap();
        assert_eq!(nearest.dim(), linear.dim());
        // Corners land exactly on source voxels under the half-pixel map.
        let (h, w) = nearest.dim();
        assert_eq!(nearest[[0, 0]], linear[[0, 0]]);
        assert_eq!(nearest[[h - 1, w - 1]], linear[[h - 1, w - 1]]);
    }
}
