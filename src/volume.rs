use ndarray::{Array3, ArrayView2, s};

use crate::enums::Orientation;
use crate::ingest::Calibration;

/// Derived, read-only 3D voxel grid built from a series.
///
/// Axis order is (depth, rows, cols). The grid exclusively owns its voxel
/// storage; slices are read-only inputs that were copied in exactly once at
/// assembly. Stored values are *raw*: calibration is applied on read and
/// never written back, so display parameters can never corrupt the data.
#[derive(Debug)]
pub struct Volume {
    data: Array3<f32>,
    /// Voxel pitch in millimetres, matching axis order: (inter-slice, row, col).
    spacing: (f32, f32, f32),
    calibration: Calibration,
    /// Revision of the owning series at assembly time.
    revision: u64,
}

impl Volume {
    pub fn new(
        data: Array3<f32>,
        spacing: (f32, f32, f32),
        calibration: Calibration,
        revision: u64,
    ) -> Self {
        Self {
            data,
            spacing,
            calibration,
            revision,
        }
    }

    /// Grid dimensions (depth, rows, cols).
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[inline]
    pub fn calibrated(&self, raw: f32) -> f32 {
        self.calibration.apply(raw)
    }

    /// Calibrated voxel value at (depth, row, col).
    #[inline]
    pub fn calibrated_at(&self, z: usize, y: usize, x: usize) -> f32 {
        self.calibration.apply(self.data[[z, y, x]])
    }

    /// Extent along the axis a plane of the given orientation indexes into.
    pub fn plane_extent(&self, orientation: Orientation) -> usize {
        let dim = self.data.dim();
        match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        }
    }

    /// Raw 2D view of the grid along a canonical plane, or `None` when the
    /// index is out of range.
    pub fn slice_view(&self, index: usize, orientation: Orientation) -> Option<ArrayView2<'_, f32>> {
        if index >= self.plane_extent(orientation) {
            return None;
        }
        let view = match orientation {
            Orientation::Axial => self.data.slice(s![index, .., ..]),
            Orientation::Coronal => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal => self.data.slice(s![.., .., index]),
        };
        Some(view)
    }

    /// Grid dimensions rescaled to isotropic display spacing. Each axis is
    /// scaled independently by its own pitch so anisotropic voxels come out
    /// with correct aspect ratios.
    pub fn isotropic_dim(&self) -> (u32, u32, u32) {
        let (z_mm, y_mm, x_mm) = self.spacing;
        let (depth, rows, cols) = self.data.dim();
        let min_mm = z_mm.min(y_mm).min(x_mm).max(f32::EPSILON);

        let new_z = ((depth as f32 * z_mm / min_mm) as u32).max(1);
        let new_y = ((rows as f32 * y_mm / min_mm) as u32).max(1);
        let new_x = ((cols as f32 * x_mm / min_mm) as u32).max(1);
        (new_z, new_y, new_x)
    }

    /// Output raster size (width, height) for a reconstructed plane, in
    /// isotropic display pixels.
    pub fn plane_output_dim(&self, orientation: Orientation) -> (u32, u32) {
        let (iso_z, iso_y, iso_x) = self.isotropic_dim();
        match orientation {
            // Looking down the depth axis: cols wide, rows high.
            Orientation::Axial => (iso_x, iso_y),
            // Looking down the row axis: cols wide, depth high.
            Orientation::Coronal => (iso_x, iso_z),
            // Looking down the col axis: rows wide, depth high.
            Orientation::Sagittal => (iso_y, iso_z),
        }
    }

    /// Real-world centroid of the grid in millimetres, relative to the
    /// first voxel. Surface meshes are centered here.
    pub fn centroid_mm(&self) -> [f32; 3] {
        let (depth, rows, cols) = self.data.dim();
        let (z_mm, y_mm, x_mm) = self.spacing;
        [
            (depth as f32 - 1.0) * z_mm / 2.0,
            (rows as f32 - 1.0) * y_mm / 2.0,
            (cols as f32 - 1.0) * x_mm / 2.0,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn test_volume() -> Volume {
        let data = Array3::from_shape_fn((4, 8, 16), |(z, y, x)| (z + y + x) as f32);
        Volume::new(data, (2.0, 1.0, 1.0), Calibration::default(), 0)
    }

    #[test]
    fn slice_views_match_orientation_extents() {
        let volume = test_volume();
        assert_eq!(volume.slice_view(0, Orientation::Axial).unwrap().dim(), (8, 16));
        assert_eq!(volume.slice_view(0, Orientation::Coronal).unwrap().dim(), (4, 16));
        assert_eq!(volume.slice_view(0, Orientation::Sagittal).unwrap().dim(), (4, 8));
        assert!(volume.slice_view(4, Orientation::Axial).is_none());
    }

    #[test]
    fn anisotropic_spacing_scales_output_dims() {
        let volume = test_volume();
        // Depth pitch is twice the in-plane pitch, so depth doubles.
        assert_eq!(volume.isotropic_dim(), (8, 8, 16));
        assert_eq!(volume.plane_output_dim(Orientation::Axial), (16, 8));
        assert_eq!(volume.plane_output_dim(Orientation::Coronal), (16, 8));
        assert_eq!(volume.plane_output_dim(Orientation::Sagittal), (8, 8));
    }

    #[test]
    fn centroid_reflects_spacing() {
        let volume = test_volume();
        assert_eq!(volume.centroid_mm(), [3.0, 3.5, 7.5]);
    }
}
