/// Canonical orthogonal viewing plane.
///
/// Oblique planes are a documented extension point: a variant carrying a
/// plane normal and origin would slot into
/// [`reconstruct_plane`](crate::mpr::reconstruct_plane) without touching
/// the cache key layout. Only the three canonical planes are implemented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

/// Volume axis, in storage order (depth, rows, cols).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    Depth,
    Rows,
    Cols,
}

/// Reduction applied across a projection slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProjectionMode {
    Max,
    Min,
    Average,
}

/// Resampling method for plane reconstruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
}

/// Photometric interpretation of the stored samples: whether raw magnitude
/// correlates directly (`Monochrome2`) or inversely (`Monochrome1`) with
/// display brightness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Polarity {
    Monochrome1,
    #[default]
    Monochrome2,
}

impl Polarity {
    /// Whether the source declares inverted polarity.
    pub fn is_inverted(self) -> bool {
        matches!(self, Polarity::Monochrome1)
    }
}
