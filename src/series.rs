use crate::ingest::Slice;

/// Opaque series key. Assigned by the caller (typically the record store's
/// primary key); cheap to copy and hash, which the cache relies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesId(pub u64);

impl std::fmt::Display for SeriesId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "series#{}", self.0)
    }
}

/// Ordered, unique collection of validated slices from one acquisition.
///
/// Slices are value objects loaded once; the series never reaches back into
/// a record store. Every mutation of the slice set bumps `revision`, which
/// invalidates the derived [`Volume`](crate::volume::Volume) and every
/// cache entry keyed on it.
#[derive(Debug)]
pub struct Series {
    pub id: SeriesId,
    pub modality: String,
    slices: Vec<Slice>,
    revision: u64,
}

impl Series {
    pub fn new(id: SeriesId, modality: impl Into<String>) -> Self {
        Self {
            id,
            modality: modality.into(),
            slices: Vec::new(),
            revision: 0,
        }
    }

    /// Append validated slices, skipping exact duplicates (same instance
    /// number and position as an existing slice). Bumps the revision when
    /// anything was actually added.
    pub fn add_slices(&mut self, slices: Vec<Slice>) -> usize {
        let mut added = 0;
        for slice in slices {
            let duplicate = self.slices.iter().any(|existing| {
                existing.instance_number.is_some()
                    && existing.instance_number == slice.instance_number
                    && existing.position == slice.position
            });
            if duplicate {
                log::debug!("{}: dropped duplicate slice {:?}", self.id, slice.instance_number);
                continue;
            }
            self.slices.push(slice);
            added += 1;
        }
        if added > 0 {
            self.revision += 1;
        }
        added
    }

    /// Slices in input order. Assembly ordering is the assembler's job, not
    /// the collection's.
    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Monotonic counter identifying the current slice set.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The slice at the middle of the stack, used as the representative
    /// slice for window estimation.
    pub fn representative_slice(&self) -> Option<&Slice> {
        self.slices.get(self.slices.len() / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{RawSlice, validate};

    fn slice_at(instance: i32, z: f32) -> Slice {
        let mut raw = RawSlice::monochrome(2, 2, vec![0.0; 4]);
        raw.instance_number = Some(instance);
        raw.position = [0.0, 0.0, z];
        validate(raw).unwrap()
    }

    #[test]
    fn duplicates_are_dropped_and_revision_tracks_changes() {
        let mut series = Series::new(SeriesId(1), "CT");
        assert_eq!(series.revision(), 0);

        let added = series.add_slices(vec![slice_at(1, 0.0), slice_at(2, 1.0)]);
        assert_eq!(added, 2);
        assert_eq!(series.revision(), 1);

        // Same instance number and position: ignored, revision unchanged.
        let added = series.add_slices(vec![slice_at(1, 0.0)]);
        assert_eq!(added, 0);
        assert_eq!(series.len(), 2);
        assert_eq!(series.revision(), 1);

        let added = series.add_slices(vec![slice_at(3, 2.0)]);
        assert_eq!(added, 1);
        assert_eq!(series.revision(), 2);
    }
}
