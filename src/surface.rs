use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use web_time::Instant;

use crate::error::ComputeError;
use crate::mc_tables::{EDGE_TABLE, TRI_TABLE};
use crate::volume::Volume;

/// Default extraction time budget.
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(30);

/// Generation parameters for a surface mesh. The mesh is a pure function of
/// (volume, parameters), which is what makes it safe to memoize.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceParams {
    /// Iso-level in calibrated units (e.g. 200 HU for bone).
    pub threshold: f32,
    /// Run the Laplacian smoothing post-pass.
    pub smooth: bool,
    /// Abort with a recoverable timeout once extraction exceeds this.
    pub time_budget: Duration,
}

impl SurfaceParams {
    pub fn new(threshold: f32, smooth: bool) -> Self {
        Self {
            threshold,
            smooth,
            time_budget: DEFAULT_TIME_BUDGET,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshStatus {
    Ready,
    /// No voxel crossed the threshold; the mesh is legitimately empty.
    Empty,
}

/// Summary statistics reported alongside the mesh.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshStats {
    pub vertex_count: usize,
    pub face_count: usize,
    /// Axis-aligned bounds in millimetres, `(min, max)`, zero for an empty
    /// mesh.
    pub bounds_mm: ([f32; 3], [f32; 3]),
}

/// Triangulated iso-surface. Vertex positions are in millimetres, centered
/// at the volume centroid.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
    pub params: SurfaceParams,
    pub status: MeshStatus,
    pub stats: MeshStats,
}

impl Mesh {
    pub fn empty(params: SurfaceParams) -> Self {
        Self {
            vertices: Vec::new(),
            faces: Vec::new(),
            params,
            status: MeshStatus::Empty,
            stats: MeshStats {
                vertex_count: 0,
                face_count: 0,
                bounds_mm: ([0.0; 3], [0.0; 3]),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

/// Shared cancellation handle. A caller that navigates away flips the flag;
/// the extraction notices at the next layer boundary and bails out without
/// surfacing a result.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cube corner offsets in (x, y, z) order, matching the table convention.
const CORNERS: [(usize, usize, usize); 8] = [
    (0, 0, 0),
    (1, 0, 0),
    (1, 1, 0),
    (0, 1, 0),
    (0, 0, 1),
    (1, 0, 1),
    (1, 1, 1),
    (0, 1, 1),
];

/// Corner pairs joined by each of the 12 cell edges.
const EDGE_CORNERS: [(usize, usize); 12] = [
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 0),
    (4, 5),
    (5, 6),
    (6, 7),
    (7, 4),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

/// Canonical lattice key for a cell edge: (axis, x, y, z) of the lattice
/// edge it lies on, so vertices shared between neighbouring cells dedupe.
fn edge_key(edge: usize, x: usize, y: usize, z: usize) -> (u8, usize, usize, usize) {
    match edge {
        0 => (0, x, y, z),
        1 => (1, x + 1, y, z),
        2 => (0, x, y + 1, z),
        3 => (1, x, y, z),
        4 => (0, x, y, z + 1),
        5 => (1, x + 1, y, z + 1),
        6 => (0, x, y + 1, z + 1),
        7 => (1, x, y, z + 1),
        8 => (2, x, y, z),
        9 => (2, x + 1, y, z),
        10 => (2, x + 1, y + 1, z),
        _ => (2, x, y + 1, z),
    }
}

/// Extract a triangulated iso-surface from the calibrated scalar field.
///
/// Marching cubes per cell layer: corner occupancy selects the edge and
/// triangle configuration, vertices land on cell edges by linear
/// interpolation of the field crossing, and shared edge vertices are
/// deduplicated across cells. Progress (fraction of layers done) is
/// published through `progress` after every layer; cancellation and the
/// time budget are also checked per layer, so a runaway request never
/// blocks its caller indefinitely.
///
/// An all-below-threshold field yields an explicit empty mesh, not an
/// error. So does a grid shorter than two voxels along any axis, whatever
/// its values: such a grid has no cells to march and cannot bound a
/// surface. Smoothing, when requested, runs as a separate post-process
/// over the finished mesh.
pub fn extract_surface(
    volume: &Volume,
    params: SurfaceParams,
    progress: Option<&watch::Sender<f32>>,
    cancel: Option<&CancellationFlag>,
) -> Result<Mesh, ComputeError> {
    let (depth, rows, cols) = volume.dim();
    if depth < 2 || rows < 2 || cols < 2 {
        return Ok(Mesh::empty(params));
    }

    let started = Instant::now();
    let (z_mm, y_mm, x_mm) = volume.spacing();
    let centroid = volume.centroid_mm();

    let mut vertices: Vec<[f32; 3]> = Vec::new();
    let mut faces: Vec<[u32; 3]> = Vec::new();
    let mut edge_vertices: HashMap<(u8, usize, usize, usize), u32> = HashMap::new();

    let layer_count = depth - 1;
    for z in 0..layer_count {
        if started.elapsed() > params.time_budget {
            return Err(ComputeError::Timeout {
                budget: params.time_budget,
            });
        }
        if cancel.is_some_and(CancellationFlag::is_cancelled) {
            return Err(ComputeError::Cancelled);
        }

        for y in 0..rows - 1 {
            for x in 0..cols - 1 {
                let mut corner_values = [0.0f32; 8];
                let mut cube_index = 0usize;
                for (i, &(cx, cy, cz)) in CORNERS.iter().enumerate() {
                    let value = volume.calibrated_at(z + cz, y + cy, x + cx);
                    corner_values[i] = value;
                    if value < params.threshold {
                        cube_index |= 1 << i;
                    }
                }

                let crossed_edges = EDGE_TABLE[cube_index];
                if crossed_edges == 0 {
                    continue;
                }

                let mut cell_vertices = [0u32; 12];
                for edge in 0..12 {
                    if crossed_edges & (1 << edge) == 0 {
                        continue;
                    }
                    let key = edge_key(edge, x, y, z);
                    let index = *edge_vertices.entry(key).or_insert_with(|| {
                        let (a, b) = EDGE_CORNERS[edge];
                        let (va, vb) = (corner_values[a], corner_values[b]);
                        let t = if (vb - va).abs() > f32::EPSILON {
                            ((params.threshold - va) / (vb - va)).clamp(0.0, 1.0)
                        } else {
                            0.5
                        };

                        let (ax, ay, az) = CORNERS[a];
                        let (bx, by, bz) = CORNERS[b];
                        let px = (x + ax) as f32 + t * (bx as f32 - ax as f32);
                        let py = (y + ay) as f32 + t * (by as f32 - ay as f32);
                        let pz = (z + az) as f32 + t * (bz as f32 - az as f32);

                        let index = vertices.len() as u32;
                        vertices.push([
                            px * x_mm - centroid[2],
                            py * y_mm - centroid[1],
                            pz * z_mm - centroid[0],
                        ]);
                        index
                    });
                    cell_vertices[edge] = index;
                }

                let triangles = &TRI_TABLE[cube_index];
                let mut i = 0;
                while triangles[i] >= 0 {
                    faces.push([
                        cell_vertices[triangles[i] as usize],
                        cell_vertices[triangles[i + 1] as usize],
                        cell_vertices[triangles[i + 2] as usize],
                    ]);
                    i += 3;
                }
            }
        }

        if let Some(sender) = progress {
            let _ = sender.send((z + 1) as f32 / layer_count as f32);
        }
    }

    if faces.is_empty() {
        return Ok(Mesh::empty(params));
    }

    if params.smooth {
        smooth_laplacian(&mut vertices, &faces, 2, 0.5);
    }

    let stats = MeshStats {
        vertex_count: vertices.len(),
        face_count: faces.len(),
        bounds_mm: bounds(&vertices),
    };
    log::debug!(
        "extracted surface at {}: {} vertices, {} faces",
        params.threshold,
        stats.vertex_count,
        stats.face_count
    );

    Ok(Mesh {
        vertices,
        faces,
        params,
        status: MeshStatus::Ready,
        stats,
    })
}

fn bounds(vertices: &[[f32; 3]]) -> ([f32; 3], [f32; 3]) {
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];
    for vertex in vertices {
        for axis in 0..3 {
            min[axis] = min[axis].min(vertex[axis]);
            max[axis] = max[axis].max(vertex[axis]);
        }
    }
    (min, max)
}

/// In-place Laplacian smoothing: each vertex moves a fraction `lambda`
/// toward the average of its face neighbours, `iterations` times. Kept
/// separate from generation so smoothed and raw meshes are distinct cache
/// entries of the same pure pipeline.
fn smooth_laplacian(vertices: &mut [[f32; 3]], faces: &[[u32; 3]], iterations: usize, lambda: f32) {
    let mut adjacency: Vec<Vec<u32>> = vec![Vec::new(); vertices.len()];
    for face in faces {
        for i in 0..3 {
            let a = face[i] as usize;
            let b = face[(i + 1) % 3];
            if !adjacency[a].contains(&b) {
                adjacency[a].push(b);
            }
            let b = b as usize;
            let a = face[i];
            if !adjacency[b].contains(&a) {
                adjacency[b].push(a);
            }
        }
    }

    for _ in 0..iterations {
        let snapshot: Vec<[f32; 3]> = vertices.to_vec();
        for (index, neighbours) in adjacency.iter().enumerate() {
            if neighbours.is_empty() {
                continue;
            }
            let mut mean = [0.0f32; 3];
            for &neighbour in neighbours {
                let p = snapshot[neighbour as usize];
                mean[0] += p[0];
                mean[1] += p[1];
                mean[2] += p[2];
            }
            let n = neighbours.len() as f32;
            for axis in 0..3 {
                let current = snapshot[index][axis];
                vertices[index][axis] = current + lambda * (mean[axis] / n - current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Calibration;
    use ndarray::Array3;

    fn volume_from(data: Array3<f32>) -> Volume {
        Volume::new(data, (1.0, 1.0, 1.0), Calibration::default(), 0)
    }

    #[test]
    fn all_below_threshold_yields_explicit_empty_mesh() {
        let volume = volume_from(Array3::zeros((8, 8, 8)));
        let mesh = extract_surface(&volume, SurfaceParams::new(1.0, false), None, None).unwrap();
        assert_eq!(mesh.status, MeshStatus::Empty);
        assert_eq!(mesh.stats.vertex_count, 0);
        assert_eq!(mesh.stats.face_count, 0);
    }

    #[test]
    fn degenerate_grid_cannot_bound_a_surface() {
        // A single-slice stack has no cells to march, even above threshold.
        let volume = volume_from(Array3::from_elem((1, 8, 8), 1000.0));
        let mesh = extract_surface(&volume, SurfaceParams::new(500.0, false), None, None).unwrap();
        assert_eq!(mesh.status, MeshStatus::Empty);
    }

    #[test]
    fn single_bright_voxel_produces_a_closed_surface() {
        let mut data = Array3::zeros((5, 5, 5));
        data[[2, 2, 2]] = 1000.0;
        let volume = volume_from(data);
        let mesh = extract_surface(&volume, SurfaceParams::new(500.0, false), None, None).unwrap();

        assert_eq!(mesh.status, MeshStatus::Ready);
        assert!(!mesh.is_empty());
        // One interior voxel: the surface is a small octahedron-like shell,
        // with every face index pointing at a real vertex.
        for face in &mesh.faces {
            for &index in face {
                assert!((index as usize) < mesh.vertices.len());
            }
        }
        // Closed surface around a single voxel: V - E + F = 2 holds with
        // shared (deduplicated) edge vertices.
        assert_eq!(mesh.stats.vertex_count, 6);
        assert_eq!(mesh.stats.face_count, 8);
    }

    #[test]
    fn vertices_are_centered_at_the_volume_centroid() {
        let mut data = Array3::zeros((5, 5, 5));
        data[[2, 2, 2]] = 1000.0;
        let volume = volume_from(data);
        let mesh = extract_surface(&volume, SurfaceParams::new(500.0, false), None, None).unwrap();

        // The bright voxel sits exactly at the centroid, so the shell
        // straddles the origin.
        let (min, max) = mesh.stats.bounds_mm;
        for axis in 0..3 {
            assert!(min[axis] < 0.0 && max[axis] > 0.0);
            assert!((min[axis] + max[axis]).abs() < 1e-4);
        }
    }

    #[test]
    fn smoothing_preserves_topology() {
        let mut data = Array3::zeros((6, 6, 6));
        for z in 2..4 {
            for y in 2..4 {
                for x in 2..4 {
                    data[[z, y, x]] = 1000.0;
                }
            }
        }
        let volume = volume_from(data);
        let raw = extract_surface(&volume, SurfaceParams::new(500.0, false), None, None).unwrap();
        let smoothed = extract_surface(&volume, SurfaceParams::new(500.0, true), None, None).unwrap();

        assert_eq!(raw.stats.vertex_count, smoothed.stats.vertex_count);
        assert_eq!(raw.stats.face_count, smoothed.stats.face_count);
        assert_ne!(raw.vertices, smoothed.vertices);
    }

    #[test]
    fn exhausted_time_budget_is_a_recoverable_timeout() {
        let mut data = Array3::zeros((32, 32, 32));
        data[[16, 16, 16]] = 1000.0;
        let volume = volume_from(data);
        let mut params = SurfaceParams::new(500.0, false);
        params.time_budget = Duration::ZERO;

        let err = extract_surface(&volume, params, None, None).unwrap_err();
        assert!(matches!(err, ComputeError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn cancellation_aborts_between_layers() {
        let mut data = Array3::zeros((8, 8, 8));
        data[[4, 4, 4]] = 1000.0;
        let volume = volume_from(data);
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let err = extract_surface(
            &volume,
            SurfaceParams::new(500.0, false),
            None,
            Some(&cancel),
        )
        .unwrap_err();
        assert_eq!(err, ComputeError::Cancelled);
    }

    #[test]
    fn progress_reaches_completion() {
        let mut data = Array3::zeros((8, 8, 8));
        data[[4, 4, 4]] = 1000.0;
        let volume = volume_from(data);
        let (sender, receiver) = watch::channel(0.0f32);

        extract_surface(&volume, SurfaceParams::new(500.0, false), Some(&sender), None).unwrap();
        assert_eq!(*receiver.borrow(), 1.0);
    }
}
