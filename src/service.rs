use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};

use crate::assemble::assemble;
use crate::cache::{CacheKey, CacheValue, RenderCache};
use crate::enums::{Axis, Interpolation, Orientation, ProjectionMode};
use crate::error::ComputeError;
use crate::export::{self, MeshFormat};
use crate::ingest::{self, Calibration, LoadSummary, RawSlice};
use crate::mpr::reconstruct_plane;
use crate::projection::project;
use crate::series::{Series, SeriesId};
use crate::surface::{
    CancellationFlag, DEFAULT_TIME_BUDGET, Mesh, MeshStatus, SurfaceParams, extract_surface,
};
use crate::volume::Volume;
use crate::window::{Frame, WindowState, apply_polarity, initial_window, window_frame};

/// Outcome of a bone-mesh request. Extraction runs off the interactive
/// path; callers poll and receive a progress fraction until the mesh (or
/// the explicit empty verdict) is ready.
#[derive(Clone, Debug)]
pub enum MeshResponse {
    Ready(Arc<Mesh>),
    Processing { progress: f32 },
    Empty,
}

// Key variants and value variants are paired by construction, so these
// never fire on a well-formed cache.
fn frame_of(value: CacheValue) -> Arc<Frame> {
    match value {
        CacheValue::Frame(frame) => frame,
        CacheValue::Mesh(_) => unreachable!("frame-keyed cache entry holds a mesh"),
    }
}

fn mesh_of(value: CacheValue) -> Arc<Mesh> {
    match value {
        CacheValue::Mesh(mesh) => mesh,
        CacheValue::Frame(_) => unreachable!("mesh-keyed cache entry holds a frame"),
    }
}

struct SeriesEntry {
    series: Series,
    /// Built lazily; dropped whenever the slice set changes.
    volume: Option<Arc<Volume>>,
}

enum MeshJob {
    Running {
        progress: watch::Receiver<f32>,
        cancel: CancellationFlag,
    },
    /// Terminal extraction failure, held until the next poll surfaces it.
    Failed(ComputeError),
}

/// In-process serving facade consumed by the viewer layer.
///
/// Owns the series registry, the lazily assembled volumes, and the render
/// cache. Every getter is an independent, stateless unit of work; the cache
/// is the only shared mutable resource, and it coalesces duplicate
/// requests. Cheap to clone and share across request handlers.
#[derive(Clone)]
pub struct RenderService {
    registry: Arc<Mutex<HashMap<SeriesId, SeriesEntry>>>,
    cache: Arc<RenderCache>,
    jobs: Arc<Mutex<HashMap<CacheKey, MeshJob>>>,
    surface_budget: Duration,
}

impl Default for RenderService {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderService {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            cache: Arc::new(RenderCache::default()),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            surface_budget: DEFAULT_TIME_BUDGET,
        }
    }

    /// Replace the iso-surface extraction time budget (default 30 s).
    pub fn with_surface_budget(mut self, budget: Duration) -> Self {
        self.surface_budget = budget;
        self
    }

    /// Register an empty series. A no-op when the id is already known.
    pub async fn register_series(&self, id: SeriesId, modality: impl Into<String>) {
        self.registry
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| SeriesEntry {
                series: Series::new(id, modality),
                volume: None,
            });
    }

    /// Ingest a batch of raw descriptors into a series. Per-slice failures
    /// are aggregated in the summary, never fatal. Any change to the slice
    /// set drops the derived volume and flushes that series' cache entries.
    pub async fn add_slices(
        &self,
        id: SeriesId,
        raws: Vec<RawSlice>,
    ) -> Result<LoadSummary, ComputeError> {
        let (added, summary) = {
            let mut registry = self.registry.lock().await;
            let entry = registry.get_mut(&id).ok_or(ComputeError::UnknownSeries)?;
            let (slices, summary) = ingest::ingest_batch(raws);
            let added = entry.series.add_slices(slices);
            if added > 0 {
                entry.volume = None;
            }
            (added, summary)
        };
        if added > 0 {
            self.cache.invalidate_series(id).await;
        }
        Ok(summary)
    }

    /// The lazily assembled volume for a series, rebuilt when the slice
    /// set has changed since the last build.
    async fn volume(&self, id: SeriesId) -> Result<Arc<Volume>, ComputeError> {
        let mut registry = self.registry.lock().await;
        let entry = registry.get_mut(&id).ok_or(ComputeError::UnknownSeries)?;

        if let Some(volume) = &entry.volume {
            if volume.revision() == entry.series.revision() {
                return Ok(Arc::clone(volume));
            }
        }
        let volume = Arc::new(assemble(&entry.series)?);
        entry.volume = Some(Arc::clone(&volume));
        Ok(volume)
    }

    /// The window a series opens with: source-declared, or estimated from
    /// the representative slice.
    pub async fn initial_window(&self, id: SeriesId) -> Result<WindowState, ComputeError> {
        let registry = self.registry.lock().await;
        let entry = registry.get(&id).ok_or(ComputeError::UnknownSeries)?;
        Ok(initial_window(&entry.series))
    }

    /// The window a frame is rendered with: the caller's (falling back to
    /// the initial window), with the series' declared photometric polarity
    /// composed into the invert flag by XOR. The composed flag feeds the
    /// cache key, so toggling polarity is a distinct entry.
    async fn effective_window(
        &self,
        id: SeriesId,
        user: Option<WindowState>,
    ) -> Result<WindowState, ComputeError> {
        let registry = self.registry.lock().await;
        let entry = registry.get(&id).ok_or(ComputeError::UnknownSeries)?;
        let mut window = user.unwrap_or_else(|| initial_window(&entry.series));
        let declared = entry
            .series
            .representative_slice()
            .map(|slice| slice.polarity)
            .unwrap_or_default();
        window.invert = apply_polarity(declared, window.invert);
        Ok(window)
    }

    /// Windowed 2D frame of one stored slice. `window` falls back to the
    /// series' initial window. Identical parameters return byte-identical
    /// (cached) output.
    pub async fn get_display_frame(
        &self,
        id: SeriesId,
        index: usize,
        window: Option<WindowState>,
    ) -> Result<Arc<Frame>, ComputeError> {
        let window = self.effective_window(id, window).await?;
        let volume = self.volume(id).await?;
        let key = CacheKey::display(id, volume.revision(), index, &window);

        let value = self
            .cache
            .get_or_compute(key, || async move {
                let view = volume.slice_view(index, Orientation::Axial).ok_or(
                    ComputeError::IndexOutOfBounds {
                        index,
                        extent: volume.dim().0,
                    },
                )?;
                let frame = window_frame(view, &window, volume.calibration());
                Ok(CacheValue::Frame(Arc::new(frame)))
            })
            .await?;
        Ok(frame_of(value))
    }

    /// Orthogonal MPR frame, windowed with the series' initial window and
    /// declared polarity.
    pub async fn get_mpr_frame(
        &self,
        id: SeriesId,
        orientation: Orientation,
        position: usize,
        interpolation: Interpolation,
    ) -> Result<Arc<Frame>, ComputeError> {
        let window = self.effective_window(id, None).await?;
        let volume = self.volume(id).await?;
        let key = CacheKey::Mpr {
            series: id,
            revision: volume.revision(),
            orientation,
            position,
            interpolation,
        };

        let value = self
            .cache
            .get_or_compute(key, || async move {
                let plane = reconstruct_plane(&volume, orientation, position, interpolation)?;
                // Plane values are already calibrated; window with the
                // identity transform.
                let frame = window_frame(plane.view(), &window, Calibration::default());
                Ok(CacheValue::Frame(Arc::new(frame)))
            })
            .await?;
        Ok(frame_of(value))
    }

    /// Slab intensity projection, windowed with the series' initial window
    /// and declared polarity.
    pub async fn get_projection_frame(
        &self,
        id: SeriesId,
        axis: Axis,
        slab_start: usize,
        slab_thickness: isize,
        mode: ProjectionMode,
    ) -> Result<Arc<Frame>, ComputeError> {
        let window = self.effective_window(id, None).await?;
        let volume = self.volume(id).await?;
        let key = CacheKey::Projection {
            series: id,
            revision: volume.revision(),
            axis,
            slab_start,
            slab_thickness,
            mode,
        };

        let value = self
            .cache
            .get_or_compute(key, || async move {
                let plane = project(&volume, axis, slab_start, slab_thickness, mode)?;
                let frame = window_frame(plane.view(), &window, Calibration::default());
                Ok(CacheValue::Frame(Arc::new(frame)))
            })
            .await?;
        Ok(frame_of(value))
    }

    /// Poll for the bone-surface mesh at a threshold.
    ///
    /// The first call kicks off extraction on a background task and
    /// returns `Processing`; subsequent calls report progress until the
    /// result lands in the cache. A terminal failure (e.g. an exhausted
    /// time budget) is surfaced by the next poll exactly once; polling
    /// again after that starts a fresh extraction, which is the retry
    /// path. An abandoned request is never an error: the caller just stops
    /// polling (or cancels via [`cancel_bone_mesh`], in which case the
    /// aborted result is discarded, not stored).
    ///
    /// [`cancel_bone_mesh`]: RenderService::cancel_bone_mesh
    pub async fn get_bone_mesh(
        &self,
        id: SeriesId,
        threshold: f32,
        smooth: bool,
    ) -> Result<MeshResponse, ComputeError> {
        let volume = self.volume(id).await?;
        let key = CacheKey::mesh(id, volume.revision(), threshold, smooth);

        if let Some(value) = self.cache.peek(key).await {
            let mesh = mesh_of(value);
            return Ok(match mesh.status {
                MeshStatus::Empty => MeshResponse::Empty,
                MeshStatus::Ready => MeshResponse::Ready(mesh),
            });
        }

        let mut jobs = self.jobs.lock().await;
        match jobs.remove(&key) {
            Some(MeshJob::Running { progress, cancel }) => {
                let response = MeshResponse::Processing {
                    progress: *progress.borrow(),
                };
                jobs.insert(key, MeshJob::Running { progress, cancel });
                return Ok(response);
            }
            // Surface a terminal failure exactly once; the poll after it
            // starts a fresh extraction, which is the retry path.
            Some(MeshJob::Failed(err)) => return Err(err),
            None => {}
        }

        let (progress_tx, progress_rx) = watch::channel(0.0f32);
        let cancel = CancellationFlag::new();
        jobs.insert(
            key,
            MeshJob::Running {
                progress: progress_rx,
                cancel: cancel.clone(),
            },
        );
        drop(jobs);

        let cache = Arc::clone(&self.cache);
        let jobs = Arc::clone(&self.jobs);
        let budget = self.surface_budget;
        tokio::spawn(async move {
            let result = cache
                .get_or_compute(key, || async move {
                    let mut params = SurfaceParams::new(threshold, smooth);
                    params.time_budget = budget;
                    let mesh = tokio::task::spawn_blocking(move || {
                        extract_surface(&volume, params, Some(&progress_tx), Some(&cancel))
                    })
                    .await
                    .map_err(|_| ComputeError::Cancelled)??;
                    Ok(CacheValue::Mesh(Arc::new(mesh)))
                })
                .await;

            let mut jobs = jobs.lock().await;
            match result {
                Ok(_) => {
                    jobs.remove(&key);
                }
                // The caller asked for the cancellation; it is not a
                // failure worth reporting back.
                Err(ComputeError::Cancelled) => {
                    jobs.remove(&key);
                }
                Err(err) => {
                    log::debug!("bone mesh extraction for {key:?} failed: {err}");
                    jobs.insert(key, MeshJob::Failed(err));
                }
            }
        });

        Ok(MeshResponse::Processing { progress: 0.0 })
    }

    /// Abort an in-flight mesh extraction. The partial result is dropped,
    /// not cached; harmless when no extraction is running.
    pub async fn cancel_bone_mesh(&self, id: SeriesId, threshold: f32, smooth: bool) {
        let Ok(volume) = self.volume(id).await else {
            return;
        };
        let key = CacheKey::mesh(id, volume.revision(), threshold, smooth);
        if let Some(MeshJob::Running { cancel, .. }) = self.jobs.lock().await.get(&key) {
            cancel.cancel();
        }
    }

    /// Serialize the bone mesh at a threshold, computing it synchronously
    /// first if it is not cached yet.
    pub async fn export_mesh(
        &self,
        id: SeriesId,
        threshold: f32,
        smooth: bool,
        format: MeshFormat,
    ) -> Result<Vec<u8>, ComputeError> {
        let volume = self.volume(id).await?;
        let key = CacheKey::mesh(id, volume.revision(), threshold, smooth);

        let budget = self.surface_budget;
        let value = self
            .cache
            .get_or_compute(key, || async move {
                let mut params = SurfaceParams::new(threshold, smooth);
                params.time_budget = budget;
                let mesh =
                    tokio::task::spawn_blocking(move || extract_surface(&volume, params, None, None))
                        .await
                        .map_err(|_| ComputeError::Cancelled)??;
                Ok(CacheValue::Mesh(Arc::new(mesh)))
            })
            .await?;
        let mesh = mesh_of(value);
        Ok(export::export_mesh(&mesh, format))
    }
}
