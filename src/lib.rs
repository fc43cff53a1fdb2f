//! # reslice
//!
//! Rendering core for cross-sectional imaging series: ingest decoded 2D
//! slices, assemble them into a 3D voxel volume, and serve derived views
//! on demand.
//!
//! The pipeline is built from small pure stages:
//!  - ingestion validates raw slice descriptors into immutable slices
//!  - assembly orders a series and stacks it into a spatially calibrated
//!    volume
//!  - windowing maps calibrated values to 8-bit display frames
//!  - multi-planar reconstruction resamples axial, coronal and sagittal
//!    planes at isotropic display spacing
//!  - slab projection reduces a range of slices by max, min or average
//!    intensity
//!  - surface extraction triangulates an iso-surface (e.g. bone at 200 HU)
//!    with progress reporting and cancellation
//!  - export serializes meshes to STL and frames to PNG
//!
//! [`RenderService`] ties the stages together behind a coalescing LRU
//! cache, so identical requests are computed once and served from memory.
//!
//! # Examples
//!
//! Load a series and render the middle slice with its source-declared
//! window:
//!
//! ```no_run
//! # use reslice::{RawSlice, RenderService, SeriesId};
//! # async fn demo(raws: Vec<RawSlice>) -> Result<(), reslice::ComputeError> {
//! let service = RenderService::new();
//! service.register_series(SeriesId(1), "CT").await;
//!
//! let summary = service.add_slices(SeriesId(1), raws).await?;
//! let frame = service
//!     .get_display_frame(SeriesId(1), summary.loaded / 2, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod assemble;
pub mod cache;
pub mod enums;
pub mod error;
pub mod export;
pub mod ingest;
mod mc_tables;
pub mod mpr;
pub mod projection;
pub mod series;
pub mod service;
pub mod surface;
pub mod volume;
pub mod window;

pub use assemble::assemble;
pub use cache::{CacheKey, CacheValue, RenderCache};
pub use enums::{Axis, Interpolation, Orientation, Polarity, ProjectionMode};
pub use error::{AssembleError, ComputeError, IngestError};
pub use export::{MeshFormat, export_frame, export_mesh};
pub use ingest::{Calibration, LoadSummary, RawSlice, Slice};
pub use mpr::reconstruct_plane;
pub use projection::project;
pub use series::{Series, SeriesId};
pub use service::{MeshResponse, RenderService};
pub use surface::{CancellationFlag, Mesh, MeshStats, MeshStatus, SurfaceParams, extract_surface};
pub use volume::Volume;
pub use window::{Frame, WindowState, apply_window, initial_window, window_frame};
