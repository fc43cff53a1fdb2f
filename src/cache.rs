use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::enums::{Axis, Interpolation, Orientation, ProjectionMode};
use crate::error::ComputeError;
use crate::series::SeriesId;
use crate::surface::Mesh;
use crate::window::{Frame, WindowState};

/// Composite cache key. Every parameter that affects the rendered output is
/// part of the key, so any parameter change is a miss by construction.
/// Float parameters are keyed by their bit patterns to keep `Eq + Hash`
/// exact. The series revision is baked in, so entries from a rebuilt volume
/// can never be confused with current ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Display {
        series: SeriesId,
        revision: u64,
        index: usize,
        width_bits: u32,
        center_bits: u32,
        invert: bool,
    },
    Mpr {
        series: SeriesId,
        revision: u64,
        orientation: Orientation,
        position: usize,
        interpolation: Interpolation,
    },
    Projection {
        series: SeriesId,
        revision: u64,
        axis: Axis,
        slab_start: usize,
        slab_thickness: isize,
        mode: ProjectionMode,
    },
    Mesh {
        series: SeriesId,
        revision: u64,
        threshold_bits: u32,
        smooth: bool,
    },
}

impl CacheKey {
    pub fn display(series: SeriesId, revision: u64, index: usize, window: &WindowState) -> Self {
        CacheKey::Display {
            series,
            revision,
            index,
            width_bits: window.width.to_bits(),
            center_bits: window.center.to_bits(),
            invert: window.invert,
        }
    }

    pub fn mesh(series: SeriesId, revision: u64, threshold: f32, smooth: bool) -> Self {
        CacheKey::Mesh {
            series,
            revision,
            threshold_bits: threshold.to_bits(),
            smooth,
        }
    }

    pub fn series(&self) -> SeriesId {
        match self {
            CacheKey::Display { series, .. }
            | CacheKey::Mpr { series, .. }
            | CacheKey::Projection { series, .. }
            | CacheKey::Mesh { series, .. } => *series,
        }
    }
}

/// A memoized render product. Clones are cheap: the payload is shared.
#[derive(Clone, Debug)]
pub enum CacheValue {
    Frame(Arc<Frame>),
    Mesh(Arc<Mesh>),
}

impl CacheValue {
    pub fn as_frame(&self) -> Option<&Arc<Frame>> {
        match self {
            CacheValue::Frame(frame) => Some(frame),
            CacheValue::Mesh(_) => None,
        }
    }

    pub fn as_mesh(&self) -> Option<&Arc<Mesh>> {
        match self {
            CacheValue::Mesh(mesh) => Some(mesh),
            CacheValue::Frame(_) => None,
        }
    }
}

struct Entry {
    value: CacheValue,
    last_used: u64,
}

type InFlight = Arc<OnceCell<CacheValue>>;

struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    in_flight: HashMap<CacheKey, InFlight>,
    tick: u64,
}

/// Bounded memoization of rendered rasters and meshes.
///
/// Results are pure functions of their key, so a hit is always safe to
/// serve. Eviction is least-recently-used by entry count. Concurrent
/// requests for the same key are coalesced: the first caller's computation
/// runs, the rest await its cell. If the computing caller abandons the
/// request mid-flight, one of the waiters takes over the computation. A
/// failed computation is never stored, but its cell remains the rendezvous
/// point for the key until a computation succeeds.
pub struct RenderCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl Default for RenderCache {
    fn default() -> Self {
        Self::with_capacity(128)
    }
}

impl RenderCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Return the cached value for `key`, computing and storing it on a
    /// miss. At most one computation per key is in flight at a time.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> Result<CacheValue, ComputeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, ComputeError>>,
    {
        let cell = {
            let mut state = self.state.lock().await;
            state.tick += 1;
            let tick = state.tick;
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.last_used = tick;
                return Ok(entry.value.clone());
            }
            Arc::clone(state.in_flight.entry(key).or_default())
        };

        let result = cell.get_or_try_init(compute).await;

        match result {
            Ok(value) => {
                let value = value.clone();
                let mut state = self.state.lock().await;
                state.in_flight.remove(&key);
                state.tick += 1;
                let tick = state.tick;
                state.entries.entry(key).or_insert(Entry {
                    value: value.clone(),
                    last_used: tick,
                });
                self.evict_over_capacity(&mut state);
                Ok(value)
            }
            // The cell stays registered after a failure: waiters retrying
            // the init and callers arriving later keep sharing it, so at
            // most one computation per key holds on the failure path too.
            Err(err) => Err(err),
        }
    }

    /// Non-computing lookup: the cached value when present, touching its
    /// recency, without triggering or joining any computation.
    pub async fn peek(&self, key: CacheKey) -> Option<CacheValue> {
        let mut state = self.state.lock().await;
        state.tick += 1;
        let tick = state.tick;
        state.entries.get_mut(&key).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        })
    }

    fn evict_over_capacity(&self, state: &mut CacheState) {
        while state.entries.len() > self.capacity {
            let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key)
            else {
                break;
            };
            state.entries.remove(&oldest);
            log::debug!("evicted {oldest:?}");
        }
    }

    /// Drop every entry belonging to `series`. Called when the series'
    /// volume is rebuilt; in-flight computations for the old revision are
    /// left to finish and age out, since their revision-bearing keys can
    /// never match a request against the new volume.
    pub async fn invalidate_series(&self, series: SeriesId) {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|key, _| key.series() != series);
        state.in_flight.retain(|key, _| key.series() != series);
        log::debug!(
            "invalidated {} entries for {series}",
            before - state.entries.len()
        );
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn frame(tag: u8) -> CacheValue {
        CacheValue::Frame(Arc::new(Frame {
            width: 1,
            height: 1,
            pixels: vec![tag],
        }))
    }

    fn key(series: u64, index: usize) -> CacheKey {
        CacheKey::display(
            SeriesId(series),
            0,
            index,
            &WindowState::new(400.0, 40.0),
        )
    }

    #[tokio::test]
    async fn hit_returns_stored_value_without_recompute() {
        let cache = RenderCache::default();
        let computes = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_compute(key(1, 0), || async {
                    computes.fetch_add(1, Ordering::SeqCst);
                    Ok(frame(7))
                })
                .await
                .unwrap();
            assert_eq!(value.as_frame().unwrap().pixels, vec![7]);
        }
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_parameters_miss() {
        let cache = RenderCache::default();
        let computes = AtomicUsize::new(0);

        for index in 0..2 {
            let value = cache
                .get_or_compute(key(1, index), || async {
                    computes.fetch_add(1, Ordering::SeqCst);
                    Ok(frame(index as u8))
                })
                .await
                .unwrap();
            // Never a value computed for different parameters.
            assert_eq!(value.as_frame().unwrap().pixels, vec![index as u8]);
        }
        assert_eq!(computes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let cache = RenderCache::with_capacity(2);
        for index in 0..2 {
            cache
                .get_or_compute(key(1, index), || async { Ok(frame(0)) })
                .await
                .unwrap();
        }
        // Touch index 0 so index 1 becomes the eviction candidate.
        cache
            .get_or_compute(key(1, 0), || async { panic!("cached") })
            .await
            .unwrap();
        cache
            .get_or_compute(key(1, 2), || async { Ok(frame(0)) })
            .await
            .unwrap();

        let recomputed = AtomicUsize::new(0);
        cache
            .get_or_compute(key(1, 1), || async {
                recomputed.fetch_add(1, Ordering::SeqCst);
                Ok(frame(0))
            })
            .await
            .unwrap();
        assert_eq!(recomputed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_requests_coalesce() {
        let cache = Arc::new(RenderCache::default());
        let computes = Arc::new(AtomicUsize::new(0));
        let mesh_key = CacheKey::mesh(SeriesId(9), 0, 200.0, true);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(mesh_key, || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(frame(1))
                    })
                    .await
                    .unwrap()
            }));
        }

        let first = handles.pop().unwrap().await.unwrap();
        let second = handles.pop().unwrap().await.unwrap();
        assert_eq!(computes.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(
            first.as_frame().unwrap(),
            second.as_frame().unwrap()
        ));
    }

    #[tokio::test]
    async fn failed_compute_is_not_stored() {
        let cache = RenderCache::default();
        let key = key(1, 0);

        let err = cache
            .get_or_compute(key, || async {
                Err(ComputeError::Timeout {
                    budget: Duration::from_secs(1),
                })
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.is_empty().await);

        // A retry computes again and succeeds.
        let value = cache
            .get_or_compute(key, || async { Ok(frame(3)) })
            .await
            .unwrap();
        assert_eq!(value.as_frame().unwrap().pixels, vec![3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retries_after_a_failure_share_one_computation() {
        let cache = Arc::new(RenderCache::default());
        let key = key(1, 0);

        // The first caller fails slowly while a second waits on its cell.
        let first = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute(key, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(ComputeError::Cancelled)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let computes = Arc::new(AtomicUsize::new(0));
        let second = {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            tokio::spawn(async move {
                cache
                    .get_or_compute(key, || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(frame(5))
                    })
                    .await
            })
        };

        // A third caller arrives after the failure, while the waiter's
        // retry is still computing; it must join that retry, not start a
        // second computation.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let third = {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            tokio::spawn(async move {
                cache
                    .get_or_compute(key, || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        Ok(frame(9))
                    })
                    .await
            })
        };

        assert!(first.await.unwrap().is_err());
        let second = second.await.unwrap().unwrap();
        let third = third.await.unwrap().unwrap();
        assert_eq!(computes.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(
            second.as_frame().unwrap(),
            third.as_frame().unwrap()
        ));
    }

    #[tokio::test]
    async fn series_invalidation_drops_only_that_series() {
        let cache = RenderCache::default();
        cache
            .get_or_compute(key(1, 0), || async { Ok(frame(0)) })
            .await
            .unwrap();
        cache
            .get_or_compute(key(2, 0), || async { Ok(frame(0)) })
            .await
            .unwrap();

        cache.invalidate_series(SeriesId(1)).await;
        assert_eq!(cache.len().await, 1);

        let recomputed = AtomicUsize::new(0);
        cache
            .get_or_compute(key(1, 0), || async {
                recomputed.fetch_add(1, Ordering::SeqCst);
                Ok(frame(0))
            })
            .await
            .unwrap();
        assert_eq!(recomputed.load(Ordering::SeqCst), 1);
    }
}
