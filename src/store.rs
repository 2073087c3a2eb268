use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::DeltaConfig;
use crate::error::{ensure_finite, Result};
use crate::types::{Admission, CompetitorId, DistanceBucket, ElapsedMillis, SampleMap, Series, StoreStats};

pub(crate) struct Inner {
    pub(crate) series: SampleMap,
    /// Bumped by `reset`; a retention pass planned against an older
    /// generation is dropped instead of committed.
    pub(crate) generation: u64,
}

/// The session's shared sample series. Writers take the write lock for one
/// map update; readers hold the read lock for a whole query, so a retention
/// commit is seen entirely or not at all.
pub struct SampleStore {
    config: DeltaConfig,
    inner: RwLock<Inner>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl SampleStore {
    pub fn new(config: DeltaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: RwLock::new(Inner {
                series: SampleMap::new(),
                generation: 0,
            }),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Builds a store around existing series. Empty series are dropped so that
    /// presence keeps meaning "has at least one sample". Values are not
    /// checked here; a retention pass refuses a store holding non-finite times.
    pub fn with_series(config: DeltaConfig, mut series: SampleMap) -> Result<Self> {
        let store = Self::new(config)?;
        series.retain(|_, s| !s.is_empty());
        store.inner.write().series = series;
        Ok(store)
    }

    pub fn config(&self) -> &DeltaConfig {
        &self.config
    }

    /// Maps a raw distance to its bucket, or `None` when the reading is too far
    /// past the last interval boundary to be comparable with other cars.
    pub fn bucket_for(&self, raw_distance: f64) -> Option<DistanceBucket> {
        let interval = self.config.distance_interval;
        if raw_distance % interval > self.config.distance_upper_bound {
            return None;
        }
        Some((raw_distance / interval).floor() as DistanceBucket)
    }

    /// Records one sample. `elapsed_ms` must be total session time, otherwise
    /// deltas across lap boundaries are meaningless.
    pub fn ingest(
        &self,
        competitor: CompetitorId,
        raw_distance: f64,
        elapsed_ms: ElapsedMillis,
    ) -> Result<Admission> {
        ensure_finite("distance", raw_distance)?;
        ensure_finite("time", elapsed_ms)?;

        let Some(bucket) = self.bucket_for(raw_distance) else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(competitor, raw_distance, "sample outside distance tolerance");
            return Ok(Admission::Rejected);
        };

        self.inner
            .write()
            .series
            .entry(competitor)
            .or_default()
            .insert(bucket, elapsed_ms);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(Admission::Admitted(bucket))
    }

    pub fn has_competitor(&self, competitor: CompetitorId) -> bool {
        self.inner.read().series.contains_key(&competitor)
    }

    /// Known competitors in ascending id order.
    pub fn competitors(&self) -> Vec<CompetitorId> {
        let mut ids: Vec<CompetitorId> = self.inner.read().series.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn series(&self, competitor: CompetitorId) -> Option<Series> {
        self.inner.read().series.get(&competitor).cloned()
    }

    /// Clones every series along with the generation it was taken at.
    pub fn snapshot(&self) -> (SampleMap, u64) {
        let inner = self.inner.read();
        (inner.series.clone(), inner.generation)
    }

    /// Runs `f` against a consistent view of all series.
    pub fn read<R>(&self, f: impl FnOnce(&SampleMap) -> R) -> R {
        f(&self.inner.read().series)
    }

    /// Drops `buckets` from the series of `competitors` in one write, unless
    /// the store was reset after `generation` was observed. Competitors that
    /// joined after the snapshot are left alone, and no competitor is ever
    /// removed here. Returns whether it applied.
    pub(crate) fn commit_pruned(
        &self,
        generation: u64,
        competitors: &[CompetitorId],
        buckets: &[DistanceBucket],
    ) -> bool {
        let mut inner = self.inner.write();
        if inner.generation != generation {
            return false;
        }
        for competitor in competitors {
            let Some(series) = inner.series.get_mut(competitor) else {
                continue;
            };
            for bucket in buckets {
                series.remove(bucket);
            }
        }
        true
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.series.clear();
        inner.generation = inner.generation.wrapping_add(1);
        self.admitted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            competitors: self.inner.read().series.len(),
        }
    }
}
