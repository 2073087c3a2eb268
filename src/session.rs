use std::sync::Arc;
use tokio::runtime::Handle;

use crate::config::DeltaConfig;
use crate::delta;
use crate::error::Result;
use crate::retention::{RetentionReport, RetentionWorker};
use crate::store::SampleStore;
use crate::types::{Admission, CompetitorId, DistanceBucket, ElapsedMillis, Series, StoreStats};

/// One live session: the sample store plus its retention worker.
///
/// Everything a telemetry feed or a timing screen needs goes through here;
/// there is no process-wide state, so independent sessions can coexist.
pub struct Session {
    store: Arc<SampleStore>,
    worker: RetentionWorker,
}

impl Session {
    /// Attaches to the current tokio runtime if there is one. Outside a
    /// runtime, retention only happens through [`Session::run_retention`].
    pub fn new(config: DeltaConfig) -> Result<Self> {
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            tracing::debug!("no tokio runtime; background retention disabled");
        }
        Self::build(config, runtime)
    }

    /// Schedules background passes on `runtime`, for callers that hold a
    /// handle to a runtime they are not currently running inside.
    pub fn with_runtime(config: DeltaConfig, runtime: Handle) -> Result<Self> {
        Self::build(config, Some(runtime))
    }

    fn build(config: DeltaConfig, runtime: Option<Handle>) -> Result<Self> {
        Ok(Self {
            store: Arc::new(SampleStore::new(config)?),
            worker: RetentionWorker::new(runtime),
        })
    }

    pub fn config(&self) -> &DeltaConfig {
        self.store.config()
    }

    pub fn store(&self) -> &Arc<SampleStore> {
        &self.store
    }

    pub fn worker(&self) -> &RetentionWorker {
        &self.worker
    }

    /// Records a sample and, if it was kept and no pass is running, schedules
    /// a retention pass without waiting for it.
    pub fn ingest(
        &self,
        competitor: CompetitorId,
        raw_distance: f64,
        elapsed_ms: ElapsedMillis,
    ) -> Result<Admission> {
        let admission = self.store.ingest(competitor, raw_distance, elapsed_ms)?;
        if admission.is_admitted() {
            let _ = self.worker.trigger(&self.store);
        }
        Ok(admission)
    }

    pub fn has_competitor(&self, competitor: CompetitorId) -> bool {
        self.store.has_competitor(competitor)
    }

    pub fn competitors(&self) -> Vec<CompetitorId> {
        self.store.competitors()
    }

    pub fn series(&self, competitor: CompetitorId) -> Option<Series> {
        self.store.series(competitor)
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Clears every series and abandons any in-flight retention pass.
    pub fn reset(&self) {
        self.worker.reset();
        self.store.reset();
    }

    /// Runs a retention pass on the calling thread; `Ok(None)` if a
    /// background pass is already in flight.
    pub fn run_retention(&self) -> Result<Option<RetentionReport>> {
        self.worker.run_now(&self.store)
    }

    pub fn common_distances(&self, a: CompetitorId, b: CompetitorId) -> Result<Vec<DistanceBucket>> {
        delta::common_distances(&self.store, a, b)
    }

    pub fn windowed_delta_average(&self, a: CompetitorId, b: CompetitorId, group_index: i64) -> Result<f64> {
        delta::windowed_delta_average(&self.store, a, b, group_index)
    }

    pub fn delta_between(&self, a: CompetitorId, b: CompetitorId) -> Result<f64> {
        delta::delta_between(&self.store, a, b)
    }

    pub fn to_catch_lap_based(
        &self,
        ahead: CompetitorId,
        behind: CompetitorId,
        last_lap_ahead: f64,
        last_lap_behind: f64,
    ) -> Result<f64> {
        delta::to_catch_lap_based(&self.store, ahead, behind, last_lap_ahead, last_lap_behind)
    }

    pub fn to_catch_real_time(
        &self,
        ahead: CompetitorId,
        behind: CompetitorId,
        average_lap_distance: f64,
    ) -> Result<f64> {
        delta::to_catch_real_time(&self.store, ahead, behind, average_lap_distance)
    }
}
