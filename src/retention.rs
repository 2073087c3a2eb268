use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{DeltaError, Result};
use crate::store::SampleStore;
use crate::types::{CompetitorId, DistanceBucket, SampleMap, Series};

/// Buckets a pass would remove, smallest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Buckets shared by every competitor before pruning.
    pub common: usize,
    pub drop: Vec<DistanceBucket>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub common_before: usize,
    pub pruned: Vec<DistanceBucket>,
    /// False when the store was reset while the pass was planning.
    pub committed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
}

struct Flight {
    state: WorkerState,
    /// Distinguishes passes started before a `reset` from later ones.
    epoch: u64,
}

fn validate(map: &SampleMap) -> Result<()> {
    for (competitor, series) in map {
        if series.is_empty() {
            return Err(DeltaError::InvalidState(format!(
                "competitor {} has an empty series",
                competitor
            )));
        }
        if let Some((bucket, time)) = series.iter().find(|(_, t)| !t.is_finite()) {
            return Err(DeltaError::InvalidState(format!(
                "competitor {} has non-numeric time {} at bucket {}",
                competitor, time, bucket
            )));
        }
    }
    Ok(())
}

/// Works out which buckets to remove so that at most `target` common buckets
/// remain. Fails without side effects if any series is malformed.
pub fn plan_retention(map: &SampleMap, target: usize) -> Result<RetentionPlan> {
    validate(map)?;

    let all: Vec<&Series> = map.values().collect();
    let common: Vec<DistanceBucket> = match all.split_first() {
        None => Vec::new(),
        Some((first, rest)) => first
            .keys()
            .filter(|bucket| rest.iter().all(|s| s.contains_key(*bucket)))
            .copied()
            .collect(),
    };

    let excess = common.len().saturating_sub(target);
    Ok(RetentionPlan {
        common: common.len(),
        drop: common[..excess].to_vec(),
    })
}

/// Returns `map` pruned down to `target` common buckets.
pub fn retain_common(mut map: SampleMap, target: usize) -> Result<SampleMap> {
    let plan = plan_retention(&map, target)?;
    for series in map.values_mut() {
        for bucket in &plan.drop {
            series.remove(bucket);
        }
    }
    Ok(map)
}

fn run_pass(store: &SampleStore) -> Result<RetentionReport> {
    let (snapshot, generation) = store.snapshot();
    let plan = plan_retention(&snapshot, store.config().retention_target())?;

    let competitors: Vec<CompetitorId> = snapshot.keys().copied().collect();
    let committed =
        plan.drop.is_empty() || store.commit_pruned(generation, &competitors, &plan.drop);
    if committed {
        tracing::debug!(
            common = plan.common,
            pruned = plan.drop.len(),
            "retention pass committed"
        );
    } else {
        tracing::debug!("store was reset during retention pass; result discarded");
    }

    Ok(RetentionReport {
        common_before: plan.common,
        pruned: plan.drop,
        committed,
    })
}

/// Single-flight scheduler for retention passes.
///
/// A pass keeps the `points_per_average * averages_per_to_catch` newest
/// buckets shared by every competitor and drops older shared ones; buckets
/// only some competitors hold are never touched. Planning runs on a snapshot
/// outside the lock and the result is committed in one write. Nothing times a
/// pass out, so a pass that never finishes leaves the store growing.
pub struct RetentionWorker {
    flight: Arc<Mutex<Flight>>,
    runtime: Option<Handle>,
}

impl RetentionWorker {
    /// Without a runtime, `trigger` never schedules anything and passes only
    /// run through `run_now`.
    pub fn new(runtime: Option<Handle>) -> Self {
        Self {
            flight: Arc::new(Mutex::new(Flight {
                state: WorkerState::Idle,
                epoch: 0,
            })),
            runtime,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.flight.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn has_runtime(&self) -> bool {
        self.runtime.is_some()
    }

    fn begin(&self) -> Option<u64> {
        let mut flight = self.flight.lock();
        if flight.state == WorkerState::Running {
            return None;
        }
        flight.state = WorkerState::Running;
        Some(flight.epoch)
    }

    fn finish(flight: &Mutex<Flight>, epoch: u64) {
        let mut flight = flight.lock();
        if flight.epoch == epoch {
            flight.state = WorkerState::Idle;
        }
    }

    /// Starts a background pass unless one is already running. Fire and
    /// forget is fine; the handle only exposes the outcome.
    pub fn trigger(
        &self,
        store: &Arc<SampleStore>,
    ) -> Option<JoinHandle<Result<RetentionReport>>> {
        let runtime = self.runtime.as_ref()?;
        let epoch = self.begin()?;

        let flight = Arc::clone(&self.flight);
        let store = Arc::clone(store);
        Some(runtime.spawn_blocking(move || {
            let result = run_pass(&store);
            if let Err(e) = &result {
                tracing::warn!("retention pass failed, store left unchanged: {}", e);
            }
            Self::finish(&flight, epoch);
            result
        }))
    }

    /// Runs a pass on the calling thread. `Ok(None)` if a background pass is
    /// already in flight.
    pub fn run_now(&self, store: &SampleStore) -> Result<Option<RetentionReport>> {
        let Some(epoch) = self.begin() else {
            return Ok(None);
        };
        let result = run_pass(store);
        Self::finish(&self.flight, epoch);
        result.map(Some)
    }

    /// Forgets any in-flight pass. Its result is dropped by the store's
    /// generation check and it will not flip this worker back to idle.
    pub fn reset(&self) {
        let mut flight = self.flight.lock();
        flight.state = WorkerState::Idle;
        flight.epoch = flight.epoch.wrapping_add(1);
    }
}
