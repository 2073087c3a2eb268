use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Car/driver index, stable for the whole session.
pub type CompetitorId = u32;

/// Quantized position on track: `floor(raw_distance / distance_interval)`.
pub type DistanceBucket = i64;

/// Total session time in milliseconds (not lap time).
pub type ElapsedMillis = f64;

/// One competitor's samples, ordered by bucket.
pub type Series = BTreeMap<DistanceBucket, ElapsedMillis>;

/// Every competitor's series.
pub type SampleMap = HashMap<CompetitorId, Series>;

/// Raw progress reading as delivered by the telemetry source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub driver: CompetitorId,
    pub distance: f64,
    pub time: ElapsedMillis,
}

/// Result of feeding one sample to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stored (or overwrote) the time at this bucket.
    Admitted(DistanceBucket),
    /// Distance fell outside the tolerance around the interval; nothing stored.
    Rejected,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub admitted: u64,
    pub rejected: u64,
    pub competitors: usize,
}
