//! Live time gaps between competitors from streamed distance/time samples.

pub mod config;
pub mod delta;
pub mod error;
pub mod retention;
pub mod session;
pub mod store;
pub mod types;

pub use config::DeltaConfig;
pub use error::{DeltaError, Result};
pub use retention::{RetentionReport, RetentionWorker, WorkerState};
pub use session::Session;
pub use store::SampleStore;
pub use types::{Admission, CompetitorId, DistanceBucket, ElapsedMillis, Sample, SampleMap, Series, StoreStats};
