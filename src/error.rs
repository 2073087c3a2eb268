use crate::types::CompetitorId;

#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("competitor {0} has no samples")]
    UnknownCompetitor(CompetitorId),

    #[error("invalid store state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DeltaError>;

/// Rejects NaN and infinities, the only malformed values a `f64` can carry.
pub(crate) fn ensure_finite(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DeltaError::InvalidArgument(format!(
            "{} must be a finite number, got {}",
            name, value
        )))
    }
}
