//! Error type of a single decision cycle.

use thiserror::Error;

use crate::api::VenueError;

/// Why a cycle did not complete.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Venue call failed; nothing was mutated and the loop keeps going.
    #[error("venue error: {0}")]
    Venue(#[from] VenueError),

    /// State could not be persisted; the process must stop.
    #[error("persistence error: {0:#}")]
    Persistence(anyhow::Error),
}

impl CycleError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CycleError::Persistence(_))
    }
}
