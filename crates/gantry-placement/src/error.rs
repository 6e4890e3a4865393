//! Placement errors.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// No online node satisfies the stated requirements. Callers must
    /// reject the request; there is no fallback node.
    #[error("no suitable node satisfies the placement requirements")]
    NoSuitableNode,
}

pub type PlacementResult<T> = Result<T, PlacementError>;
