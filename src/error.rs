use thiserror::Error;

use crate::clusters::grid::GridDims;
use crate::clusters::sync::FrameStage;

/// Failures surfaced by the clustered lighting core.
///
/// Configuration and device errors are fatal for the caller: nothing here is
/// retried internally. Per-cluster capacity overflow is deliberately absent,
/// it is reported through metrics instead.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster grid dimensions must be non-zero, got {x}x{y}x{z}")]
    ZeroGridDimension { x: u32, y: u32, z: u32 },
    #[error("cluster grid {x}x{y}x{z} has more clusters than a u32 index can address")]
    GridTooLarge { x: u32, y: u32, z: u32 },
    #[error("{what} must be greater than zero")]
    ZeroCapacity { what: &'static str },
    #[error("{which} matrix contains non-finite values")]
    NonFiniteMatrix { which: &'static str },
    #[error("{which} matrix is not invertible")]
    SingularMatrix { which: &'static str },
    #[error("cluster ({x}, {y}, {z}) has a degenerate bounding plane")]
    DegenerateCluster { x: u32, y: u32, z: u32 },
    #[error("light index {index} is out of range for a table of {len} lights")]
    LightIndexOutOfRange { index: usize, len: usize },
    #[error("light list grid {list:?} does not match frustum grid {grid:?}")]
    GridMismatch { grid: GridDims, list: GridDims },
    #[error("invalid frame transition from {from:?} to {to:?}")]
    InvalidTransition { from: FrameStage, to: FrameStage },
    #[error("assignment dispatch {task} did not complete within {waited_ms} ms")]
    DispatchTimeout { task: u64, waited_ms: u128 },
    #[error("assignment dispatch {task} is still in flight")]
    DispatchInFlight { task: u64 },
    #[error("unknown assignment task {task}")]
    UnknownTask { task: u64 },
    #[error("readback holds {actual} words, expected {expected}")]
    ReadbackSize { expected: usize, actual: usize },
    #[error("cluster resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("GPU device error: {0}")]
    Device(String),
}

impl ClusterError {
    /// True for errors caused by invalid grid, capacity or camera input.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ClusterError::ZeroGridDimension { .. }
                | ClusterError::GridTooLarge { .. }
                | ClusterError::ZeroCapacity { .. }
                | ClusterError::NonFiniteMatrix { .. }
                | ClusterError::SingularMatrix { .. }
                | ClusterError::DegenerateCluster { .. }
        )
    }
}
