//! Clustered light culling: the frustum grid, light assignment, lookup and the per-frame
//! synchronisation around them.

pub mod assign;
pub mod backend;
pub mod frustum;
pub mod gpu;
pub mod grid;
pub mod lights;
pub mod lookup;
pub mod metrics;
pub mod sync;

pub use assign::{assign_lights, ClusterLightList};
pub use backend::{AssignmentTask, ComputeBackend, CpuBackend, TaskHandle};
pub use frustum::{build_frustums, build_frustums_into, ClusterFrustum, ClusterProjection, FrustumGrid, Plane};
pub use gpu::WgpuBackend;
pub use grid::{ClusterCoord, GridDims};
pub use lights::{scatter_lights, Light, LightTable, PointLight, SpotLight};
pub use lookup::{ClusterLights, ClusterLookup};
pub use metrics::{ClusterMetrics, FrameRecord, FrameReport};
pub use sync::{FrameStage, FrameSyncStats, FrameSynchronizer, ShadingFrame};
