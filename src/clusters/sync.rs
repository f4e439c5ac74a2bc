use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::assign::ClusterLightList;
use super::backend::{AssignmentTask, ComputeBackend, TaskHandle};
use super::frustum::{build_frustums, FrustumGrid};
use super::lights::{Light, LightTable};
use super::lookup::{ClusterLights, ClusterLookup};
use super::metrics::{ClusterMetrics, FrameRecord};
use crate::camera3d::{CameraSnapshot, SnapshotKey};
use crate::config::ClusterConfig;
use crate::error::ClusterError;

/// Where the current assignment epoch stands.
///
/// The cycle is `Idle -> FrustumBuilding -> AssignmentDispatched -> AssignmentComplete ->
/// ConsumedByShading -> Idle`; any other step is rejected with
/// [`ClusterError::InvalidTransition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameStage {
    Idle,
    FrustumBuilding,
    AssignmentDispatched,
    AssignmentComplete,
    ConsumedByShading,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSyncStats {
    pub frames: u64,
    pub frustum_rebuilds: u64,
    pub frustum_reuses: u64,
    /// Epochs that kept the previous lists because neither camera nor lights changed.
    pub assignment_reuses: u64,
    /// Epochs shaded with the previous lists because the dispatch did not finish in time.
    pub fallbacks: u64,
    pub timeouts: u64,
    pub stragglers_drained: u64,
}

#[derive(Debug)]
struct PublishedLists {
    frustums: Arc<FrustumGrid>,
    list: ClusterLightList,
}

#[derive(Clone, Copy, Debug)]
enum Assignment {
    Submitted(TaskHandle),
    Reused,
    Skipped { straggler: TaskHandle },
}

/// Drives one assignment epoch per frame over a [`ComputeBackend`].
///
/// The published cluster lists are only replaced in `complete`, and shading reads them through
/// a [`ShadingFrame`] that borrows the synchronizer mutably, so no writer can run while shading
/// holds the lists. A dispatch that misses `dispatch_timeout` is kept as a straggler and waited
/// for before the next submission; meanwhile the previous lists are shaded again as long as they
/// were assigned from the current light table.
pub struct FrameSynchronizer<B> {
    backend: B,
    config: ClusterConfig,
    dispatch_timeout: Duration,
    lights: LightTable,
    stage: FrameStage,
    epoch: u64,
    frustums: Option<(SnapshotKey, Arc<FrustumGrid>)>,
    frustums_rebuilt: bool,
    assignment: Option<Assignment>,
    straggler: Option<TaskHandle>,
    published: Option<PublishedLists>,
    fallback: bool,
    overflow_reported: bool,
    stats: FrameSyncStats,
}

impl<B: ComputeBackend> FrameSynchronizer<B> {
    pub fn new(backend: B, config: &ClusterConfig, dispatch_timeout: Duration) -> Result<Self, ClusterError> {
        config.validate()?;
        let lights = LightTable::new(config.light_capacity)?;
        Ok(Self {
            backend,
            config: *config,
            dispatch_timeout,
            lights,
            stage: FrameStage::Idle,
            epoch: 0,
            frustums: None,
            frustums_rebuilt: false,
            assignment: None,
            straggler: None,
            published: None,
            fallback: false,
            overflow_reported: false,
            stats: FrameSyncStats::default(),
        })
    }

    pub fn stage(&self) -> FrameStage {
        self.stage
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stats(&self) -> &FrameSyncStats {
        &self.stats
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn lights(&self) -> &LightTable {
        &self.lights
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn dispatch_timeout(&self) -> Duration {
        self.dispatch_timeout
    }

    /// True while a timed-out dispatch has not been drained yet.
    pub fn has_straggler(&self) -> bool {
        self.straggler.is_some()
    }

    /// The lists shading would read right now, if any epoch has completed.
    pub fn published_list(&self) -> Option<&ClusterLightList> {
        self.published.as_ref().map(|published| &published.list)
    }

    /// Replaces the light table. Only allowed between epochs.
    pub fn load_lights(&mut self, lights: impl IntoIterator<Item = Light>) -> Result<usize, ClusterError> {
        self.require_idle()?;
        Ok(self.lights.load(lights))
    }

    pub fn set_light(&mut self, index: usize, light: Light) -> Result<(), ClusterError> {
        self.require_idle()?;
        self.lights.set(index, light)
    }

    /// `Idle -> FrustumBuilding`. Rebuilds the frustum grid unless the quantised camera snapshot
    /// matches the cached one; returns whether a rebuild happened.
    pub fn begin_frame(&mut self, camera: &CameraSnapshot) -> Result<bool, ClusterError> {
        self.transition(FrameStage::Idle, FrameStage::FrustumBuilding)?;
        let key = camera.key();
        if matches!(&self.frustums, Some((cached, _)) if *cached == key) {
            self.frustums_rebuilt = false;
            self.stats.frustum_reuses += 1;
            return Ok(false);
        }
        match build_frustums(camera.view, camera.projection, self.config.grid_dimensions) {
            Ok(grid) => {
                log::debug!("Rebuilt {} cluster frustums for epoch {}", grid.frustums().len(), self.epoch);
                self.frustums = Some((key, Arc::new(grid)));
                self.frustums_rebuilt = true;
                self.stats.frustum_rebuilds += 1;
                Ok(true)
            }
            Err(err) => {
                self.stage = FrameStage::Idle;
                Err(err)
            }
        }
    }

    /// `FrustumBuilding -> AssignmentDispatched`. Drains a straggling dispatch first; if it is
    /// still running this epoch submits nothing and will fall back in `complete`.
    pub fn dispatch(&mut self) -> Result<(), ClusterError> {
        self.transition(FrameStage::FrustumBuilding, FrameStage::AssignmentDispatched)?;
        let frustums = match &self.frustums {
            Some((_, frustums)) => Arc::clone(frustums),
            None => {
                self.stage = FrameStage::Idle;
                return Err(ClusterError::InvalidTransition {
                    from: FrameStage::Idle,
                    to: FrameStage::AssignmentDispatched,
                });
            }
        };

        if let Some(straggler) = self.straggler.take() {
            match self.backend.wait(straggler, self.dispatch_timeout) {
                Ok(_) => {
                    self.stats.stragglers_drained += 1;
                    log::debug!("Drained straggling assignment dispatch {}", straggler.id());
                }
                Err(ClusterError::DispatchTimeout { .. }) => {
                    self.straggler = Some(straggler);
                    self.assignment = Some(Assignment::Skipped { straggler });
                    return Ok(());
                }
                Err(err) => log::warn!("Discarding failed assignment dispatch {}: {err}", straggler.id()),
            }
        }

        let revision = self.lights.revision();
        let unchanged = self.published.as_ref().is_some_and(|published| {
            Arc::ptr_eq(&published.frustums, &frustums) && published.list.light_revision() == revision
        });
        if unchanged {
            self.assignment = Some(Assignment::Reused);
            return Ok(());
        }

        let task = AssignmentTask {
            frustums,
            lights: self.lights.snapshot(),
            light_revision: revision,
            max_lights_per_cluster: self.config.max_lights_per_cluster,
        };
        match self.backend.submit(task) {
            Ok(handle) => {
                self.assignment = Some(Assignment::Submitted(handle));
                Ok(())
            }
            Err(err) => {
                self.stage = FrameStage::Idle;
                Err(err)
            }
        }
    }

    /// `AssignmentDispatched -> AssignmentComplete`. Waits up to the dispatch timeout and
    /// publishes the new lists, or falls back to the previous ones.
    pub fn complete(&mut self) -> Result<(), ClusterError> {
        self.transition(FrameStage::AssignmentDispatched, FrameStage::AssignmentComplete)?;
        let cause = match self.assignment.take() {
            Some(Assignment::Reused) => {
                self.fallback = false;
                self.stats.assignment_reuses += 1;
                return Ok(());
            }
            Some(Assignment::Submitted(handle)) => match self.backend.wait(handle, self.dispatch_timeout) {
                Ok(list) => return self.publish(list),
                Err(err @ ClusterError::DispatchTimeout { .. }) => {
                    self.stats.timeouts += 1;
                    self.straggler = Some(handle);
                    err
                }
                Err(err) => {
                    self.stage = FrameStage::Idle;
                    return Err(err);
                }
            },
            Some(Assignment::Skipped { straggler }) => ClusterError::DispatchInFlight { task: straggler.id() },
            None => {
                self.stage = FrameStage::Idle;
                return Err(ClusterError::InvalidTransition {
                    from: FrameStage::FrustumBuilding,
                    to: FrameStage::AssignmentComplete,
                });
            }
        };
        self.fall_back(cause)
    }

    /// `AssignmentComplete -> ConsumedByShading`. Dropping the returned frame ends the epoch.
    pub fn consume(&mut self) -> Result<ShadingFrame<'_>, ClusterError> {
        if self.stage != FrameStage::AssignmentComplete {
            return Err(ClusterError::InvalidTransition { from: self.stage, to: FrameStage::ConsumedByShading });
        }
        let Some(published) = &self.published else {
            return Err(ClusterError::InvalidTransition { from: self.stage, to: FrameStage::ConsumedByShading });
        };
        let shading_current_grid = matches!(
            &self.frustums,
            Some((_, current)) if Arc::ptr_eq(current, &published.frustums)
        );
        self.stage = FrameStage::ConsumedByShading;
        Ok(ShadingFrame {
            published,
            lights: &self.lights,
            stage: &mut self.stage,
            epoch: &mut self.epoch,
            stats: &mut self.stats,
            fallback: self.fallback,
            frustums_rebuilt: self.frustums_rebuilt && shading_current_grid,
        })
    }

    /// Runs a whole epoch up to shading.
    pub fn run_frame(&mut self, camera: &CameraSnapshot) -> Result<ShadingFrame<'_>, ClusterError> {
        self.begin_frame(camera)?;
        self.dispatch()?;
        self.complete()?;
        self.consume()
    }

    fn publish(&mut self, list: ClusterLightList) -> Result<(), ClusterError> {
        let frustums = match &self.frustums {
            Some((_, frustums)) => Arc::clone(frustums),
            None => {
                self.stage = FrameStage::Idle;
                return Err(ClusterError::InvalidTransition {
                    from: FrameStage::Idle,
                    to: FrameStage::AssignmentComplete,
                });
            }
        };
        if list.dims() != frustums.dims() {
            self.stage = FrameStage::Idle;
            return Err(ClusterError::GridMismatch { grid: frustums.dims(), list: list.dims() });
        }
        let metrics = list.metrics();
        if metrics.overflow_clusters > 0 && !self.overflow_reported {
            log::warn!(
                "{} cluster(s) exceeded {} lights; {} assignment(s) dropped. Further overflow is only counted.",
                metrics.overflow_clusters,
                self.config.max_lights_per_cluster,
                metrics.dropped_assignments
            );
            self.overflow_reported = true;
        }
        self.published = Some(PublishedLists { frustums, list });
        self.fallback = false;
        Ok(())
    }

    fn fall_back(&mut self, cause: ClusterError) -> Result<(), ClusterError> {
        let revision = self.lights.revision();
        match &self.published {
            Some(published) if published.list.light_revision() == revision => {
                log::warn!("{cause}; shading epoch {} with the previous cluster lists", self.epoch);
                self.fallback = true;
                self.stats.fallbacks += 1;
                Ok(())
            }
            _ => {
                self.stage = FrameStage::Idle;
                Err(cause)
            }
        }
    }

    fn transition(&mut self, from: FrameStage, to: FrameStage) -> Result<(), ClusterError> {
        if self.stage != from {
            return Err(ClusterError::InvalidTransition { from: self.stage, to });
        }
        self.stage = to;
        Ok(())
    }

    fn require_idle(&self) -> Result<(), ClusterError> {
        if self.stage != FrameStage::Idle {
            return Err(ClusterError::InvalidTransition { from: self.stage, to: FrameStage::Idle });
        }
        Ok(())
    }
}

/// Read access to one epoch's cluster lists. Dropping it returns the synchronizer to `Idle`.
pub struct ShadingFrame<'a> {
    published: &'a PublishedLists,
    lights: &'a LightTable,
    stage: &'a mut FrameStage,
    epoch: &'a mut u64,
    stats: &'a mut FrameSyncStats,
    fallback: bool,
    frustums_rebuilt: bool,
}

impl<'a> ShadingFrame<'a> {
    pub fn epoch(&self) -> u64 {
        *self.epoch
    }

    pub fn lookup_table(&self) -> ClusterLookup<'a> {
        let published = self.published;
        ClusterLookup::from_parts(&published.frustums, &published.list)
    }

    pub fn lookup(&self, world: Vec3) -> Option<ClusterLights<'a>> {
        self.lookup_table().lookup(world)
    }

    pub fn light_list(&self) -> &'a ClusterLightList {
        &self.published.list
    }

    /// The frustum grid the shaded lists were assigned against. After a fallback this is the
    /// previous epoch's grid.
    pub fn frustums(&self) -> &'a FrustumGrid {
        &self.published.frustums
    }

    pub fn lights(&self) -> &'a [Light] {
        self.lights.as_slice()
    }

    pub fn metrics(&self) -> &'a ClusterMetrics {
        self.published.list.metrics()
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// True when this epoch rebuilt the frustum grid and the shaded lists were assigned against
    /// it. A fallback epoch shades the previous grid and reports `false`.
    pub fn frustums_rebuilt(&self) -> bool {
        self.frustums_rebuilt
    }

    pub fn record(&self) -> FrameRecord {
        FrameRecord {
            epoch: *self.epoch,
            frustums_rebuilt: self.frustums_rebuilt,
            fallback: self.fallback,
            metrics: *self.metrics(),
        }
    }

    /// Ends shading for this epoch.
    pub fn finish(self) {}
}

impl Drop for ShadingFrame<'_> {
    fn drop(&mut self) {
        *self.stage = FrameStage::Idle;
        *self.epoch += 1;
        self.stats.frames += 1;
    }
}
