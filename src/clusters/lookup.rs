use glam::Vec3;

use super::assign::ClusterLightList;
use super::frustum::FrustumGrid;
use super::grid::ClusterCoord;
use crate::error::ClusterError;

/// Lights affecting one cluster, as seen by a shading invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterLights<'a> {
    pub coord: ClusterCoord,
    pub index: usize,
    pub lights: &'a [u32],
}

impl ClusterLights<'_> {
    pub fn count(&self) -> u32 {
        self.lights.len() as u32
    }
}

/// Read side of the cluster light lists: resolves world positions to the list of the cluster
/// that contains them, using the same projection and index formula the lists were assigned with.
#[derive(Clone, Copy, Debug)]
pub struct ClusterLookup<'a> {
    grid: &'a FrustumGrid,
    list: &'a ClusterLightList,
}

impl<'a> ClusterLookup<'a> {
    pub fn new(grid: &'a FrustumGrid, list: &'a ClusterLightList) -> Result<Self, ClusterError> {
        if grid.dims() != list.dims() {
            return Err(ClusterError::GridMismatch { grid: grid.dims(), list: list.dims() });
        }
        Ok(Self { grid, list })
    }

    /// For callers that already hold a grid and a list assigned against it.
    pub(crate) fn from_parts(grid: &'a FrustumGrid, list: &'a ClusterLightList) -> Self {
        debug_assert_eq!(grid.dims(), list.dims());
        Self { grid, list }
    }

    pub fn cluster_coord(&self, world: Vec3) -> Option<ClusterCoord> {
        self.grid.cluster_coord(world)
    }

    /// Positions outside the view volume clamp to the nearest edge cluster; positions on or
    /// behind the camera plane resolve to nothing.
    pub fn lookup(&self, world: Vec3) -> Option<ClusterLights<'a>> {
        let coord = self.grid.cluster_coord(world)?;
        let index = self.grid.dims().flat_index(coord);
        Some(ClusterLights { coord, index, lights: self.list.lights(index) })
    }

    pub fn list(&self) -> &'a ClusterLightList {
        self.list
    }

    pub fn grid(&self) -> &'a FrustumGrid {
        self.grid
    }
}
