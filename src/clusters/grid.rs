use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Dimensions of the cluster grid: screen tiles along x and y, depth slices along z.
/// Serialised as `[x, y, z]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 3]", into = "[u32; 3]")]
pub struct GridDims {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Integer coordinate of one cluster inside a [`GridDims`] grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClusterCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl ClusterCoord {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

impl GridDims {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn validate(self) -> Result<Self, ClusterError> {
        if self.x == 0 || self.y == 0 || self.z == 0 {
            return Err(ClusterError::ZeroGridDimension { x: self.x, y: self.y, z: self.z });
        }
        // cluster indices are u32 on the GPU
        let count = u64::from(self.x) * u64::from(self.y) * u64::from(self.z);
        if count > u64::from(u32::MAX) {
            return Err(ClusterError::GridTooLarge { x: self.x, y: self.y, z: self.z });
        }
        Ok(self)
    }

    pub fn cluster_count(self) -> usize {
        self.x as usize * self.y as usize * self.z as usize
    }

    pub fn as_array(self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn contains(self, coord: ClusterCoord) -> bool {
        coord.x < self.x && coord.y < self.y && coord.z < self.z
    }

    /// Flat slot of a cluster: `x + y * X + z * X * Y`.
    ///
    /// Every writer and reader of cluster data goes through this function.
    pub fn flat_index(self, coord: ClusterCoord) -> usize {
        (coord.z as usize * self.x as usize * self.y as usize)
            + (coord.y as usize * self.x as usize)
            + coord.x as usize
    }

    pub fn coord_of(self, index: usize) -> ClusterCoord {
        let plane = self.x as usize * self.y as usize;
        let z = index / plane;
        let rem = index % plane;
        ClusterCoord::new((rem % self.x as usize) as u32, (rem / self.x as usize) as u32, z as u32)
    }

    /// All coordinates in flat-index order.
    pub fn coords(self) -> impl Iterator<Item = ClusterCoord> {
        (0..self.cluster_count()).map(move |index| self.coord_of(index))
    }
}

impl From<[u32; 3]> for GridDims {
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl From<GridDims> for [u32; 3] {
    fn from(dims: GridDims) -> Self {
        dims.as_array()
    }
}

impl From<(u32, u32, u32)> for GridDims {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

/// Maps a normalised `[0, 1]` position along one axis to a cell, clamping at the grid edges.
pub fn cell_for_fraction(fraction: f32, count: u32) -> u32 {
    if count <= 1 || fraction.is_nan() {
        return 0;
    }
    let cell = (fraction * count as f32).floor();
    cell.clamp(0.0, (count - 1) as f32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_index_round_trips_through_coord_of() {
        let dims = GridDims::new(4, 4, 4);
        assert_eq!(dims.flat_index(ClusterCoord::new(2, 3, 1)), 2 + 3 * 4 + 16);
        for index in [0, 1, 17, 30, 63] {
            assert_eq!(dims.flat_index(dims.coord_of(index)), index);
        }
        let coords: Vec<_> = dims.coords().take(5).collect();
        assert_eq!(coords[4], ClusterCoord::new(0, 1, 0));
    }

    #[test]
    fn zero_axis_is_rejected() {
        let err = GridDims::new(36, 0, 64).validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn grids_past_the_u32_index_range_are_rejected() {
        assert!(GridDims::new(65_536, 65_535, 1).validate().is_ok());
        let err = GridDims::new(65_536, 65_536, 2).validate().unwrap_err();
        assert!(matches!(err, ClusterError::GridTooLarge { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn fractions_clamp_to_edges() {
        assert_eq!(cell_for_fraction(-0.5, 4), 0);
        assert_eq!(cell_for_fraction(0.5, 4), 2);
        assert_eq!(cell_for_fraction(0.999, 4), 3);
        assert_eq!(cell_for_fraction(1.0, 4), 3);
        assert_eq!(cell_for_fraction(f32::NAN, 4), 0);
        assert_eq!(cell_for_fraction(0.7, 1), 0);
    }
}
