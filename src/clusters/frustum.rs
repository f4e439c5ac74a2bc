use glam::{Mat4, Vec3, Vec4};

use super::grid::{cell_for_fraction, ClusterCoord, GridDims};
use crate::error::ClusterError;

const SINGULAR_EPSILON: f32 = 1e-10;
const MIN_HOMOGENEOUS_W: f32 = 1e-12;
const MIN_DEPTH_SPAN: f32 = 1e-6;
const MIN_PLANE_SINE: f32 = 1e-7;

/// A plane in Hessian normal form. Points with a non-negative signed distance lie inside.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub const fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    /// Plane through `a`, `b` and `c`, normal following the winding `a -> b -> c`.
    /// Returns `None` when the points are (nearly) collinear.
    pub fn from_points(a: Vec3, b: Vec3, c: Vec3) -> Option<Self> {
        let u = b - a;
        let v = c - a;
        let cross = u.cross(v);
        let len = cross.length();
        let scale = u.length() * v.length();
        if !len.is_finite() || !(len > scale * MIN_PLANE_SINE) {
            return None;
        }
        let normal = cross / len;
        Some(Self { normal, distance: -normal.dot(a) })
    }

    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    pub fn flipped(self) -> Self {
        Self { normal: -self.normal, distance: -self.distance }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.normal.x, self.normal.y, self.normal.z, self.distance]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrustumSide {
    Left,
    Right,
    Bottom,
    Top,
    Near,
    Far,
}

impl FrustumSide {
    pub const ALL: [FrustumSide; 6] = [
        FrustumSide::Left,
        FrustumSide::Right,
        FrustumSide::Bottom,
        FrustumSide::Top,
        FrustumSide::Near,
        FrustumSide::Far,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    // Corner triples spanning each face, see `ClusterFrustum::corners` for the bit layout.
    fn corner_triple(self) -> [usize; 3] {
        match self {
            FrustumSide::Left => [4, 6, 0],
            FrustumSide::Right => [5, 7, 1],
            FrustumSide::Bottom => [4, 5, 0],
            FrustumSide::Top => [6, 7, 2],
            FrustumSide::Near => [0, 1, 2],
            FrustumSide::Far => [4, 5, 6],
        }
    }
}

/// GPU layout of one cluster's six planes (`xyz` = normal, `w` = distance).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClusterFrustumGpu {
    pub planes: [[f32; 4]; 6],
}

/// Uniform consumed by shading passes to map a world position onto the cluster grid.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClusterSpaceGpu {
    pub view_proj: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    /// near view z, far view z, 1 / (far - near), sign of clip w in front of the camera
    pub depth: [f32; 4],
    /// grid x, y, z, max lights per cluster
    pub grid: [u32; 4],
}

/// Bounding volume of one cluster: six inward-facing planes plus the eight corners they were built from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterFrustum {
    planes: [Plane; 6],
    corners: [Vec3; 8],
}

impl ClusterFrustum {
    /// Builds the planes from eight corners indexed as `x_bit | y_bit << 1 | z_bit << 2`
    /// (x: left/right, y: bottom/top, z: near/far slice).
    pub fn from_corners(corners: [Vec3; 8]) -> Option<Self> {
        if corners.iter().any(|corner| !corner.is_finite()) {
            return None;
        }
        let centroid = corners.iter().copied().sum::<Vec3>() / 8.0;
        let mut planes = [Plane::default(); 6];
        for side in FrustumSide::ALL {
            let [a, b, c] = side.corner_triple();
            let mut plane = Plane::from_points(corners[a], corners[b], corners[c])?;
            let inside = plane.signed_distance(centroid);
            if inside.abs() <= f32::EPSILON * centroid.length().max(1.0) {
                return None;
            }
            if inside < 0.0 {
                plane = plane.flipped();
            }
            planes[side.index()] = plane;
        }
        Some(Self { planes, corners })
    }

    pub fn planes(&self) -> &[Plane; 6] {
        &self.planes
    }

    pub fn plane(&self, side: FrustumSide) -> Plane {
        self.planes[side.index()]
    }

    pub fn corners(&self) -> &[Vec3; 8] {
        &self.corners
    }

    pub fn centroid(&self) -> Vec3 {
        self.corners.iter().copied().sum::<Vec3>() / 8.0
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.signed_distance(point) >= 0.0)
    }

    /// Separating-plane test: false only when the sphere lies fully outside one plane.
    /// Conservative near edges and corners.
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes.iter().all(|plane| plane.signed_distance(center) >= -radius)
    }

    pub fn volume(&self) -> f32 {
        const TETRAHEDRA: [[usize; 4]; 6] =
            [[0, 1, 3, 7], [0, 1, 5, 7], [0, 2, 3, 7], [0, 2, 6, 7], [0, 4, 5, 7], [0, 4, 6, 7]];
        TETRAHEDRA
            .iter()
            .map(|&[a, b, c, d]| {
                let origin = self.corners[a];
                let edges = (self.corners[b] - origin, self.corners[c] - origin, self.corners[d] - origin);
                (edges.0.dot(edges.1.cross(edges.2)) / 6.0).abs()
            })
            .sum()
    }

    pub fn to_gpu(&self) -> ClusterFrustumGpu {
        let mut planes = [[0.0; 4]; 6];
        for (dst, plane) in planes.iter_mut().zip(self.planes.iter()) {
            *dst = plane.to_array();
        }
        ClusterFrustumGpu { planes }
    }
}

/// The camera-derived mapping between world space and cluster space.
///
/// XY tiles are uniform in NDC; depth slices are uniform in view-space depth between the
/// projection's near (NDC z = 0) and far (NDC z = 1) planes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterProjection {
    view: Mat4,
    view_proj: Mat4,
    inv_view_proj: Mat4,
    near_z: f32,
    far_z: f32,
    w_sign: f32,
}

impl ClusterProjection {
    pub fn new(view: Mat4, projection: Mat4) -> Result<Self, ClusterError> {
        ensure_finite(view, "view")?;
        ensure_finite(projection, "projection")?;
        if !(view.determinant().abs() > SINGULAR_EPSILON) {
            return Err(ClusterError::SingularMatrix { which: "view" });
        }
        if !(projection.determinant().abs() > SINGULAR_EPSILON) {
            return Err(ClusterError::SingularMatrix { which: "projection" });
        }
        let view_proj = projection * view;
        let inv_view_proj = view_proj.inverse();
        ensure_finite(inv_view_proj, "view-projection")?;

        let mut w_sign = 0.0f32;
        for corner in 0..8u32 {
            let ndc = Vec4::new(
                if corner & 1 == 0 { -1.0 } else { 1.0 },
                if corner & 2 == 0 { -1.0 } else { 1.0 },
                if corner & 4 == 0 { 0.0 } else { 1.0 },
                1.0,
            );
            let w = (inv_view_proj * ndc).w;
            if !(w.abs() > MIN_HOMOGENEOUS_W) || (w_sign != 0.0 && w.signum() != w_sign) {
                return Err(ClusterError::SingularMatrix { which: "view-projection" });
            }
            w_sign = w.signum();
        }

        let inv_proj = projection.inverse();
        let near = inv_proj * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let far = inv_proj * Vec4::new(0.0, 0.0, 1.0, 1.0);
        let near_z = near.z / near.w;
        let far_z = far.z / far.w;
        if !near_z.is_finite() || !far_z.is_finite() || !((far_z - near_z).abs() > MIN_DEPTH_SPAN) {
            return Err(ClusterError::SingularMatrix { which: "projection" });
        }

        Ok(Self { view, view_proj, inv_view_proj, near_z, far_z, w_sign })
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn view_projection(&self) -> Mat4 {
        self.view_proj
    }

    /// View-space z of the near and far planes.
    pub fn depth_range(&self) -> (f32, f32) {
        (self.near_z, self.far_z)
    }

    /// World-space position of an NDC point (`z` in `[0, 1]`).
    pub fn unproject(&self, ndc_x: f32, ndc_y: f32, ndc_z: f32) -> Vec3 {
        let world = self.inv_view_proj * Vec4::new(ndc_x, ndc_y, ndc_z, 1.0);
        world.truncate() / world.w
    }

    /// Position of `world` between the near (0) and far (1) planes, linear in view depth.
    pub fn depth_fraction(&self, world: Vec3) -> f32 {
        let view_z = (self.view * world.extend(1.0)).z;
        (view_z - self.near_z) / (self.far_z - self.near_z)
    }

    /// Cluster containing `world`, clamped to the grid edges.
    /// `None` for points on or behind the camera plane.
    pub fn cluster_coord(&self, dims: GridDims, world: Vec3) -> Option<ClusterCoord> {
        let clip = self.view_proj * world.extend(1.0);
        if !(clip.w * self.w_sign > MIN_HOMOGENEOUS_W) {
            return None;
        }
        let ndc = clip.truncate() / clip.w;
        Some(ClusterCoord::new(
            cell_for_fraction(ndc.x * 0.5 + 0.5, dims.x),
            cell_for_fraction(ndc.y * 0.5 + 0.5, dims.y),
            cell_for_fraction(self.depth_fraction(world), dims.z),
        ))
    }

    pub fn to_gpu(&self, dims: GridDims, max_lights_per_cluster: u32) -> ClusterSpaceGpu {
        ClusterSpaceGpu {
            view_proj: self.view_proj.to_cols_array_2d(),
            view: self.view.to_cols_array_2d(),
            depth: [self.near_z, self.far_z, 1.0 / (self.far_z - self.near_z), self.w_sign],
            grid: [dims.x, dims.y, dims.z, max_lights_per_cluster],
        }
    }
}

/// Frustum plane sets for every cluster of a grid, in flat-index order, together with the
/// projection they were built from.
#[derive(Clone, Debug, PartialEq)]
pub struct FrustumGrid {
    dims: GridDims,
    projection: ClusterProjection,
    frustums: Vec<ClusterFrustum>,
}

impl FrustumGrid {
    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn projection(&self) -> &ClusterProjection {
        &self.projection
    }

    pub fn frustums(&self) -> &[ClusterFrustum] {
        &self.frustums
    }

    pub fn frustum(&self, coord: ClusterCoord) -> Option<&ClusterFrustum> {
        if !self.dims.contains(coord) {
            return None;
        }
        self.frustums.get(self.dims.flat_index(coord))
    }

    pub fn cluster_coord(&self, world: Vec3) -> Option<ClusterCoord> {
        self.projection.cluster_coord(self.dims, world)
    }

    pub fn gpu_records(&self) -> Vec<ClusterFrustumGpu> {
        self.frustums.iter().map(ClusterFrustum::to_gpu).collect()
    }
}

/// Builds the plane sets of all clusters for the given camera matrices.
pub fn build_frustums(view: Mat4, projection: Mat4, dims: GridDims) -> Result<FrustumGrid, ClusterError> {
    let mut frustums = Vec::new();
    let projection = build_frustums_into(view, projection, dims, &mut frustums)?;
    Ok(FrustumGrid { dims, projection, frustums })
}

/// Same as [`build_frustums`] but writes into a caller-owned buffer, which is cleared first.
/// The buffer contents are unspecified when an error is returned.
pub fn build_frustums_into(
    view: Mat4,
    projection: Mat4,
    dims: GridDims,
    out: &mut Vec<ClusterFrustum>,
) -> Result<ClusterProjection, ClusterError> {
    let dims = dims.validate()?;
    let cluster_projection = ClusterProjection::new(view, projection)?;
    out.clear();
    out.reserve(dims.cluster_count());

    // Corner rays of every tile boundary, shared by neighbouring clusters.
    let columns = (dims.x + 1) as usize;
    let mut near_points = Vec::with_capacity(columns * (dims.y + 1) as usize);
    let mut far_points = Vec::with_capacity(near_points.capacity());
    for j in 0..=dims.y {
        let ndc_y = -1.0 + 2.0 * j as f32 / dims.y as f32;
        for i in 0..=dims.x {
            let ndc_x = -1.0 + 2.0 * i as f32 / dims.x as f32;
            near_points.push(cluster_projection.unproject(ndc_x, ndc_y, 0.0));
            far_points.push(cluster_projection.unproject(ndc_x, ndc_y, 1.0));
        }
    }

    for k in 0..dims.z {
        let t_near = k as f32 / dims.z as f32;
        let t_far = (k + 1) as f32 / dims.z as f32;
        for j in 0..dims.y {
            for i in 0..dims.x {
                let mut corners = [Vec3::ZERO; 8];
                for (bit, corner) in corners.iter_mut().enumerate() {
                    let column = (j as usize + ((bit >> 1) & 1)) * columns + i as usize + (bit & 1);
                    let t = if bit & 4 == 0 { t_near } else { t_far };
                    *corner = near_points[column].lerp(far_points[column], t);
                }
                let frustum = ClusterFrustum::from_corners(corners)
                    .ok_or(ClusterError::DegenerateCluster { x: i, y: j, z: k })?;
                out.push(frustum);
            }
        }
    }
    Ok(cluster_projection)
}

fn ensure_finite(matrix: Mat4, which: &'static str) -> Result<(), ClusterError> {
    if matrix.is_finite() {
        Ok(())
    } else {
        Err(ClusterError::NonFiniteMatrix { which })
    }
}
