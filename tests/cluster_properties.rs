use glam::{Mat4, Vec3};
use kestrel_clusters::clusters::{
    assign_lights, build_frustums, ClusterCoord, ClusterLightList, ClusterLookup, FrustumGrid, GridDims, Light,
    PointLight,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn reference_camera() -> (Mat4, Mat4) {
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 11.0), Vec3::ZERO, Vec3::Y);
    let proj = Mat4::perspective_rh(90.0_f32.to_radians(), 1.0, 1.0, 19.0);
    (view, proj)
}

fn reference_grid(dims: GridDims) -> FrustumGrid {
    let (view, proj) = reference_camera();
    build_frustums(view, proj, dims).expect("reference camera builds")
}

fn point(position: Vec3, range: f32) -> Light {
    Light::Point(PointLight::new(position, range, Vec3::ONE, 1.0))
}

#[test]
fn every_interior_point_maps_to_exactly_one_cluster() {
    let dims = GridDims::new(6, 5, 7);
    let grid = reference_grid(dims);
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..500 {
        let world = grid.projection().unproject(
            rng.gen_range(-0.98..0.98),
            rng.gen_range(-0.98..0.98),
            rng.gen_range(0.01..0.99),
        );
        let coord = grid.cluster_coord(world).expect("interior point is in front of the camera");
        assert!(dims.contains(coord), "{coord:?} outside {dims:?}");
        let frustum = grid.frustum(coord).unwrap();
        assert!(frustum.intersects_sphere(world, 1e-3), "{world:?} not inside its cluster {coord:?}");
        let strict_owners = grid
            .frustums()
            .iter()
            .filter(|frustum| frustum.planes().iter().all(|plane| plane.signed_distance(world) > 1e-3))
            .count();
        assert!(strict_owners <= 1, "{world:?} strictly inside {strict_owners} clusters");
    }
}

#[test]
fn clusters_have_positive_volume_for_varied_cameras() {
    let cameras = [
        reference_camera(),
        (
            Mat4::look_at_rh(Vec3::new(4.0, 3.0, -6.0), Vec3::new(0.0, 1.0, 0.0), Vec3::Y),
            Mat4::perspective_rh(45.0_f32.to_radians(), 16.0 / 9.0, 0.1, 250.0),
        ),
        (
            Mat4::look_at_rh(Vec3::new(0.0, 20.0, 0.1), Vec3::ZERO, Vec3::Z),
            Mat4::perspective_rh(120.0_f32.to_radians(), 0.5, 2.0, 40.0),
        ),
    ];
    for (view, proj) in cameras {
        let grid = build_frustums(view, proj, GridDims::new(8, 5, 12)).expect("valid camera");
        for (index, frustum) in grid.frustums().iter().enumerate() {
            assert!(frustum.volume() > 0.0, "cluster {index} is degenerate");
            assert!(frustum.contains_point(frustum.centroid()));
        }
    }
}

#[test]
fn fully_contained_light_is_never_missed() {
    let grid = reference_grid(GridDims::new(1, 1, 1));
    let frustum = &grid.frustums()[0];
    let centroid = frustum.centroid();
    let half_width = frustum.planes().iter().map(|plane| plane.signed_distance(centroid)).fold(f32::MAX, f32::min);
    let list = assign_lights(&grid, &[point(centroid, half_width * 0.9)], 4).unwrap();
    assert_eq!(list.lights(0), &[0]);

    let dims = GridDims::new(4, 4, 4);
    let grid = reference_grid(dims);
    let lights: Vec<Light> = grid
        .frustums()
        .iter()
        .map(|frustum| {
            let centroid = frustum.centroid();
            let inset =
                frustum.planes().iter().map(|plane| plane.signed_distance(centroid)).fold(f32::MAX, f32::min);
            point(centroid, inset * 0.5)
        })
        .collect();
    let list = assign_lights(&grid, &lights, 64).unwrap();
    for cluster in 0..dims.cluster_count() {
        assert!(list.lights(cluster).contains(&(cluster as u32)), "cluster {cluster} lost its own light");
    }
}

#[test]
fn overflowing_cluster_keeps_lowest_indices_in_order() {
    let max = 6u32;
    let grid = reference_grid(GridDims::new(4, 4, 4));
    let coord = ClusterCoord::new(1, 2, 1);
    let centroid = grid.frustum(coord).unwrap().centroid();
    let lights: Vec<Light> = (0..max + 5).map(|_| point(centroid, 0.05)).collect();
    let list = assign_lights(&grid, &lights, max).unwrap();
    let expected: Vec<u32> = (0..max).collect();
    assert_eq!(list.lights_at(coord), expected.as_slice());
    assert!(list.counts().iter().all(|&count| count <= max));
    assert_eq!(list.metrics().dropped_assignments, 5);
}

#[test]
fn lookup_reads_the_slot_assignment_writes() {
    let dims = GridDims::new(4, 4, 4);
    let grid = reference_grid(dims);
    let target = ClusterCoord::new(2, 3, 1);
    let mut list = ClusterLightList::new(dims, 4).unwrap();
    list.write_cluster(dims.flat_index(target), &[4242]);

    let lookup = ClusterLookup::new(&grid, &list).unwrap();
    let world = grid.frustum(target).unwrap().centroid();
    let found = lookup.lookup(world).expect("centroid is visible");
    assert_eq!(found.coord, target);
    assert_eq!(found.lights, &[4242]);
    for coord in dims.coords().filter(|coord| *coord != target) {
        assert!(list.lights_at(coord).is_empty());
    }
}

#[test]
fn static_scene_assigns_identical_lists() {
    let dims = GridDims::new(8, 6, 10);
    let (view, proj) = reference_camera();
    let mut rng = StdRng::seed_from_u64(99);
    let lights: Vec<Light> = (0..200)
        .map(|_| {
            let position = Vec3::new(rng.gen_range(-8.0..8.0), rng.gen_range(-8.0..8.0), rng.gen_range(-8.0..8.0));
            point(position, rng.gen_range(0.5..3.0))
        })
        .collect();
    let first = assign_lights(&build_frustums(view, proj, dims).unwrap(), &lights, 12).unwrap();
    let second = assign_lights(&build_frustums(view, proj, dims).unwrap(), &lights, 12).unwrap();
    assert_eq!(first.to_words(), second.to_words());
    assert_eq!(first, second);
}

#[test]
fn origin_light_lands_in_the_center_cluster() {
    let dims = GridDims::new(4, 4, 4);
    let grid = reference_grid(dims);
    let list = assign_lights(&grid, &[point(Vec3::ZERO, 1.0)], 8).unwrap();

    assert_eq!(grid.cluster_coord(Vec3::ZERO), Some(ClusterCoord::new(2, 2, 2)));
    assert!(list.lights_at(ClusterCoord::new(2, 2, 2)).contains(&0));
    assert!(list.lights_at(ClusterCoord::new(0, 0, 0)).is_empty());
    assert!(list.lights_at(ClusterCoord::new(3, 3, 3)).is_empty());

    let lookup = ClusterLookup::new(&grid, &list).unwrap();
    let center = lookup.lookup(Vec3::new(0.01, 0.01, 0.0)).unwrap();
    assert_eq!(center.coord, ClusterCoord::new(2, 2, 2));
    assert_eq!(center.lights, &[0]);
}
