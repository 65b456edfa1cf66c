use partisim_index::{
    CompartmentLayout, CompartmentMap, Direction, IndexError, RegionId, Vec2, WorldSize,
    regions_of,
};

#[test]
fn neighbor_is_total_and_symmetric_for_all_counts() {
    let world = WorldSize::new(120, 90);
    for count in 1..=36 {
        let map = CompartmentMap::with_count(world, count, true).expect("map");
        assert_eq!(map.len(), count);
        for region in map.regions() {
            for direction in Direction::ALL {
                let neighbor = map
                    .neighbor(region.id, direction)
                    .unwrap_or_else(|| panic!("missing neighbor for {count} compartments"));
                let back = map
                    .neighbor(neighbor.id, direction.opposite())
                    .expect("reverse neighbor");
                assert_eq!(
                    back.id, region.id,
                    "count {count}: {direction:?} from {} is not symmetric",
                    region.id
                );
            }
        }
    }
}

#[test]
fn regions_tile_the_world_exactly() {
    let world = WorldSize::new(101, 37);
    let regions = regions_of(world, 6).expect("regions");
    let area: u64 = regions
        .iter()
        .map(|region| u64::from(region.width) * u64::from(region.height))
        .sum();
    assert_eq!(area, 101 * 37);
    for (index, region) in regions.iter().enumerate() {
        assert_eq!(region.id, RegionId(index as u32), "regions are ordered by id");
    }
}

#[test]
fn two_by_two_scenario_matches_expected_regions() {
    let map = CompartmentMap::with_count(WorldSize::new(100, 100), 4, true).expect("map");
    let origin = map.region_at(0, 0).expect("region(0,0)");
    let right = map.region_at(50, 0).expect("region(50,0)");
    assert_eq!(
        map.neighbor(origin.id, Direction::Right).map(|r| r.id),
        Some(right.id)
    );
    // With two columns the left and right neighbors wrap onto the same region.
    assert_eq!(
        map.neighbor(origin.id, Direction::Left).map(|r| r.id),
        Some(right.id)
    );
    assert_eq!(map.neighbors(origin.id).len(), 8);
}

#[test]
fn edges_without_wraparound_have_no_neighbor() {
    let map = CompartmentMap::new(
        WorldSize::new(90, 90),
        CompartmentLayout::new(3, 3).expect("layout"),
        false,
    )
    .expect("map");
    let corner = map.region_at(0, 0).expect("corner");
    assert!(map.neighbor(corner.id, Direction::Left).is_none());
    assert!(map.neighbor(corner.id, Direction::UpperRight).is_none());
    assert_eq!(map.neighbors(corner.id).len(), 3);
    let center = map.region_at(30, 30).expect("center");
    assert_eq!(map.neighbors(center.id).len(), 8);
    for (direction, id) in map.neighbors(center.id) {
        assert_eq!(
            map.neighbor(id, direction.opposite()).map(|r| r.id),
            Some(center.id)
        );
    }
}

#[test]
fn invalid_counts_are_rejected() {
    let world = WorldSize::new(10, 10);
    assert_eq!(
        CompartmentMap::with_count(world, 0, true).unwrap_err(),
        IndexError::ZeroCompartments
    );
    assert!(matches!(
        CompartmentMap::new(world, CompartmentLayout::new(11, 1).unwrap(), true),
        Err(IndexError::LayoutTooFine { .. })
    ));
    assert!(CompartmentLayout::new(0, 3).is_err());
    assert!(CompartmentMap::with_count(WorldSize::new(0, 10), 1, true).is_err());
}

#[test]
fn resize_bumps_epoch_and_rebuilds_regions() {
    let mut map = CompartmentMap::with_count(WorldSize::new(100, 100), 4, true).expect("map");
    assert_eq!(map.epoch(), 0);
    map.resize(WorldSize::new(200, 60)).expect("resize");
    assert_eq!(map.epoch(), 1);
    let right = map
        .neighbor(RegionId(0), Direction::Right)
        .expect("neighbor");
    assert_eq!((right.origin_x, right.origin_y), (100, 0));
    assert_eq!(
        map.region_containing(Vec2::new(150.0, 45.0)).map(|r| r.id),
        Some(RegionId(3))
    );
}
