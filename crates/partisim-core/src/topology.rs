//! World-space geometry shared by units and integrators.

use partisim_index::{Rect, Vec2, WorldSize};
use serde::{Deserialize, Serialize};

/// Bounds of the simulated world and how its edges behave.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WorldTopology {
    pub size: WorldSize,
    pub wraparound: bool,
}

impl WorldTopology {
    #[must_use]
    pub const fn new(size: WorldSize, wraparound: bool) -> Self {
        Self { size, wraparound }
    }

    /// Shortest displacement from `from` to `to`, honouring wraparound.
    #[must_use]
    pub fn delta(&self, from: Vec2, to: Vec2) -> Vec2 {
        let mut d = to - from;
        if self.wraparound {
            let extent = self.size.as_vec2();
            d.x = min_image(d.x, extent.x);
            d.y = min_image(d.y, extent.y);
        }
        d
    }

    /// Bring `position` back inside the world: wrap on a torus, reflect off walls otherwise.
    /// Velocity components are flipped on reflection.
    pub fn confine(&self, position: &mut Vec2, velocity: &mut Vec2) {
        let extent = self.size.as_vec2();
        if self.wraparound {
            position.x = wrap_axis(position.x, extent.x);
            position.y = wrap_axis(position.y, extent.y);
        } else {
            reflect_axis(&mut position.x, &mut velocity.x, extent.x);
            reflect_axis(&mut position.y, &mut velocity.y, extent.y);
        }
    }

    /// Squared distance from `point` to the closest point of `rect`.
    #[must_use]
    pub fn distance_sq_to_rect(&self, point: Vec2, rect: &Rect) -> f32 {
        let extent = self.size.as_vec2();
        let gx = self.axis_gap(point.x, rect.x, rect.right(), extent.x);
        let gy = self.axis_gap(point.y, rect.y, rect.bottom(), extent.y);
        gx * gx + gy * gy
    }

    fn axis_gap(&self, value: f32, lo: f32, hi: f32, extent: f32) -> f32 {
        if value >= lo && value < hi {
            return 0.0;
        }
        let below = lo - value;
        let above = value - hi;
        if !self.wraparound {
            return below.max(above).max(0.0);
        }
        below.rem_euclid(extent).min(above.rem_euclid(extent))
    }
}

fn min_image(d: f32, extent: f32) -> f32 {
    if d > extent * 0.5 {
        d - extent
    } else if d < -extent * 0.5 {
        d + extent
    } else {
        d
    }
}

fn wrap_axis(value: f32, extent: f32) -> f32 {
    let wrapped = value.rem_euclid(extent);
    // rem_euclid can round up to `extent` for tiny negative inputs.
    if wrapped >= extent { 0.0 } else { wrapped }
}

fn reflect_axis(value: &mut f32, velocity: &mut f32, extent: f32) {
    if *value < 0.0 {
        *value = (-*value).min(extent.next_down());
        *velocity = velocity.abs();
    } else if *value >= extent {
        *value = (2.0 * extent - *value).clamp(0.0, extent.next_down());
        *velocity = -velocity.abs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torus() -> WorldTopology {
        WorldTopology::new(WorldSize::new(100, 100), true)
    }

    #[test]
    fn delta_takes_the_short_way_round() {
        let d = torus().delta(Vec2::new(95.0, 5.0), Vec2::new(5.0, 95.0));
        assert_eq!(d, Vec2::new(10.0, -10.0));
        let walls = WorldTopology::new(WorldSize::new(100, 100), false);
        assert_eq!(
            walls.delta(Vec2::new(95.0, 5.0), Vec2::new(5.0, 95.0)),
            Vec2::new(-90.0, 90.0)
        );
    }

    #[test]
    fn confine_wraps_or_reflects() {
        let mut position = Vec2::new(-2.0, 101.0);
        let mut velocity = Vec2::new(-1.0, 1.0);
        torus().confine(&mut position, &mut velocity);
        assert_eq!(position, Vec2::new(98.0, 1.0));
        assert_eq!(velocity, Vec2::new(-1.0, 1.0));

        let walls = WorldTopology::new(WorldSize::new(100, 100), false);
        let mut position = Vec2::new(-2.0, 101.0);
        walls.confine(&mut position, &mut velocity);
        assert_eq!(position, Vec2::new(2.0, 99.0));
        assert_eq!(velocity, Vec2::new(1.0, -1.0));
    }

    #[test]
    fn rect_distance_wraps_across_the_seam() {
        let rect = Rect::new(0.0, 0.0, 50.0, 50.0);
        assert_eq!(torus().distance_sq_to_rect(Vec2::new(10.0, 10.0), &rect), 0.0);
        assert_eq!(torus().distance_sq_to_rect(Vec2::new(95.0, 10.0), &rect), 25.0);
        assert_eq!(torus().distance_sq_to_rect(Vec2::new(55.0, 10.0), &rect), 25.0);
        let walls = WorldTopology::new(WorldSize::new(100, 100), false);
        assert_eq!(walls.distance_sq_to_rect(Vec2::new(95.0, 10.0), &rect), 2025.0);
    }
}
