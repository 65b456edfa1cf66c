//! Spatial partitioning of the simulated world into rectangular compartments.
//!
//! The world is a `width × height` plane split into a `columns × rows` grid of
//! [`Region`]s. Neighbor lookups are computed on demand with wraparound
//! arithmetic, so the relation is never stored and can be rebuilt cheaply when
//! the world is resized.

use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Errors emitted while building a compartment map.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// The requested number of compartments was zero.
    #[error("compartment count must be positive")]
    ZeroCompartments,
    /// The requested grid has more columns or rows than world units.
    #[error("layout {columns}x{rows} does not fit a {width}x{height} world")]
    LayoutTooFine {
        columns: u32,
        rows: u32,
        width: u32,
        height: u32,
    },
    /// Indicates configuration values that cannot be used (e.g., zero world size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Two-dimensional vector in world units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn length_sq(self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    #[must_use]
    pub fn length(self) -> f32 {
        self.length_sq().sqrt()
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Vec2 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Vec2 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Vec2 {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Mul<f32> for Vec2 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

/// Dimensions of the whole world in integer world units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorldSize {
    pub width: u32,
    pub height: u32,
}

impl WorldSize {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub fn as_vec2(self) -> Vec2 {
        Vec2::new(self.width as f32, self.height as f32)
    }

    #[must_use]
    pub fn rect(self) -> Rect {
        Rect::new(0.0, 0.0, self.width as f32, self.height as f32)
    }
}

/// Axis-aligned rectangle; `contains` is half-open on the far edges.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    #[must_use]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    #[must_use]
    pub fn contains(&self, point: Vec2) -> bool {
        point.x >= self.x && point.x < self.right() && point.y >= self.y && point.y < self.bottom()
    }

    #[must_use]
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

/// Stable identifier of a region within one map epoch.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct RegionId(pub u32);

impl RegionId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// The eight compass neighbors of a region. `Upper` points towards smaller `y`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    UpperLeft,
    Upper,
    UpperRight,
    Left,
    Right,
    LowerLeft,
    Lower,
    LowerRight,
}

impl Direction {
    /// All directions in canonical order; dependency edges are built in this order.
    pub const ALL: [Direction; 8] = [
        Direction::UpperLeft,
        Direction::Upper,
        Direction::UpperRight,
        Direction::Left,
        Direction::Right,
        Direction::LowerLeft,
        Direction::Lower,
        Direction::LowerRight,
    ];

    /// Column/row offset of the neighbor in this direction.
    #[must_use]
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Self::UpperLeft => (-1, -1),
            Self::Upper => (0, -1),
            Self::UpperRight => (1, -1),
            Self::Left => (-1, 0),
            Self::Right => (1, 0),
            Self::LowerLeft => (-1, 1),
            Self::Lower => (0, 1),
            Self::LowerRight => (1, 1),
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::UpperLeft => Self::LowerRight,
            Self::Upper => Self::Lower,
            Self::UpperRight => Self::LowerLeft,
            Self::Left => Self::Right,
            Self::Right => Self::Left,
            Self::LowerLeft => Self::UpperRight,
            Self::Lower => Self::Upper,
            Self::LowerRight => Self::UpperLeft,
        }
    }

    /// Inverse of [`Direction::offset`]; `(0, 0)` has no direction.
    #[must_use]
    pub const fn from_offset(dx: i32, dy: i32) -> Option<Self> {
        match (dx.signum(), dy.signum()) {
            (-1, -1) => Some(Self::UpperLeft),
            (0, -1) => Some(Self::Upper),
            (1, -1) => Some(Self::UpperRight),
            (-1, 0) => Some(Self::Left),
            (1, 0) => Some(Self::Right),
            (-1, 1) => Some(Self::LowerLeft),
            (0, 1) => Some(Self::Lower),
            (1, 1) => Some(Self::LowerRight),
            _ => None,
        }
    }

    /// Position of the direction inside [`Direction::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Rectangular spatial partition of the world.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Region {
    pub id: RegionId,
    pub column: u32,
    pub row: u32,
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    #[must_use]
    pub fn rect(&self) -> Rect {
        Rect::new(
            self.origin_x as f32,
            self.origin_y as f32,
            self.width as f32,
            self.height as f32,
        )
    }

    #[must_use]
    pub fn contains(&self, point: Vec2) -> bool {
        self.rect().contains(point)
    }
}

/// Grid shape of the partition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CompartmentLayout {
    pub columns: u32,
    pub rows: u32,
}

impl CompartmentLayout {
    /// Explicit `columns × rows` grid.
    pub fn new(columns: u32, rows: u32) -> Result<Self, IndexError> {
        if columns == 0 || rows == 0 {
            return Err(IndexError::ZeroCompartments);
        }
        Ok(Self { columns, rows })
    }

    /// Most square grid holding exactly `count` compartments, with `columns >= rows`.
    pub fn from_count(count: usize) -> Result<Self, IndexError> {
        if count == 0 {
            return Err(IndexError::ZeroCompartments);
        }
        let count = u32::try_from(count)
            .map_err(|_| IndexError::InvalidConfig("compartment count exceeds u32"))?;
        let mut rows = 1;
        let mut candidate = 1u32;
        while candidate <= count / candidate {
            if count.is_multiple_of(candidate) {
                rows = candidate;
            }
            candidate += 1;
        }
        Ok(Self {
            columns: count / rows,
            rows,
        })
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        (self.columns as usize) * (self.rows as usize)
    }
}

/// Splits `total` units into `parts` spans; leading spans absorb the remainder.
fn span_starts(total: u32, parts: u32) -> Vec<u32> {
    let base = total / parts;
    let extra = total % parts;
    let mut starts = Vec::with_capacity(parts as usize + 1);
    let mut cursor = 0;
    for part in 0..parts {
        starts.push(cursor);
        cursor += base + u32::from(part < extra);
    }
    starts.push(cursor);
    starts
}

fn wrap_index(value: i64, len: u32) -> u32 {
    value.rem_euclid(i64::from(len)) as u32
}

/// Compartment map: the ordered regions of one world plus neighbor arithmetic.
#[derive(Debug, Clone, PartialEq)]
pub struct CompartmentMap {
    world: WorldSize,
    layout: CompartmentLayout,
    wraparound: bool,
    epoch: u64,
    column_starts: Vec<u32>,
    row_starts: Vec<u32>,
    regions: Vec<Region>,
}

impl CompartmentMap {
    /// Build a map for an explicit layout.
    pub fn new(
        world: WorldSize,
        layout: CompartmentLayout,
        wraparound: bool,
    ) -> Result<Self, IndexError> {
        let mut map = Self {
            world,
            layout,
            wraparound,
            epoch: 0,
            column_starts: Vec::new(),
            row_starts: Vec::new(),
            regions: Vec::new(),
        };
        map.rebuild()?;
        Ok(map)
    }

    /// Build a map with the most square grid of `count` compartments.
    pub fn with_count(world: WorldSize, count: usize, wraparound: bool) -> Result<Self, IndexError> {
        Self::new(world, CompartmentLayout::from_count(count)?, wraparound)
    }

    fn rebuild(&mut self) -> Result<(), IndexError> {
        let WorldSize { width, height } = self.world;
        if width == 0 || height == 0 {
            return Err(IndexError::InvalidConfig("world dimensions must be non-zero"));
        }
        let CompartmentLayout { columns, rows } = self.layout;
        if columns > width || rows > height {
            return Err(IndexError::LayoutTooFine {
                columns,
                rows,
                width,
                height,
            });
        }
        self.column_starts = span_starts(width, columns);
        self.row_starts = span_starts(height, rows);
        self.regions.clear();
        self.regions.reserve(self.layout.count());
        for row in 0..rows {
            for column in 0..columns {
                let (c, r) = (column as usize, row as usize);
                self.regions.push(Region {
                    id: RegionId(row * columns + column),
                    column,
                    row,
                    origin_x: self.column_starts[c],
                    origin_y: self.row_starts[r],
                    width: self.column_starts[c + 1] - self.column_starts[c],
                    height: self.row_starts[r + 1] - self.row_starts[r],
                });
            }
        }
        Ok(())
    }

    /// Rebuild for a new world size. Every previously returned [`RegionId`] is invalidated.
    pub fn resize(&mut self, world: WorldSize) -> Result<(), IndexError> {
        let previous = self.world;
        self.world = world;
        if let Err(err) = self.rebuild() {
            self.world = previous;
            self.rebuild()?;
            return Err(err);
        }
        self.epoch += 1;
        Ok(())
    }

    #[must_use]
    pub fn world(&self) -> WorldSize {
        self.world
    }

    #[must_use]
    pub fn layout(&self) -> CompartmentLayout {
        self.layout
    }

    #[must_use]
    pub fn wraparound(&self) -> bool {
        self.wraparound
    }

    /// Incremented on every resize; ids from another epoch must be discarded.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(id.index())
    }

    fn region_at_cell(&self, column: u32, row: u32) -> &Region {
        &self.regions[(row * self.layout.columns + column) as usize]
    }

    /// Neighbor of `id` in `direction`. Always `Some` with wraparound enabled;
    /// `None` past the world edge otherwise.
    #[must_use]
    pub fn neighbor(&self, id: RegionId, direction: Direction) -> Option<&Region> {
        let region = self.region(id)?;
        let (dx, dy) = direction.offset();
        let column = i64::from(region.column) + i64::from(dx);
        let row = i64::from(region.row) + i64::from(dy);
        let CompartmentLayout { columns, rows } = self.layout;
        if self.wraparound {
            return Some(self.region_at_cell(wrap_index(column, columns), wrap_index(row, rows)));
        }
        if column < 0 || row < 0 || column >= i64::from(columns) || row >= i64::from(rows) {
            return None;
        }
        Some(self.region_at_cell(column as u32, row as u32))
    }

    /// All existing neighbors of `id` in canonical direction order.
    #[must_use]
    pub fn neighbors(&self, id: RegionId) -> SmallVec<[(Direction, RegionId); 8]> {
        Direction::ALL
            .iter()
            .filter_map(|&direction| {
                self.neighbor(id, direction)
                    .map(|region| (direction, region.id))
            })
            .collect()
    }

    /// Region whose origin is exactly `(x, y)`.
    #[must_use]
    pub fn region_at(&self, x: u32, y: u32) -> Option<&Region> {
        self.regions
            .iter()
            .find(|region| region.origin_x == x && region.origin_y == y)
    }

    /// Region containing `point`; `None` outside the world.
    #[must_use]
    pub fn region_containing(&self, point: Vec2) -> Option<&Region> {
        if !self.world.rect().contains(point) {
            return None;
        }
        let column = self.column_starts.partition_point(|&start| start as f32 <= point.x) - 1;
        let row = self.row_starts.partition_point(|&start| start as f32 <= point.y) - 1;
        Some(self.region_at_cell(column as u32, row as u32))
    }

    /// Regions whose rectangle intersects `rect`.
    pub fn regions_intersecting(&self, rect: Rect) -> impl Iterator<Item = &Region> + '_ {
        self.regions
            .iter()
            .filter(move |region| region.rect().intersects(&rect))
    }
}

/// Ordered regions for `count` compartments over `world`.
pub fn regions_of(world: WorldSize, count: usize) -> Result<Vec<Region>, IndexError> {
    Ok(CompartmentMap::with_count(world, count, true)?.regions)
}
