//! Movement module
//!
//! The per-player waypoint queue and the 8-way direction encoding the
//! wire protocol uses. Waypoints are packed into 32-bit integers so the
//! queue is a dense inline array.

use tracing::warn;

use crate::error::ProtocolError;
use crate::game::player::Position;

/// Maximum queued waypoints per player
pub const MAX_WAYPOINTS: usize = 25;

/// Upper bound for waypoint coordinates accepted from handlers
pub const MAX_WAYPOINT_COORD: u16 = 12_800;

/// One of the eight walk directions. The numbering is part of the
/// observable protocol and must match the client bit-for-bit:
///
/// ```text
/// 0 NW   1 N   2 NE
/// 3 W          4 E
/// 5 SW   6 S   7 SE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    NorthWest = 0,
    North = 1,
    NorthEast = 2,
    West = 3,
    East = 4,
    SouthWest = 5,
    South = 6,
    SouthEast = 7,
}

impl Direction {
    /// Direction for a single-tile step, if the step is a Chebyshev
    /// neighbour (and not zero-length)
    pub fn from_delta(dx: i32, dz: i32) -> Option<Self> {
        match (dx, dz) {
            (-1, 1) => Some(Self::NorthWest),
            (0, 1) => Some(Self::North),
            (1, 1) => Some(Self::NorthEast),
            (-1, 0) => Some(Self::West),
            (1, 0) => Some(Self::East),
            (-1, -1) => Some(Self::SouthWest),
            (0, -1) => Some(Self::South),
            (1, -1) => Some(Self::SouthEast),
            _ => None,
        }
    }

    /// The (dx, dz) step this direction takes
    pub fn delta(self) -> (i32, i32) {
        match self {
            Self::NorthWest => (-1, 1),
            Self::North => (0, 1),
            Self::NorthEast => (1, 1),
            Self::West => (-1, 0),
            Self::East => (1, 0),
            Self::SouthWest => (-1, -1),
            Self::South => (0, -1),
            Self::SouthEast => (1, -1),
        }
    }

    /// Wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A waypoint packed into 32 bits: bits 0–13 hold z, bits 14–27 hold x,
/// bits 28–29 hold the level.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CoordGrid(u32);

impl CoordGrid {
    /// Pack a coordinate
    pub fn new(level: u8, x: u16, z: u16) -> Self {
        Self((((level as u32) & 0x3) << 28) | (((x as u32) & 0x3FFF) << 14) | ((z as u32) & 0x3FFF))
    }

    /// Pack a player position
    pub fn from_position(pos: Position) -> Self {
        Self::new(pos.height, pos.x, pos.z)
    }

    pub fn level(self) -> u8 {
        ((self.0 >> 28) & 0x3) as u8
    }

    pub fn x(self) -> u16 {
        ((self.0 >> 14) & 0x3FFF) as u16
    }

    pub fn z(self) -> u16 {
        (self.0 & 0x3FFF) as u16
    }

    /// Raw packed value
    pub fn packed(self) -> u32 {
        self.0
    }
}

impl std::fmt::Debug for CoordGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CoordGrid({}, {}, {})", self.level(), self.x(), self.z())
    }
}

/// Bounded FIFO of packed waypoints, stored inline as a ring buffer
#[derive(Debug, Clone)]
pub struct MovementQueue {
    waypoints: [CoordGrid; MAX_WAYPOINTS],
    head: usize,
    count: usize,
}

impl MovementQueue {
    pub fn new() -> Self {
        Self {
            waypoints: [CoordGrid(0); MAX_WAYPOINTS],
            head: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
    }

    /// Append a waypoint. A full queue rejects silently; an
    /// out-of-range coordinate rejects with a log line.
    pub fn add(&mut self, level: u8, x: u16, z: u16) {
        if self.count == MAX_WAYPOINTS {
            return;
        }
        if x > MAX_WAYPOINT_COORD || z > MAX_WAYPOINT_COORD {
            warn!(x, z, "rejecting out-of-range waypoint");
            return;
        }
        let tail = (self.head + self.count) % MAX_WAYPOINTS;
        self.waypoints[tail] = CoordGrid::new(level, x, z);
        self.count += 1;
    }

    /// Append waypoints from `src` to `(dest_x, dest_z)`, stepping
    /// diagonally until one axis aligns and then straight. Terrain is not
    /// consulted.
    pub fn naive_path(&mut self, src: Position, dest_x: u16, dest_z: u16) {
        let mut x = src.x as i32;
        let mut z = src.z as i32;
        let dest_x = dest_x as i32;
        let dest_z = dest_z as i32;

        while x != dest_x || z != dest_z {
            x += (dest_x - x).signum();
            z += (dest_z - z).signum();
            self.add(src.height, x as u16, z as u16);
        }
    }

    /// Peek the head waypoint
    pub fn peek(&self) -> Option<CoordGrid> {
        (self.count > 0).then(|| self.waypoints[self.head])
    }

    fn pop(&mut self) {
        debug_assert!(self.count > 0);
        self.head = (self.head + 1) % MAX_WAYPOINTS;
        self.count -= 1;
    }

    /// Consume one step toward the head waypoint. Degenerate head tiles
    /// equal to `current` are skipped within the same call. Returns the
    /// step direction, `None` when the queue is exhausted, or an error
    /// when the head is not an adjacent tile (session-fatal upstream).
    pub fn advance(&mut self, current: Position) -> Result<Option<Direction>, ProtocolError> {
        loop {
            let head = match self.peek() {
                Some(w) => w,
                None => return Ok(None),
            };

            if head.level() == current.height && head.x() == current.x && head.z() == current.z {
                self.pop();
                continue;
            }

            let dx = head.x() as i32 - current.x as i32;
            let dz = head.z() as i32 - current.z as i32;
            match Direction::from_delta(dx, dz) {
                Some(dir) => {
                    self.pop();
                    return Ok(Some(dir));
                }
                None => {
                    return Err(ProtocolError::ImpossibleStep {
                        x: head.x(),
                        z: head.z(),
                    })
                }
            }
        }
    }
}

impl Default for MovementQueue {
    fn default() -> Self {
        Self::new()
    }
}
