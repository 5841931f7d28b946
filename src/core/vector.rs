//! World Vectors
//!
//! Integer block/chunk positions and floating-point entity positions.

use serde::{Serialize, Deserialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Integer 3D vector used for block positions and chunk addresses.
///
/// Implements Ord so it can key a BTreeMap (stable iteration order for
/// modify-list replay and persistence).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vector3 {
    /// X component
    pub x: i32,
    /// Y component (up)
    pub y: i32,
    /// Z component
    pub z: i32,
}

impl Vector3 {
    /// Zero vector.
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };

    /// Create a new vector.
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

impl Add for Vector3 {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Vector3 {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Floating-point 3D vector for player position and orientation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3f {
    /// X component
    pub x: f64,
    /// Y component
    pub y: f64,
    /// Z component
    pub z: f64,
}

impl Vec3f {
    /// Create a new vector.
    #[inline]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}
