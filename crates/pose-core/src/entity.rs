use std::{
    fmt,
    ops::{Add, Div, Mul, Sub},
};

use serde::{Deserialize, Serialize};

/// Stable key of a tracked entity within a frame.
///
/// Markers use their decimal id (`"7"`), hands use `"hand-<n>"`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn marker(id: u32) -> Self {
        Self(id.to_string())
    }

    pub fn hand(index: usize) -> Self {
        Self(format!("hand-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Sum of per-axis absolute differences.
    pub fn manhattan(self, other: Vec3) -> f64 {
        (self.x - other.x).abs() + (self.y - other.y).abs() + (self.z - other.z).abs()
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Div<f64> for Vec3 {
    type Output = Vec3;

    fn div(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x / rhs, self.y / rhs, self.z / rhs)
    }
}

/// Marker pose: translation in detector units, rotation as Euler angles in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Vec3,
}

impl Pose {
    pub const fn new(position: Vec3, rotation: Vec3) -> Self {
        Self { position, rotation }
    }
}

/// Articulated hand: ordered landmark points plus the classifier label.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hand {
    pub label: String,
    pub landmarks: Vec<Vec3>,
}

impl Hand {
    pub fn centroid(&self) -> Vec3 {
        if self.landmarks.is_empty() {
            return Vec3::ZERO;
        }
        let sum = self
            .landmarks
            .iter()
            .fold(Vec3::ZERO, |acc, point| acc + *point);
        sum / self.landmarks.len() as f64
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Marker(Pose),
    Hand(Hand),
}

impl Entity {
    /// Representative position: marker translation or hand landmark centroid.
    pub fn anchor(&self) -> Vec3 {
        match self {
            Entity::Marker(pose) => pose.position,
            Entity::Hand(hand) => hand.centroid(),
        }
    }

    /// Marker rotation; hands carry no orientation and report zero.
    pub fn orientation(&self) -> Vec3 {
        match self {
            Entity::Marker(pose) => pose.rotation,
            Entity::Hand(_) => Vec3::ZERO,
        }
    }

    pub fn same_kind(&self, other: &Entity) -> bool {
        matches!(
            (self, other),
            (Entity::Marker(_), Entity::Marker(_)) | (Entity::Hand(_), Entity::Hand(_))
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Marker(_) => "marker",
            Entity::Hand(_) => "hand",
        }
    }
}
