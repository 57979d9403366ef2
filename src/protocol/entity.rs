//! Entity definitions
//!
//! Defines the record kinds carried inside a payload: robots, tracked nodes,
//! presenters and headsets, plus the shared subscription types.

use serde::{Deserialize, Serialize};

/// Three-component vector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn from_array([x, y, z]: [f32; 3]) -> Self {
        Self { x, y, z }
    }
}

/// Rotation quaternion, stored w-first on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec4 {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec4 {
    pub const IDENTITY: Vec4 = Vec4 {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn to_array(self) -> [f32; 4] {
        [self.w, self.x, self.y, self.z]
    }

    pub fn from_array([w, x, y, z]: [f32; 4]) -> Self {
        Self { w, x, y, z }
    }
}

/// Oriented bounding volume of a robot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub centre: Vec3,
    pub dimensions: Vec3,
    pub rotation: Vec4,
    /// Treat the box as an ellipsoid inscribed in it
    pub ellipsoid: bool,
}

/// Update categories a recipient can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubscriptionType {
    Environment = 0,
    Headset = 1,
    Robot = 2,
    Node = 3,
    Presenter = 4,
}

impl SubscriptionType {
    pub const ALL: [SubscriptionType; 5] = [
        SubscriptionType::Environment,
        SubscriptionType::Headset,
        SubscriptionType::Robot,
        SubscriptionType::Node,
        SubscriptionType::Presenter,
    ];

    pub fn bit(self) -> u16 {
        1 << self as u8
    }
}

/// Bitfield of subscribed update categories
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionMask(u16);

impl SubscriptionMask {
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn encode(types: &[SubscriptionType]) -> Self {
        Self(types.iter().fold(0, |bits, t| bits | t.bit()))
    }

    /// Known types whose bit is set, in declaration order
    pub fn decode(&self) -> Vec<SubscriptionType> {
        SubscriptionType::ALL
            .into_iter()
            .filter(|t| self.contains(*t))
            .collect()
    }

    pub fn contains(&self, t: SubscriptionType) -> bool {
        self.0 & t.bit() != 0
    }
}

impl std::fmt::Display for SubscriptionMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.decode().iter().map(|t| format!("{:?}", t)).collect();
        write!(f, "0x{:04X} ({})", self.0, names.join(", "))
    }
}

/// How often a subscriber wants updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SubscriptionRate {
    #[default]
    Full = 0,
    Half = 1,
    Quarter = 2,
}

impl SubscriptionRate {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SubscriptionRate::Full),
            1 => Some(SubscriptionRate::Half),
            2 => Some(SubscriptionRate::Quarter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Robot {
    pub id: u64,
    pub name: String,
    pub subscription: SubscriptionMask,
    pub rate: SubscriptionRate,
    pub bounding_box: BoundingBox,
    /// Packed ARGB
    pub colour: u32,
}

/// Tracked pose update
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: u64,
    pub position: Vec3,
    pub rotation: Vec4,
    pub velocity: Vec3,
    /// Tracking error estimate
    pub error: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Presenter {
    pub id: u64,
    pub name: String,
    pub subscription: SubscriptionMask,
    pub rate: SubscriptionRate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Headset {
    pub id: u64,
    pub name: String,
    pub subscription: SubscriptionMask,
    pub rate: SubscriptionRate,
}

/// Union tag for the entity slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntityKind {
    Robot = 1,
    Node = 2,
    Presenter = 3,
    Headset = 4,
}

impl EntityKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EntityKind::Robot),
            2 => Some(EntityKind::Node),
            3 => Some(EntityKind::Presenter),
            4 => Some(EntityKind::Headset),
            _ => None,
        }
    }
}

/// All entity records that can share the union slot
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Robot(Robot),
    Node(Node),
    Presenter(Presenter),
    Headset(Headset),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Robot(_) => EntityKind::Robot,
            Entity::Node(_) => EntityKind::Node,
            Entity::Presenter(_) => EntityKind::Presenter,
            Entity::Headset(_) => EntityKind::Headset,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Entity::Robot(r) => r.id,
            Entity::Node(n) => n.id,
            Entity::Presenter(p) => p.id,
            Entity::Headset(h) => h.id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Entity::Robot(r) => Some(&r.name),
            Entity::Presenter(p) => Some(&p.name),
            Entity::Headset(h) => Some(&h.name),
            Entity::Node(_) => None,
        }
    }
}
