//! Simulation module - Virtual robots orbiting a fixed centre
//!
//! Provides:
//! - Deterministic fleet construction from a base entity id
//! - Orbit position as a function of elapsed time
//! - Registration and update entities for each robot
//! - The scheduler that streams them over a session

mod scheduler;

pub use scheduler::*;

use std::f64::consts::PI;

use crate::protocol::{
    BoundingBox, Entity, Node, Robot, SubscriptionMask, SubscriptionRate, SubscriptionType, Vec3,
    Vec4,
};

/// Vertical bob amplitude in metres
pub const BOB_AMPLITUDE: f64 = 0.05;

/// Packed ARGB colour announced for every robot (opaque green)
pub const ROBOT_COLOUR: u32 = 0xFF00FF00;

/// Bounding box size announced for every robot
pub const ROBOT_DIMENSIONS: Vec3 = Vec3::new(0.5, 0.5, 0.5);

/// Subscriptions requested when a robot registers
pub const ROBOT_SUBSCRIPTIONS: [SubscriptionType; 3] = [
    SubscriptionType::Environment,
    SubscriptionType::Headset,
    SubscriptionType::Robot,
];

/// A simulated robot moving on a horizontal circle
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualRobot {
    pub id: u64,
    pub name: String,
    pub centre: Vec3,
    pub radius: f32,
    /// Radians per second
    pub angular_speed: f32,
    /// Angle at t = 0, radians
    pub phase: f32,
}

impl VirtualRobot {
    /// Build `count` robots with ids starting at `base_id`
    pub fn fleet(count: usize, base_id: u64) -> Vec<Self> {
        (0..count)
            .map(|i| {
                let f = i as f32;
                Self {
                    id: base_id.wrapping_add(i as u64),
                    name: format!("VirtualRobot_{}", i + 1),
                    centre: Vec3::new(-1.5 + 1.5 * f, 1.0 + 0.2 * f, -2.0),
                    radius: 0.5 + 0.3 * f,
                    angular_speed: 0.5 + 0.2 * f,
                    phase: (i as f64 * PI / 4.0) as f32,
                }
            })
            .collect()
    }

    /// Position `t` seconds after streaming started
    pub fn position_at(&self, t: f64) -> Vec3 {
        let theta = f64::from(self.phase) + f64::from(self.angular_speed) * t;
        let radius = f64::from(self.radius);

        Vec3::new(
            (f64::from(self.centre.x) + radius * theta.cos()) as f32,
            (f64::from(self.centre.y) + BOB_AMPLITUDE * (2.0 * theta).sin()) as f32,
            (f64::from(self.centre.z) + radius * theta.sin()) as f32,
        )
    }

    /// Robot record announcing this robot to the server
    pub fn registration(&self, rate: SubscriptionRate) -> Entity {
        Entity::Robot(Robot {
            id: self.id,
            name: self.name.clone(),
            subscription: SubscriptionMask::encode(&ROBOT_SUBSCRIPTIONS),
            rate,
            bounding_box: BoundingBox {
                centre: self.centre,
                dimensions: ROBOT_DIMENSIONS,
                rotation: Vec4::IDENTITY,
                ellipsoid: false,
            },
            colour: ROBOT_COLOUR,
        })
    }

    /// Pose update `t` seconds after streaming started
    pub fn node_update(&self, t: f64) -> Entity {
        Entity::Node(Node {
            id: self.id,
            position: self.position_at(t),
            rotation: Vec4::IDENTITY,
            velocity: Vec3::ZERO,
            error: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a.x - b.x).abs() < 1e-4 && (a.y - b.y).abs() < 1e-4 && (a.z - b.z).abs() < 1e-4
    }

    fn single() -> VirtualRobot {
        VirtualRobot {
            id: 42,
            name: "orbiter".to_string(),
            centre: Vec3::new(0.0, 1.0, -2.0),
            radius: 0.5,
            angular_speed: 0.5,
            phase: 0.0,
        }
    }

    #[test]
    fn test_orbit_starts_on_x_axis() {
        let robot = single();
        assert!(close(robot.position_at(0.0), Vec3::new(0.5, 1.0, -2.0)));
    }

    #[test]
    fn test_orbit_is_periodic() {
        let robot = single();
        let period = 2.0 * PI / f64::from(robot.angular_speed);
        for t in [0.3, 1.7, 5.0] {
            assert!(close(robot.position_at(t), robot.position_at(t + period)));
        }
        // Quarter turn puts the robot on the z axis, bob back at zero
        assert!(close(robot.position_at(period / 4.0), Vec3::new(0.0, 1.0, -1.5)));
    }

    #[test]
    fn test_fleet_offsets() {
        let fleet = VirtualRobot::fleet(3, 100);
        assert_eq!(fleet.len(), 3);

        let third = &fleet[2];
        assert_eq!(third.id, 102);
        assert_eq!(third.name, "VirtualRobot_3");
        assert!(close(third.centre, Vec3::new(1.5, 1.4, -2.0)));
        assert!((third.radius - 1.1).abs() < 1e-6);
        assert!((third.angular_speed - 0.9).abs() < 1e-6);
        assert!((f64::from(third.phase) - PI / 2.0).abs() < 1e-6);

        assert_eq!(VirtualRobot::fleet(2, u64::MAX)[1].id, 0);
        assert!(VirtualRobot::fleet(0, 1).is_empty());
    }

    #[test]
    fn test_registration_record() {
        let robot = single();
        match robot.registration(SubscriptionRate::Half) {
            Entity::Robot(record) => {
                assert_eq!(record.id, 42);
                assert_eq!(record.subscription.bits(), 0x0007);
                assert_eq!(record.rate, SubscriptionRate::Half);
                assert_eq!(record.bounding_box.centre, robot.centre);
                assert_eq!(record.bounding_box.dimensions, ROBOT_DIMENSIONS);
                assert_eq!(record.bounding_box.rotation, Vec4::IDENTITY);
                assert!(!record.bounding_box.ellipsoid);
                assert_eq!(record.colour, ROBOT_COLOUR);
            }
            other => panic!("expected robot, got {:?}", other),
        }
    }

    #[test]
    fn test_node_update_pose() {
        match single().node_update(0.0) {
            Entity::Node(node) => {
                assert_eq!(node.id, 42);
                assert!(close(node.position, Vec3::new(0.5, 1.0, -2.0)));
                assert_eq!(node.velocity, Vec3::ZERO);
                assert_eq!(node.error, 0.0);
            }
            other => panic!("expected node, got {:?}", other),
        }
    }
}
