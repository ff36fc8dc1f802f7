//! Euler-angle helpers for pose composition and yaw arithmetic.
//!
//! Yaw is handled as a local-linear quantity: deltas are wrapped into
//! (-pi, pi] before use, but no full SO(2) manifold treatment is applied.

use nalgebra::{Translation3, UnitQuaternion, Vector3};

use super::Pose;

/// Wraps an angle into (-pi, pi].
pub fn wrap_angle(angle: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut wrapped = angle % two_pi;
    if wrapped > std::f64::consts::PI {
        wrapped -= two_pi;
    } else if wrapped <= -std::f64::consts::PI {
        wrapped += two_pi;
    }
    wrapped
}

/// Builds a pose from a translation vector and intrinsic roll/pitch/yaw.
pub fn pose_from_parts(translation: Vector3<f64>, roll: f64, pitch: f64, yaw: f64) -> Pose {
    Pose::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_euler_angles(roll, pitch, yaw),
    )
}

/// Extracts (roll, pitch, yaw) from a pose.
pub fn euler_from_pose(pose: &Pose) -> (f64, f64, f64) {
    pose.rotation.euler_angles()
}

/// Yaw component of a pose's rotation.
pub fn yaw_from_pose(pose: &Pose) -> f64 {
    euler_from_pose(pose).2
}

/// Euclidean distance between two poses projected on the ground plane.
pub fn planar_distance(a: &Pose, b: &Pose) -> f64 {
    let dx = a.translation.x - b.translation.x;
    let dy = a.translation.y - b.translation.y;
    (dx * dx + dy * dy).sqrt()
}
