//! Core geometric types shared across the SLAM pipeline.
//!
//! Poses are rigid 6-DoF transforms expressed in the fixed map frame;
//! point clouds are plain buffers of map- or sensor-frame points.

pub mod angles;

pub use angles::*;

use nalgebra::{Isometry3, Point3};

/// Rigid 6-DoF transform (3-D translation + 3-D rotation).
pub type Pose = Isometry3<f64>;

/// A single 3-D range measurement.
pub type Point = Point3<f64>;

/// Unorganized 3-D point cloud.
#[derive(Clone, Debug, Default)]
pub struct PointCloud {
    pub points: Vec<Point>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn from_points(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }
}

impl FromIterator<Point> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

/// Planar (x, y, yaw) pose hypothesis with an unnormalized weight.
#[derive(Clone, Copy, Debug)]
pub struct Particle {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    pub weight: f64,
}

impl Default for Particle {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            yaw: 0.0,
            weight: 1.0,
        }
    }
}
