//! Geometrically-aided SLAM core for ground robots on uneven terrain.
//!
//! Fuses three asynchronous inputs (odometry deltas, IMU orientation and
//! 3-D range clouds) with an optional coarse global elevation prior, and
//! maintains a 6-DoF pose estimate plus a rolling 2.5-D elevation map
//! centred on the robot.

pub mod cloud;
pub mod config;
pub mod filters;
pub mod mapping;
pub mod pose_correction;
pub mod pose_estimation;
pub mod slam;
pub mod snapshot;
pub mod types;

pub use config::{ConfigError, SlamConfig};
pub use mapping::{ElevationMap, MapParameters};
pub use slam::TerrainSlam;
pub use types::{Particle, Point, PointCloud, Pose};
