//! Ownership of the robot's 6-DoF pose.
//!
//! Odometry deltas and IMU orientations arrive asynchronously; both are
//! folded into the particle filter's planar belief, while z, roll and pitch
//! are tracked directly on the pose.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use nalgebra::Vector3;

use crate::config::SlamConfig;
use crate::filters::ParticleFilter;
use crate::types::{
    euler_from_pose, pose_from_parts, wrap_angle, yaw_from_pose, PointCloud, Pose,
};

pub struct PoseEstimation {
    pose: Mutex<Pose>,
    filter: ParticleFilter,
    resample_counter: AtomicUsize,
    resample_frequency: usize,
    imu_yaw_variance: f64,
}

impl PoseEstimation {
    pub fn new(config: &SlamConfig) -> Self {
        let filter = ParticleFilter::new(
            config.num_particles,
            (
                config.initial_sigma_x,
                config.initial_sigma_y,
                config.initial_sigma_yaw,
            ),
            (
                config.predict_sigma_x,
                config.predict_sigma_y,
                config.predict_sigma_yaw,
            ),
            config.rng_seed,
        );
        filter.initialize(0.0, 0.0, 0.0);

        Self {
            pose: Mutex::new(Pose::identity()),
            filter,
            resample_counter: AtomicUsize::new(0),
            resample_frequency: config.resample_frequency,
            imu_yaw_variance: config.imu_yaw_sigma * config.imu_yaw_sigma,
        }
    }

    /// Current pose estimate in the map frame.
    pub fn pose(&self) -> Pose {
        *self.lock_pose()
    }

    /// Particle table snapshot, (num_particles x 4).
    pub fn particles_array(&self) -> ndarray::Array2<f64> {
        self.filter.particles_array()
    }

    /// Re-seeds the planar belief around a known pose.
    pub fn initialize(&self, x: f64, y: f64, yaw: f64) {
        self.filter.initialize(x, y, yaw);
        let (estimate_x, estimate_y, estimate_yaw) = self.filter.estimate();
        let mut pose = self.lock_pose();
        let (roll, pitch, _) = euler_from_pose(&pose);
        let z = pose.translation.z;
        *pose = pose_from_parts(
            Vector3::new(estimate_x, estimate_y, z),
            roll,
            pitch,
            estimate_yaw,
        );
    }

    /// Feeds an odometry delta to the filter and rebuilds the pose: planar
    /// state from the particle estimate, z/roll/pitch from the previous
    /// pose composed with the delta's residual.
    pub fn predict_pose(&self, delta: &Pose) {
        let (delta_roll, delta_pitch, delta_yaw) = euler_from_pose(delta);
        self.filter
            .predict(delta.translation.x, delta.translation.y, delta_yaw);
        let (x, y, yaw) = self.filter.estimate();

        let mut pose = self.lock_pose();
        let (roll, pitch, _) = euler_from_pose(&pose);
        let z = pose.translation.z + delta.translation.z;
        *pose = pose_from_parts(
            Vector3::new(x, y, z),
            wrap_angle(roll + delta_roll),
            wrap_angle(pitch + delta_pitch),
            yaw,
        );
    }

    /// Runs the filter's update step against a scan/map cloud pair, then
    /// refreshes the pose from the new best particle. Resampling happens
    /// once every `resample_frequency` updates.
    pub fn filter_pose(&self, raw_cloud: &PointCloud, map_cloud: &PointCloud) {
        let last_pose = self.pose();
        self.filter.update(&last_pose, raw_cloud, map_cloud);

        let updates = self.resample_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if updates >= self.resample_frequency {
            self.filter.resample();
            self.resample_counter.store(0, Ordering::SeqCst);
        }

        let (x, y, yaw) = self.filter.estimate();
        let mut pose = self.lock_pose();
        let (roll, pitch, _) = euler_from_pose(&pose);
        let z = pose.translation.z;
        *pose = pose_from_parts(Vector3::new(x, y, z), roll, pitch, yaw);
    }

    /// Copies roll and pitch straight from the IMU and fuses yaw as a 1-D
    /// gaussian: the particle spread is the prior variance, the configured
    /// IMU sigma the measurement variance.
    pub fn fuse_imu_orientation(&self, imu_orientation: &Pose) {
        let (imu_roll, imu_pitch, imu_yaw) = euler_from_pose(imu_orientation);
        let prior_variance = self.filter.yaw_spread();

        let mut pose = self.lock_pose();
        let current_yaw = yaw_from_pose(&pose);
        let total_variance = prior_variance + self.imu_yaw_variance;
        let fused_yaw = if total_variance <= f64::MIN_POSITIVE {
            current_yaw
        } else {
            let innovation = wrap_angle(imu_yaw - current_yaw);
            wrap_angle(current_yaw + innovation * prior_variance / total_variance)
        };

        let translation = pose.translation.vector;
        *pose = pose_from_parts(translation, imu_roll, imu_pitch, fused_yaw);
    }

    fn lock_pose(&self) -> MutexGuard<'_, Pose> {
        self.pose.lock().expect("pose mutex poisoned")
    }
}
