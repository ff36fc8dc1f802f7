//! Orchestration of the SLAM core.
//!
//! Three externally-serialized callbacks (odometry, IMU, point cloud) feed
//! the estimator and the local map. Two matchers run as background tasks on
//! a dedicated runtime, at most one in flight per kind: scan-to-local-map
//! matching re-weights the particles, local-to-global-map matching injects
//! drift corrections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use ndarray::Array2;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::cloud;
use crate::config::{ConfigError, SlamConfig};
use crate::mapping::ElevationMap;
use crate::pose_correction::PoseCorrection;
use crate::pose_estimation::PoseEstimation;
use crate::types::{PointCloud, Pose};

pub struct TerrainSlam {
    voxel_size: f64,
    sigma_coeffs: (f64, f64, f64),
    pose_estimation: Arc<PoseEstimation>,
    pose_correction: Arc<PoseCorrection>,
    local_map: Arc<Mutex<ElevationMap>>,
    pose_initialized: AtomicBool,
    runtime: Runtime,
    scan_match_task: Option<JoinHandle<()>>,
    map_match_task: Option<JoinHandle<()>>,
}

impl TerrainSlam {
    /// Validates the configuration and builds every subsystem. The local
    /// map is allocated here once and only translated afterwards.
    pub fn new(config: SlamConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let local_map = ElevationMap::new(
            config.map_length,
            config.map_resolution,
            config.min_elevation,
            config.max_elevation,
        );
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("terrain-slam-matcher")
            .build()
            .expect("failed to start matcher runtime");

        Ok(Self {
            voxel_size: config.voxel_size,
            sigma_coeffs: (
                config.depth_sigma_coeff_1,
                config.depth_sigma_coeff_2,
                config.depth_sigma_coeff_3,
            ),
            pose_estimation: Arc::new(PoseEstimation::new(&config)),
            pose_correction: Arc::new(PoseCorrection::new(&config)),
            local_map: Arc::new(Mutex::new(local_map)),
            pose_initialized: AtomicBool::new(false),
            runtime,
            scan_match_task: None,
            map_match_task: None,
        })
    }

    /// True after the first odometry delta has arrived.
    pub fn is_initialized(&self) -> bool {
        self.pose_initialized.load(Ordering::SeqCst)
    }

    /// Seeds the planar belief around a known starting pose. Does not mark
    /// the system initialized; the first odometry delta does that.
    pub fn initialize_pose(&self, x: f64, y: f64, yaw: f64) {
        self.pose_estimation.initialize(x, y, yaw);
    }

    /// Feeds an incremental odometry pose. On return the pose estimate
    /// reflects the delta and the local map is re-centred on it.
    pub fn pose_callback(&mut self, odometry_delta: &Pose) {
        if !self.pose_initialized.swap(true, Ordering::SeqCst) {
            debug!("first odometry delta received");
        }

        self.pose_estimation.predict_pose(odometry_delta);
        let pose = self.pose_estimation.pose();
        self.lock_local_map().translate(&pose);
    }

    /// Feeds an absolute orientation from the IMU. Ignored until the first
    /// odometry delta has arrived.
    pub fn imu_callback(&mut self, imu_orientation: &Pose) {
        if !self.is_initialized() {
            return;
        }
        self.pose_estimation.fuse_imu_orientation(imu_orientation);
    }

    /// Feeds a sensor-frame cloud plus the body-to-sensor transform: runs
    /// the conditioning pipeline, fuses the result into the local map and
    /// respawns whichever background matchers have finished.
    pub fn cloud_callback(&mut self, raw_cloud: &PointCloud, body_to_sensor: &Pose) {
        if !self.is_initialized() {
            return;
        }

        let pose = self.pose_estimation.pose();
        let map_to_sensor = pose * body_to_sensor;
        let map_params = self.lock_local_map().parameters();

        let (processed, variances) = cloud::process_cloud(
            raw_cloud,
            &pose,
            &map_to_sensor,
            &map_params,
            self.voxel_size,
            self.sigma_coeffs,
        );
        if processed.is_empty() {
            debug!("cloud empty after conditioning, skipping fusion");
            return;
        }

        self.lock_local_map().fuse(&processed, &variances);

        self.spawn_scan_matcher(processed);
        self.spawn_map_matcher();
    }

    /// Builds (or rebuilds) the coarse global prior map.
    pub fn create_global_map(&self, global_cloud: &PointCloud, global_cloud_pose: &Pose) {
        self.pose_correction
            .create_global_map(global_cloud, global_cloud_pose);
    }

    /// Current 6-DoF pose estimate.
    pub fn pose(&self) -> Pose {
        self.pose_estimation.pose()
    }

    /// Snapshot of the local elevation map.
    pub fn local_map(&self) -> ElevationMap {
        self.lock_local_map().clone()
    }

    /// Snapshot of the global map, if one exists.
    pub fn global_map(&self) -> Option<ElevationMap> {
        self.pose_correction.global_map()
    }

    /// Particle table, (num_particles x 4) rows of (x, y, yaw, weight).
    pub fn particles_array(&self) -> Array2<f64> {
        self.pose_estimation.particles_array()
    }

    /// Waits for any in-flight matcher tasks to complete.
    pub fn shutdown(&mut self) {
        for handle in [self.scan_match_task.take(), self.map_match_task.take()]
            .into_iter()
            .flatten()
        {
            let _ = self.runtime.block_on(handle);
        }
    }

    fn spawn_scan_matcher(&mut self, raw_cloud: PointCloud) {
        let ready = self
            .scan_match_task
            .as_ref()
            .map_or(true, JoinHandle::is_finished);
        if !ready {
            return;
        }

        let pose_estimation = Arc::clone(&self.pose_estimation);
        let local_map = Arc::clone(&self.local_map);
        let handle = self.runtime.spawn_blocking(move || {
            // Copy the map out and drop the lock before the expensive
            // cloud matching starts.
            let map_cloud = {
                let map = local_map.lock().expect("local map mutex poisoned");
                cloud::map_to_cloud(&map)
            };
            pose_estimation.filter_pose(&raw_cloud, &map_cloud);
        });
        self.scan_match_task = Some(handle);
    }

    fn spawn_map_matcher(&mut self) {
        let ready = self
            .map_match_task
            .as_ref()
            .map_or(true, JoinHandle::is_finished);
        if !ready {
            return;
        }

        let pose_estimation = Arc::clone(&self.pose_estimation);
        let pose_correction = Arc::clone(&self.pose_correction);
        let local_map = Arc::clone(&self.local_map);
        let handle = self.runtime.spawn_blocking(move || {
            let current_pose = pose_estimation.pose();
            if !pose_correction.distance_criterion_fulfilled(&current_pose) {
                return;
            }

            let snapshot = {
                let map = local_map.lock().expect("local map mutex poisoned");
                map.clone()
            };
            if !pose_correction.feature_criterion_fulfilled(&snapshot) {
                return;
            }

            if let Some(delta) = pose_correction.match_maps(&snapshot, &current_pose) {
                pose_estimation.predict_pose(&delta);
            }
        });
        self.map_match_task = Some(handle);
    }

    fn lock_local_map(&self) -> MutexGuard<'_, ElevationMap> {
        self.local_map.lock().expect("local map mutex poisoned")
    }
}

impl Drop for TerrainSlam {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{pose_from_parts, yaw_from_pose, Point};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn exact_config() -> SlamConfig {
        SlamConfig {
            map_length: 4.0,
            map_resolution: 0.5,
            num_particles: 100,
            initial_sigma_x: 0.0,
            initial_sigma_y: 0.0,
            initial_sigma_yaw: 0.0,
            predict_sigma_x: 0.0,
            predict_sigma_y: 0.0,
            predict_sigma_yaw: 0.0,
            rng_seed: Some(3),
            ..SlamConfig::default()
        }
    }

    fn translation(x: f64, y: f64, z: f64) -> Pose {
        pose_from_parts(Vector3::new(x, y, z), 0.0, 0.0, 0.0)
    }

    fn ground_cloud() -> PointCloud {
        let mut cloud = PointCloud::new();
        for i in 0..6 {
            for j in 0..6 {
                cloud.push(Point::new(
                    -1.4 + 0.5 * i as f64,
                    -1.4 + 0.5 * j as f64,
                    -0.5,
                ));
            }
        }
        cloud
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let config = SlamConfig {
            num_particles: 0,
            ..SlamConfig::default()
        };
        assert!(TerrainSlam::new(config).is_err());
    }

    #[test]
    fn test_identity_motion_keeps_everything_at_origin() {
        let mut slam = TerrainSlam::new(exact_config()).unwrap();
        slam.pose_callback(&Pose::identity());

        let pose = slam.pose();
        assert_relative_eq!(pose.translation.x, 0.0);
        assert_relative_eq!(pose.translation.y, 0.0);
        assert_relative_eq!(pose.translation.z, 0.0);
        assert_relative_eq!(yaw_from_pose(&pose), 0.0);

        let table = slam.particles_array();
        assert_eq!(table.nrows(), 100);
        for row in 0..table.nrows() {
            assert_relative_eq!(table[[row, 0]], 0.0);
            assert_relative_eq!(table[[row, 1]], 0.0);
            assert_relative_eq!(table[[row, 2]], 0.0);
        }
    }

    #[test]
    fn test_pure_translation_moves_pose_and_map() {
        let mut slam = TerrainSlam::new(exact_config()).unwrap();
        slam.pose_callback(&Pose::identity());
        slam.pose_callback(&translation(1.0, 0.0, 0.0));

        let pose = slam.pose();
        assert_relative_eq!(pose.translation.x, 1.0);

        let params = slam.local_map().parameters();
        assert_relative_eq!(params.position_x, 1.0);
        assert_relative_eq!(params.position_y, 0.0);
    }

    #[test]
    fn test_cloud_callback_before_pose_is_ignored() {
        let mut slam = TerrainSlam::new(exact_config()).unwrap();
        slam.cloud_callback(&ground_cloud(), &Pose::identity());
        slam.shutdown();
        assert!(!slam.local_map().is_valid());
    }

    #[test]
    fn test_imu_callback_before_pose_is_ignored() {
        let mut slam = TerrainSlam::new(exact_config()).unwrap();
        let imu = pose_from_parts(Vector3::zeros(), 0.3, 0.2, 0.1);
        slam.imu_callback(&imu);
        let pose = slam.pose();
        assert_relative_eq!(pose.rotation.angle(), 0.0);
    }

    #[test]
    fn test_cloud_callback_fuses_into_local_map() {
        let mut slam = TerrainSlam::new(exact_config()).unwrap();
        slam.pose_callback(&Pose::identity());
        slam.cloud_callback(&ground_cloud(), &Pose::identity());
        slam.shutdown();

        let map = slam.local_map();
        assert!(map.is_valid());
        assert_relative_eq!(map.elevation_at(-1.4, -1.4).unwrap(), -0.5, epsilon = 1e-9);

        // The scan matcher ran against the freshly fused map: every weight
        // must be strictly positive.
        let table = slam.particles_array();
        for row in 0..table.nrows() {
            assert!(table[[row, 3]] > 0.0);
        }
    }

    #[test]
    fn test_empty_cloud_is_a_noop() {
        let mut slam = TerrainSlam::new(exact_config()).unwrap();
        slam.pose_callback(&Pose::identity());
        slam.cloud_callback(&PointCloud::new(), &Pose::identity());
        slam.shutdown();
        assert!(!slam.local_map().is_valid());
    }

    #[test]
    fn test_repeated_cloud_callbacks_respawn_workers() {
        let mut slam = TerrainSlam::new(exact_config()).unwrap();
        slam.pose_callback(&Pose::identity());
        for _ in 0..3 {
            slam.cloud_callback(&ground_cloud(), &Pose::identity());
            slam.shutdown();
        }
        assert!(slam.local_map().is_valid());
        assert_eq!(slam.particles_array().nrows(), 100);
    }

    #[test]
    fn test_global_map_snapshot_round_trip() {
        let mut slam = TerrainSlam::new(exact_config()).unwrap();
        assert!(slam.global_map().is_none());
        slam.pose_callback(&Pose::identity());
        slam.create_global_map(&ground_cloud(), &Pose::identity());
        let global = slam.global_map().expect("global map missing");
        assert!(global.is_valid());
    }

    #[test]
    fn test_pose_reflects_latest_input_on_return() {
        let mut slam = TerrainSlam::new(exact_config()).unwrap();
        slam.pose_callback(&translation(0.5, -0.5, 0.25));
        let pose = slam.pose();
        assert_relative_eq!(pose.translation.x, 0.5);
        assert_relative_eq!(pose.translation.y, -0.5);
        assert_relative_eq!(pose.translation.z, 0.25);
    }
}
