use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a configuration value cannot drive the pipeline.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("map geometry must be positive (length={length}, resolution={resolution})")]
    InvalidMapGeometry { length: f64, resolution: f64 },

    #[error("elevation band is empty (min={min}, max={max})")]
    EmptyElevationBand { min: f64, max: f64 },

    #[error("voxel size must be positive (got {0})")]
    InvalidVoxelSize(f64),

    #[error("particle count must be positive")]
    NoParticles,

    #[error("resample frequency must be positive")]
    NoResampleFrequency,

    #[error("sigma values must be non-negative (got {name}={value})")]
    NegativeSigma { name: &'static str, value: f64 },

    #[error("yaw matching enabled but yaw step is not positive (got {0})")]
    InvalidYawStep(f64),
}

/// Full configuration of the SLAM core.
///
/// One flat struct covering all four subsystems; `validate` runs once at
/// construction and is the only fatal error path in the crate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    // ── Local map geometry ──
    pub map_length: f64,
    pub map_resolution: f64,
    /// Lower crop bound, relative to the robot's current z.
    pub min_elevation: f64,
    /// Upper crop bound, relative to the robot's current z.
    pub max_elevation: f64,

    // ── Cloud conditioning ──
    pub voxel_size: f64,
    pub depth_sigma_coeff_1: f64,
    pub depth_sigma_coeff_2: f64,
    pub depth_sigma_coeff_3: f64,

    // ── Particle filter ──
    pub num_particles: usize,
    /// Filter iterations between resampling passes.
    pub resample_frequency: usize,
    pub initial_sigma_x: f64,
    pub initial_sigma_y: f64,
    pub initial_sigma_yaw: f64,
    pub predict_sigma_x: f64,
    pub predict_sigma_y: f64,
    pub predict_sigma_yaw: f64,
    /// Fixed seed for the filter RNG; None draws from entropy.
    pub rng_seed: Option<u64>,

    // ── IMU fusion ──
    /// Measurement sigma applied to the IMU yaw during gaussian fusion.
    pub imu_yaw_sigma: f64,

    // ── Pose correction ──
    pub traversed_distance_threshold: f64,
    pub min_slope_threshold: f64,
    pub slope_sum_threshold_multiplier: f64,
    pub match_acceptance_threshold: f64,
    pub match_yaw: bool,
    pub match_yaw_range: f64,
    pub match_yaw_step: f64,
    pub global_map_length: f64,
    pub global_map_resolution: f64,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            map_length: 10.0,
            map_resolution: 0.05,
            min_elevation: -5.0,
            max_elevation: 5.0,
            voxel_size: 0.025,
            depth_sigma_coeff_1: 0.001063,
            depth_sigma_coeff_2: 0.003949,
            depth_sigma_coeff_3: 0.1,
            num_particles: 100,
            resample_frequency: 10,
            initial_sigma_x: 0.0,
            initial_sigma_y: 0.0,
            initial_sigma_yaw: 0.0,
            predict_sigma_x: 0.05,
            predict_sigma_y: 0.05,
            predict_sigma_yaw: 0.05,
            rng_seed: None,
            imu_yaw_sigma: 0.1,
            traversed_distance_threshold: 5.0,
            min_slope_threshold: 0.5,
            slope_sum_threshold_multiplier: 0.01,
            match_acceptance_threshold: 0.3,
            match_yaw: false,
            match_yaw_range: 0.26,
            match_yaw_step: 0.035,
            global_map_length: 100.0,
            global_map_resolution: 1.0,
        }
    }
}

impl SlamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.map_length <= 0.0 || self.map_resolution <= 0.0 {
            return Err(ConfigError::InvalidMapGeometry {
                length: self.map_length,
                resolution: self.map_resolution,
            });
        }
        if self.global_map_length <= 0.0 || self.global_map_resolution <= 0.0 {
            return Err(ConfigError::InvalidMapGeometry {
                length: self.global_map_length,
                resolution: self.global_map_resolution,
            });
        }
        if self.min_elevation >= self.max_elevation {
            return Err(ConfigError::EmptyElevationBand {
                min: self.min_elevation,
                max: self.max_elevation,
            });
        }
        if self.voxel_size <= 0.0 {
            return Err(ConfigError::InvalidVoxelSize(self.voxel_size));
        }
        if self.num_particles == 0 {
            return Err(ConfigError::NoParticles);
        }
        if self.resample_frequency == 0 {
            return Err(ConfigError::NoResampleFrequency);
        }
        for (name, value) in [
            ("initial_sigma_x", self.initial_sigma_x),
            ("initial_sigma_y", self.initial_sigma_y),
            ("initial_sigma_yaw", self.initial_sigma_yaw),
            ("predict_sigma_x", self.predict_sigma_x),
            ("predict_sigma_y", self.predict_sigma_y),
            ("predict_sigma_yaw", self.predict_sigma_yaw),
            ("imu_yaw_sigma", self.imu_yaw_sigma),
        ] {
            if value < 0.0 {
                return Err(ConfigError::NegativeSigma { name, value });
            }
        }
        if self.match_yaw && self.match_yaw_step <= 0.0 {
            return Err(ConfigError::InvalidYawStep(self.match_yaw_step));
        }
        Ok(())
    }
}
