//! Drift correction against a prebuilt global elevation map.
//!
//! Corrections are expensive and easily fooled by featureless terrain, so
//! two gates run before any matching: enough distance travelled since the
//! last accepted match, and enough slope structure in the local map.

use std::sync::{Mutex, MutexGuard};

use log::{debug, info};
use nalgebra::Vector3;

use crate::cloud::transform_cloud;
use crate::config::SlamConfig;
use crate::mapping::ElevationMap;
use crate::types::{planar_distance, pose_from_parts, PointCloud, Pose};

pub struct PoseCorrection {
    global_map: Mutex<Option<ElevationMap>>,
    last_match_pose: Mutex<Option<Pose>>,
    traversed_distance_threshold: f64,
    min_slope_threshold: f64,
    slope_sum_threshold_multiplier: f64,
    match_acceptance_threshold: f64,
    match_yaw: bool,
    match_yaw_range: f64,
    match_yaw_step: f64,
    global_map_length: f64,
    global_map_resolution: f64,
    min_elevation: f64,
    max_elevation: f64,
}

impl PoseCorrection {
    pub fn new(config: &SlamConfig) -> Self {
        Self {
            global_map: Mutex::new(None),
            last_match_pose: Mutex::new(None),
            traversed_distance_threshold: config.traversed_distance_threshold,
            min_slope_threshold: config.min_slope_threshold,
            slope_sum_threshold_multiplier: config.slope_sum_threshold_multiplier,
            match_acceptance_threshold: config.match_acceptance_threshold,
            match_yaw: config.match_yaw,
            match_yaw_range: config.match_yaw_range,
            match_yaw_step: config.match_yaw_step,
            global_map_length: config.global_map_length,
            global_map_resolution: config.global_map_resolution,
            min_elevation: config.min_elevation,
            max_elevation: config.max_elevation,
        }
    }

    /// Rasterizes a prior cloud into the coarse global grid. Subsequent
    /// calls rebuild and replace the map.
    pub fn create_global_map(&self, global_cloud: &PointCloud, global_cloud_pose: &Pose) {
        let transformed = transform_cloud(global_cloud, global_cloud_pose);

        let mut map = ElevationMap::new(
            self.global_map_length,
            self.global_map_resolution,
            self.min_elevation,
            self.max_elevation,
        );
        map.translate(global_cloud_pose);
        let variances = vec![1.0; transformed.len()];
        map.fuse(&transformed, &variances);

        info!(
            "global map created: {} valid cells at resolution {}",
            map.valid_cell_count(),
            self.global_map_resolution
        );
        *self.lock_global_map() = Some(map);
    }

    /// Snapshot of the global map, if one has been created.
    pub fn global_map(&self) -> Option<ElevationMap> {
        self.lock_global_map().clone()
    }

    /// True once the robot has travelled far enough from the last accepted
    /// match. The first call anchors the reference pose and returns false.
    pub fn distance_criterion_fulfilled(&self, current_pose: &Pose) -> bool {
        let mut last = self.lock_last_match_pose();
        match last.as_ref() {
            None => {
                *last = Some(*current_pose);
                false
            }
            Some(reference) => {
                planar_distance(current_pose, reference) > self.traversed_distance_threshold
            }
        }
    }

    /// True when the local map carries enough slope structure to align.
    /// Flat scenes would match anywhere and must be skipped.
    pub fn feature_criterion_fulfilled(&self, local_map: &ElevationMap) -> bool {
        let params = local_map.parameters();
        let size = params.size;
        if size < 3 {
            return false;
        }

        let mut steep_cells = 0usize;
        for i in 1..size - 1 {
            for j in 1..size - 1 {
                let left = local_map.cell(i - 1, j);
                let right = local_map.cell(i + 1, j);
                let below = local_map.cell(i, j - 1);
                let above = local_map.cell(i, j + 1);
                if !(left.valid && right.valid && below.valid && above.valid) {
                    continue;
                }
                let dzdx = (right.mean - left.mean) / (2.0 * params.resolution);
                let dzdy = (above.mean - below.mean) / (2.0 * params.resolution);
                let slope = (dzdx * dzdx + dzdy * dzdy).sqrt();
                if slope > self.min_slope_threshold {
                    steep_cells += 1;
                }
            }
        }

        let fulfilled = steep_cells as f64
            > self.slope_sum_threshold_multiplier * (size * size) as f64;
        if !fulfilled {
            debug!("feature criterion not met: {steep_cells} steep cells");
        }
        fulfilled
    }

    /// Template-matches the local map over the global grid and returns the
    /// correction delta when the best placement scores below the acceptance
    /// threshold.
    ///
    /// Candidate centres step at global-map resolution; yaw sweeps
    /// [-match_yaw_range, +match_yaw_range] when enabled. The score is the
    /// mean absolute elevation difference over overlapping valid cells, and
    /// the first of equally-scored placements wins.
    pub fn match_maps(&self, local_map: &ElevationMap, current_pose: &Pose) -> Option<Pose> {
        let guard = self.lock_global_map();
        let global = guard.as_ref()?;

        let local_params = local_map.parameters();
        let offsets: Vec<(f64, f64, f64)> = local_map
            .iter_valid()
            .map(|(x, y, z)| {
                (
                    x - local_params.position_x,
                    y - local_params.position_y,
                    z,
                )
            })
            .collect();
        if offsets.is_empty() {
            return None;
        }
        // Placements covering less than a quarter of the local cells say
        // more about the window edge than about alignment.
        let min_overlap = (offsets.len() / 4).max(1);

        let global_params = global.parameters();
        let mut best: Option<(f64, f64, f64, f64)> = None;

        for yaw in self.yaw_candidates() {
            let (sin_yaw, cos_yaw) = yaw.sin_cos();
            let rotated: Vec<(f64, f64, f64)> = offsets
                .iter()
                .map(|&(dx, dy, z)| {
                    (dx * cos_yaw - dy * sin_yaw, dx * sin_yaw + dy * cos_yaw, z)
                })
                .collect();

            for i in 0..global_params.size {
                for j in 0..global_params.size {
                    let (candidate_x, candidate_y) = global.position_of(i, j);
                    let mut difference_sum = 0.0;
                    let mut overlap = 0usize;
                    for &(dx, dy, z) in &rotated {
                        if let Some(elevation) =
                            global.elevation_at(candidate_x + dx, candidate_y + dy)
                        {
                            difference_sum += (z - elevation).abs();
                            overlap += 1;
                        }
                    }
                    if overlap < min_overlap {
                        continue;
                    }
                    let score = difference_sum / overlap as f64;
                    if best.map_or(true, |(best_score, ..)| score < best_score) {
                        best = Some((score, candidate_x, candidate_y, yaw));
                    }
                }
            }
        }

        let (score, matched_x, matched_y, matched_yaw) = best?;
        if score >= self.match_acceptance_threshold {
            debug!("map-to-map match rejected: best score {score:.4}");
            return None;
        }

        *self.lock_last_match_pose() = Some(*current_pose);
        let delta = pose_from_parts(
            Vector3::new(
                matched_x - local_params.position_x,
                matched_y - local_params.position_y,
                0.0,
            ),
            0.0,
            0.0,
            matched_yaw,
        );
        info!(
            "map-to-map correction accepted: score {:.4}, delta ({:.2}, {:.2}, {:.3})",
            score,
            delta.translation.x,
            delta.translation.y,
            matched_yaw
        );
        Some(delta)
    }

    fn yaw_candidates(&self) -> Vec<f64> {
        if !self.match_yaw {
            return vec![0.0];
        }
        let steps = (self.match_yaw_range / self.match_yaw_step).floor() as i64;
        (-steps..=steps)
            .map(|step| step as f64 * self.match_yaw_step)
            .collect()
    }

    fn lock_global_map(&self) -> MutexGuard<'_, Option<ElevationMap>> {
        self.global_map.lock().expect("global map mutex poisoned")
    }

    fn lock_last_match_pose(&self) -> MutexGuard<'_, Option<Pose>> {
        self.last_match_pose
            .lock()
            .expect("last match pose mutex poisoned")
    }
}
