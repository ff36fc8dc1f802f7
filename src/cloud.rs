//! Point-cloud conditioning and cloud-level primitives.
//!
//! The pipeline runs in a fixed order: voxel downsample, transform into the
//! map frame, crop to the local map's active window, per-point depth
//! variance. Depth is measured in the sensor frame, so ranges are captured
//! before the transform is applied.

use std::collections::HashMap;

use nalgebra::Vector3;
use rstar::RTree;

use crate::mapping::{ElevationMap, MapParameters};
use crate::types::{Point, PointCloud, Pose};

/// Output of the conditioning pipeline: a map-frame cloud and the
/// index-aligned variance of each surviving point.
pub fn process_cloud(
    input: &PointCloud,
    robot_pose: &Pose,
    map_to_sensor: &Pose,
    map_params: &MapParameters,
    voxel_size: f64,
    sigma_coeffs: (f64, f64, f64),
) -> (PointCloud, Vec<f64>) {
    let downsampled = downsample_cloud(input, voxel_size);
    let ranges: Vec<f64> = downsampled.iter().map(|point| point.coords.norm()).collect();
    let transformed = transform_cloud(&downsampled, map_to_sensor);

    let (min, max) = crop_bounds(robot_pose, map_params);
    let (c1, c2, c3) = sigma_coeffs;

    let mut cloud = PointCloud::with_capacity(transformed.len());
    let mut variances = Vec::with_capacity(transformed.len());
    for (point, range) in transformed.iter().zip(ranges) {
        if !point_in_box(point, &min, &max) {
            continue;
        }
        let sigma = c1 * range * range + c2 * range + c3;
        cloud.push(*point);
        variances.push(sigma * sigma);
    }
    (cloud, variances)
}

/// Cubic voxel filter; each occupied voxel is replaced by the centroid of
/// its members. Output ordering is unspecified.
pub fn downsample_cloud(cloud: &PointCloud, voxel_size: f64) -> PointCloud {
    if cloud.is_empty() {
        return PointCloud::new();
    }

    let mut voxels: HashMap<(i64, i64, i64), (Vector3<f64>, usize)> = HashMap::new();
    for point in cloud.iter() {
        let key = (
            (point.x / voxel_size).floor() as i64,
            (point.y / voxel_size).floor() as i64,
            (point.z / voxel_size).floor() as i64,
        );
        let entry = voxels.entry(key).or_insert((Vector3::zeros(), 0));
        entry.0 += point.coords;
        entry.1 += 1;
    }

    voxels
        .into_values()
        .map(|(sum, count)| Point::from(sum / count as f64))
        .collect()
}

/// Applies a rigid transform to every point; identity transforms are a copy.
pub fn transform_cloud(cloud: &PointCloud, pose: &Pose) -> PointCloud {
    if *pose == Pose::identity() {
        return cloud.clone();
    }
    cloud.iter().map(|point| pose.transform_point(point)).collect()
}

/// Axis-aligned crop; points outside [min, max] are discarded.
pub fn crop_cloud(cloud: &PointCloud, min: &Vector3<f64>, max: &Vector3<f64>) -> PointCloud {
    cloud
        .iter()
        .filter(|point| point_in_box(point, min, max))
        .copied()
        .collect()
}

/// One point per valid cell of an elevation map.
pub fn map_to_cloud(map: &ElevationMap) -> PointCloud {
    if !map.is_valid() {
        return PointCloud::new();
    }
    map.iter_valid()
        .map(|(x, y, z)| Point::new(x, y, z))
        .collect()
}

/// Mean squared nearest-neighbour distance from `source` into `target`.
/// Lower is better; 0.0 means identical overlap (or an empty source).
pub fn cloud_fitness(source: &PointCloud, target: &PointCloud) -> f64 {
    if source.is_empty() || target.is_empty() {
        return 0.0;
    }

    let tree = RTree::bulk_load(
        target
            .iter()
            .map(|point| [point.x, point.y, point.z])
            .collect(),
    );

    let sum: f64 = source
        .iter()
        .map(|point| {
            let query = [point.x, point.y, point.z];
            match tree.nearest_neighbor(&query) {
                Some(nearest) => squared_distance(nearest, &query),
                None => 0.0,
            }
        })
        .sum();

    sum / source.len() as f64
}

fn crop_bounds(robot_pose: &Pose, params: &MapParameters) -> (Vector3<f64>, Vector3<f64>) {
    let robot_z = robot_pose.translation.z;
    let half = params.length / 2.0;
    (
        Vector3::new(
            params.position_x - half,
            params.position_y - half,
            robot_z + params.min_elevation,
        ),
        Vector3::new(
            params.position_x + half,
            params.position_y + half,
            robot_z + params.max_elevation,
        ),
    )
}

fn point_in_box(point: &Point, min: &Vector3<f64>, max: &Vector3<f64>) -> bool {
    point.x >= min.x
        && point.x <= max.x
        && point.y >= min.y
        && point.y <= max.y
        && point.z >= min.z
        && point.z <= max.z
}

fn squared_distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}
