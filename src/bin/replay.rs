use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use nalgebra::Vector3;
use serde_json::json;

use terrain_slam::snapshot::{SlamSnapshot, SnapshotWriter};
use terrain_slam::types::{pose_from_parts, wrap_angle, yaw_from_pose};
use terrain_slam::{Point, PointCloud, Pose, SlamConfig, TerrainSlam};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Drive the SLAM core over a synthetic rover traverse", long_about = None)]
struct Args {
    /// Number of odometry/cloud steps to simulate
    #[arg(long, default_value = "60")]
    steps: usize,

    /// Optional JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Optional gzipped session file for the final snapshot
    #[arg(long)]
    session: Option<PathBuf>,

    /// Odometry yaw bias per step (radians), the drift the matchers fight
    #[arg(long, default_value = "0.002")]
    yaw_bias: f64,
}

/// Analytic terrain the synthetic rover drives over.
fn terrain(x: f64, y: f64) -> f64 {
    0.4 * (0.8 * x).sin() * (0.6 * y).cos() + 0.02 * x
}

fn load_config(args: &Args) -> Result<SlamConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let reader = BufReader::new(File::open(path)?);
            serde_json::from_reader(reader)?
        }
        None => SlamConfig {
            map_length: 6.0,
            map_resolution: 0.25,
            global_map_length: 40.0,
            global_map_resolution: 0.5,
            traversed_distance_threshold: 2.0,
            min_slope_threshold: 0.1,
            match_acceptance_threshold: 0.2,
            ..SlamConfig::default()
        },
    };
    if config.rng_seed.is_none() {
        config.rng_seed = Some(1);
    }
    Ok(config)
}

/// Sensor-frame scan of the terrain surrounding the true pose.
fn scan_terrain(true_pose: &Pose) -> PointCloud {
    let inverse = true_pose.inverse();
    let mut cloud = PointCloud::new();
    let cx = true_pose.translation.x;
    let cy = true_pose.translation.y;
    let mut x = cx - 2.5;
    while x <= cx + 2.5 {
        let mut y = cy - 2.5;
        while y <= cy + 2.5 {
            let world = Point::new(x, y, terrain(x, y));
            cloud.push(inverse.transform_point(&world));
            y += 0.2;
        }
        x += 0.2;
    }
    cloud
}

fn global_prior_cloud(config: &SlamConfig) -> PointCloud {
    let half = config.global_map_length / 2.0;
    let step = config.global_map_resolution;
    let mut cloud = PointCloud::new();
    let mut x = -half + step / 2.0;
    while x < half {
        let mut y = -half + step / 2.0;
        while y < half {
            cloud.push(Point::new(x, y, terrain(x, y)));
            y += step;
        }
        x += step;
    }
    cloud
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let mut slam = TerrainSlam::new(config.clone())?;
    slam.create_global_map(&global_prior_cloud(&config), &Pose::identity());

    // The true trajectory arcs gently; reported odometry carries a constant
    // yaw bias so the estimate drifts unless the matchers pull it back.
    let mut true_pose = Pose::identity();
    let step_forward = 0.1;
    let true_yaw_rate = 0.01;

    for _ in 0..args.steps {
        let true_delta = pose_from_parts(
            Vector3::new(step_forward, 0.0, 0.0),
            0.0,
            0.0,
            true_yaw_rate,
        );
        let previous = true_pose;
        true_pose *= true_delta;

        // Odometry reports the map-frame translation delta plus a biased yaw.
        let world_delta = true_pose.translation.vector - previous.translation.vector;
        let delta_yaw = wrap_angle(yaw_from_pose(&true_pose) - yaw_from_pose(&previous));
        let odometry_delta =
            pose_from_parts(world_delta, 0.0, 0.0, delta_yaw + args.yaw_bias);
        slam.pose_callback(&odometry_delta);

        let imu = pose_from_parts(Vector3::zeros(), 0.0, 0.0, yaw_from_pose(&true_pose));
        slam.imu_callback(&imu);

        slam.cloud_callback(&scan_terrain(&true_pose), &Pose::identity());
    }
    slam.shutdown();

    let snapshot = SlamSnapshot::capture(&slam);
    if let Some(path) = &args.session {
        let mut writer = SnapshotWriter::create(path)?;
        writer.write(&snapshot)?;
        writer.finish()?;
        eprintln!("session snapshot written to {}", path.display());
    }

    let estimate = slam.pose();
    let dx = estimate.translation.x - true_pose.translation.x;
    let dy = estimate.translation.y - true_pose.translation.y;
    let summary = json!({
        "steps": args.steps,
        "yaw_bias": args.yaw_bias,
        "true_pose": {
            "x": true_pose.translation.x,
            "y": true_pose.translation.y,
        },
        "estimated_pose": {
            "x": estimate.translation.x,
            "y": estimate.translation.y,
        },
        "planar_error": (dx * dx + dy * dy).sqrt(),
        "local_map_cells": snapshot.local_map.cells.len(),
        "global_map_cells": snapshot.global_map.as_ref().map_or(0, |g| g.cells.len()),
        "particles": snapshot.particles.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
