//! Offline session snapshots for visualization and replay analysis.
//!
//! Serializes the pose, the particle table and the elevation grids into
//! gzipped JSON lines. These files are debugging artifacts, not a
//! compatibility surface.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::mapping::{ElevationMap, MapParameters};
use crate::slam::TerrainSlam;
use crate::types::{euler_from_pose, Pose};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoseSnapshot {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl PoseSnapshot {
    pub fn from_pose(pose: &Pose) -> Self {
        let (roll, pitch, yaw) = euler_from_pose(pose);
        Self {
            x: pose.translation.x,
            y: pose.translation.y,
            z: pose.translation.z,
            roll,
            pitch,
            yaw,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub x: f64,
    pub y: f64,
    pub mean: f64,
    pub variance: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub parameters: MapParameters,
    pub cells: Vec<CellSnapshot>,
}

impl GridSnapshot {
    /// Copies the valid cells of a map into a plain serializable table.
    pub fn from_map(map: &ElevationMap) -> Self {
        let parameters = map.parameters();
        let mut cells = Vec::new();
        for i in 0..parameters.size {
            for j in 0..parameters.size {
                let cell = map.cell(i, j);
                if !cell.valid {
                    continue;
                }
                let (x, y) = map.position_of(i, j);
                cells.push(CellSnapshot {
                    x,
                    y,
                    mean: cell.mean,
                    variance: cell.variance,
                });
            }
        }
        Self { parameters, cells }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlamSnapshot {
    pub timestamp: String,
    pub pose: PoseSnapshot,
    pub particles: Vec<[f64; 4]>,
    pub local_map: GridSnapshot,
    pub global_map: Option<GridSnapshot>,
}

impl SlamSnapshot {
    /// Captures the full observable state of a running core.
    pub fn capture(slam: &TerrainSlam) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            pose: PoseSnapshot::from_pose(&slam.pose()),
            particles: particle_rows(&slam.particles_array()),
            local_map: GridSnapshot::from_map(&slam.local_map()),
            global_map: slam.global_map().as_ref().map(GridSnapshot::from_map),
        }
    }
}

fn particle_rows(table: &Array2<f64>) -> Vec<[f64; 4]> {
    (0..table.nrows())
        .map(|row| {
            [
                table[[row, 0]],
                table[[row, 1]],
                table[[row, 2]],
                table[[row, 3]],
            ]
        })
        .collect()
}

/// Appends snapshots to a gzipped JSON-lines session file.
pub struct SnapshotWriter {
    encoder: GzEncoder<BufWriter<File>>,
}

impl SnapshotWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        Ok(Self { encoder })
    }

    pub fn write(&mut self, snapshot: &SlamSnapshot) -> Result<()> {
        serde_json::to_writer(&mut self.encoder, snapshot)?;
        self.encoder.write_all(b"\n")?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        self.encoder.finish()?;
        Ok(())
    }
}
