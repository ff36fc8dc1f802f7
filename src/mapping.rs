//! Rolling 2.5-D elevation grid with per-cell gaussian fusion.
//!
//! The grid is axis-aligned and centred near the robot. Translating the map
//! moves `start_index` instead of the cell data, so cells that stay inside
//! the footprint keep their state without any copying.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::types::{PointCloud, Pose};

/// Geometry of an elevation grid.
///
/// `position_x`/`position_y` anchor the grid centre in world coordinates;
/// `min_elevation`/`max_elevation` are offsets relative to the robot's z.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MapParameters {
    pub length: f64,
    pub resolution: f64,
    pub min_elevation: f64,
    pub max_elevation: f64,
    pub position_x: f64,
    pub position_y: f64,
    pub size: usize,
}

impl MapParameters {
    pub fn new(length: f64, resolution: f64, min_elevation: f64, max_elevation: f64) -> Self {
        Self {
            length,
            resolution,
            min_elevation,
            max_elevation,
            position_x: 0.0,
            position_y: 0.0,
            size: (length / resolution).round() as usize,
        }
    }

    fn origin(&self) -> (f64, f64) {
        (
            self.position_x - self.length / 2.0,
            self.position_y - self.length / 2.0,
        )
    }
}

/// Per-cell gaussian elevation state.
#[derive(Clone, Copy, Debug)]
pub struct Cell {
    pub mean: f64,
    pub variance: f64,
    pub valid: bool,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            mean: 0.0,
            variance: 0.0,
            valid: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ElevationMap {
    params: MapParameters,
    cells: Array2<Cell>,
    start_index: (usize, usize),
    has_data: bool,
}

impl ElevationMap {
    pub fn new(length: f64, resolution: f64, min_elevation: f64, max_elevation: f64) -> Self {
        let params = MapParameters::new(length, resolution, min_elevation, max_elevation);
        let cells = Array2::from_elem((params.size, params.size), Cell::default());
        Self {
            params,
            cells,
            start_index: (0, 0),
            has_data: false,
        }
    }

    pub fn parameters(&self) -> MapParameters {
        self.params
    }

    /// True once any fuse call has produced a valid cell.
    pub fn is_valid(&self) -> bool {
        self.has_data
    }

    /// Cell at logical grid index (column along x, row along y).
    pub fn cell(&self, i: usize, j: usize) -> &Cell {
        let (di, dj) = self.data_index(i, j);
        &self.cells[[di, dj]]
    }

    /// Grid index of the cell whose centre lies within resolution/2 of (x, y).
    pub fn index_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (origin_x, origin_y) = self.params.origin();
        let i = ((x - origin_x) / self.params.resolution).floor();
        let j = ((y - origin_y) / self.params.resolution).floor();
        let size = self.params.size as f64;
        if i < 0.0 || j < 0.0 || i >= size || j >= size {
            return None;
        }
        Some((i as usize, j as usize))
    }

    /// World position of the centre of cell (i, j).
    pub fn position_of(&self, i: usize, j: usize) -> (f64, f64) {
        let (origin_x, origin_y) = self.params.origin();
        (
            origin_x + (i as f64 + 0.5) * self.params.resolution,
            origin_y + (j as f64 + 0.5) * self.params.resolution,
        )
    }

    /// Elevation of the cell containing (x, y), if that cell is valid.
    pub fn elevation_at(&self, x: f64, y: f64) -> Option<f64> {
        let (i, j) = self.index_of(x, y)?;
        let cell = self.cell(i, j);
        cell.valid.then_some(cell.mean)
    }

    /// Re-centres the grid on the pose, snapped to the resolution lattice.
    ///
    /// Cells that remain inside the new footprint keep their state; cells
    /// entering it are reset. Translating to the same snapped position is a
    /// no-op.
    pub fn translate(&mut self, pose: &Pose) {
        let res = self.params.resolution;
        let target_x = (pose.translation.x / res).round() * res;
        let target_y = (pose.translation.y / res).round() * res;

        let shift_i = ((target_x - self.params.position_x) / res).round() as i64;
        let shift_j = ((target_y - self.params.position_y) / res).round() as i64;
        if shift_i == 0 && shift_j == 0 {
            return;
        }

        self.params.position_x = target_x;
        self.params.position_y = target_y;

        let size = self.params.size as i64;
        if shift_i.abs() >= size || shift_j.abs() >= size {
            self.cells.fill(Cell::default());
            self.start_index = (0, 0);
            return;
        }

        self.start_index = (
            (self.start_index.0 as i64 + shift_i).rem_euclid(size) as usize,
            (self.start_index.1 as i64 + shift_j).rem_euclid(size) as usize,
        );

        let size = self.params.size;
        if shift_i > 0 {
            self.reset_columns(size - shift_i as usize, size);
        } else if shift_i < 0 {
            self.reset_columns(0, (-shift_i) as usize);
        }
        if shift_j > 0 {
            self.reset_rows(size - shift_j as usize, size);
        } else if shift_j < 0 {
            self.reset_rows(0, (-shift_j) as usize);
        }
    }

    /// Fuses a map-frame cloud with per-point variances into the grid.
    ///
    /// The first observation of a cell is an assignment; subsequent
    /// observations are gaussian-fused, so a touched cell's variance never
    /// increases.
    pub fn fuse(&mut self, cloud: &PointCloud, variances: &[f64]) {
        debug_assert_eq!(cloud.len(), variances.len());

        for (point, &variance) in cloud.iter().zip(variances.iter()) {
            let Some((i, j)) = self.index_of(point.x, point.y) else {
                continue;
            };
            // A zero-variance input would pin the cell and poison later fusions.
            let vp = variance.max(f64::MIN_POSITIVE);
            let (di, dj) = self.data_index(i, j);
            let cell = &mut self.cells[[di, dj]];

            if !cell.valid {
                cell.mean = point.z;
                cell.variance = vp;
                cell.valid = true;
            } else {
                let v = cell.variance;
                cell.mean = (cell.mean * vp + point.z * v) / (v + vp);
                cell.variance = v * vp / (v + vp);
            }
            self.has_data = true;
        }
    }

    /// Iterates valid cells as world (x, y, mean elevation).
    pub fn iter_valid(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        let size = self.params.size;
        (0..size).flat_map(move |i| {
            (0..size).filter_map(move |j| {
                let cell = self.cell(i, j);
                if cell.valid {
                    let (x, y) = self.position_of(i, j);
                    Some((x, y, cell.mean))
                } else {
                    None
                }
            })
        })
    }

    pub fn valid_cell_count(&self) -> usize {
        self.cells.iter().filter(|cell| cell.valid).count()
    }

    fn data_index(&self, i: usize, j: usize) -> (usize, usize) {
        let size = self.params.size;
        ((self.start_index.0 + i) % size, (self.start_index.1 + j) % size)
    }

    fn reset_columns(&mut self, from: usize, to: usize) {
        for i in from..to {
            for j in 0..self.params.size {
                let (di, dj) = self.data_index(i, j);
                self.cells[[di, dj]] = Cell::default();
            }
        }
    }

    fn reset_rows(&mut self, from: usize, to: usize) {
        for j in from..to {
            for i in 0..self.params.size {
                let (di, dj) = self.data_index(i, j);
                self.cells[[di, dj]] = Cell::default();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{pose_from_parts, Point};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn planar_pose(x: f64, y: f64) -> Pose {
        pose_from_parts(Vector3::new(x, y, 0.0), 0.0, 0.0, 0.0)
    }

    fn single_point_cloud(x: f64, y: f64, z: f64) -> PointCloud {
        PointCloud::from_points(vec![Point::new(x, y, z)])
    }

    #[test]
    fn test_new_map_has_no_valid_cells() {
        let map = ElevationMap::new(2.0, 1.0, -1.0, 1.0);
        assert!(!map.is_valid());
        assert_eq!(map.valid_cell_count(), 0);
        assert_eq!(map.parameters().size, 2);
    }

    #[test]
    fn test_first_observation_is_assignment() {
        let mut map = ElevationMap::new(2.0, 1.0, -1.0, 1.0);
        map.fuse(&single_point_cloud(0.0, 0.0, 5.0), &[1.0]);

        assert!(map.is_valid());
        let (i, j) = map.index_of(0.0, 0.0).unwrap();
        let cell = map.cell(i, j);
        assert!(cell.valid);
        assert_relative_eq!(cell.mean, 5.0);
        assert_relative_eq!(cell.variance, 1.0);
        assert_eq!(map.valid_cell_count(), 1);
    }

    #[test]
    fn test_second_observation_fuses() {
        let mut map = ElevationMap::new(2.0, 1.0, -1.0, 1.0);
        map.fuse(&single_point_cloud(0.0, 0.0, 5.0), &[1.0]);
        map.fuse(&single_point_cloud(0.0, 0.0, 7.0), &[1.0]);

        let (i, j) = map.index_of(0.0, 0.0).unwrap();
        let cell = map.cell(i, j);
        assert_relative_eq!(cell.mean, 6.0);
        assert_relative_eq!(cell.variance, 0.5);
    }

    #[test]
    fn test_same_call_points_fuse_sequentially() {
        let mut map = ElevationMap::new(2.0, 1.0, -1.0, 1.0);
        let cloud = PointCloud::from_points(vec![
            Point::new(0.0, 0.0, 5.0),
            Point::new(0.0, 0.0, 7.0),
        ]);
        map.fuse(&cloud, &[1.0, 1.0]);

        let (i, j) = map.index_of(0.0, 0.0).unwrap();
        assert_relative_eq!(map.cell(i, j).mean, 6.0);
        assert_relative_eq!(map.cell(i, j).variance, 0.5);
    }

    #[test]
    fn test_variance_never_increases() {
        let mut map = ElevationMap::new(2.0, 1.0, -1.0, 1.0);
        map.fuse(&single_point_cloud(0.0, 0.0, 1.0), &[2.0]);
        let (i, j) = map.index_of(0.0, 0.0).unwrap();
        let mut last = map.cell(i, j).variance;
        for _ in 0..5 {
            map.fuse(&single_point_cloud(0.0, 0.0, 2.0), &[3.0]);
            let variance = map.cell(i, j).variance;
            assert!(variance <= last);
            last = variance;
        }
    }

    #[test]
    fn test_points_outside_grid_are_ignored() {
        let mut map = ElevationMap::new(2.0, 1.0, -1.0, 1.0);
        map.fuse(&single_point_cloud(10.0, 10.0, 1.0), &[1.0]);
        assert!(!map.is_valid());
    }

    #[test]
    fn test_translate_snaps_to_resolution() {
        let mut map = ElevationMap::new(4.0, 0.5, -1.0, 1.0);
        map.translate(&planar_pose(1.26, -0.74));
        let params = map.parameters();
        assert_relative_eq!(params.position_x, 1.5);
        assert_relative_eq!(params.position_y, -0.5);
    }

    #[test]
    fn test_translate_is_idempotent() {
        let mut map = ElevationMap::new(4.0, 1.0, -1.0, 1.0);
        map.fuse(&single_point_cloud(0.5, 0.5, 2.0), &[1.0]);
        map.translate(&planar_pose(1.0, 0.0));
        let after_first: Vec<_> = map.iter_valid().collect();
        map.translate(&planar_pose(1.0, 0.0));
        let after_second: Vec<_> = map.iter_valid().collect();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_translate_preserves_retained_cells() {
        let mut map = ElevationMap::new(4.0, 1.0, -1.0, 1.0);
        map.fuse(&single_point_cloud(0.5, 0.5, 2.0), &[0.25]);

        map.translate(&planar_pose(1.0, 1.0));

        let elevation = map.elevation_at(0.5, 0.5).unwrap();
        assert_relative_eq!(elevation, 2.0);
        let (i, j) = map.index_of(0.5, 0.5).unwrap();
        assert_relative_eq!(map.cell(i, j).variance, 0.25);
        assert_eq!(map.valid_cell_count(), 1);
    }

    #[test]
    fn test_translate_resets_entering_cells() {
        let mut map = ElevationMap::new(4.0, 1.0, -1.0, 1.0);
        for x in [-1.5, -0.5, 0.5, 1.5] {
            for y in [-1.5, -0.5, 0.5, 1.5] {
                map.fuse(&single_point_cloud(x, y, 1.0), &[1.0]);
            }
        }
        assert_eq!(map.valid_cell_count(), 16);

        // Move one cell in +x: the leftmost column leaves, a fresh one enters.
        map.translate(&planar_pose(1.0, 0.0));
        assert_eq!(map.valid_cell_count(), 12);
        assert!(map.elevation_at(2.5, 0.5).is_none());
        assert_relative_eq!(map.elevation_at(1.5, 0.5).unwrap(), 1.0);
    }

    #[test]
    fn test_translate_far_resets_everything() {
        let mut map = ElevationMap::new(4.0, 1.0, -1.0, 1.0);
        map.fuse(&single_point_cloud(0.5, 0.5, 2.0), &[1.0]);
        map.translate(&planar_pose(100.0, 100.0));
        assert_eq!(map.valid_cell_count(), 0);
    }

    #[test]
    fn test_index_position_round_trip() {
        let map = ElevationMap::new(10.0, 0.5, -1.0, 1.0);
        let (i, j) = map.index_of(1.3, -2.1).unwrap();
        let (x, y) = map.position_of(i, j);
        assert!((x - 1.3).abs() <= 0.25 + 1e-12);
        assert!((y - -2.1).abs() <= 0.25 + 1e-12);
    }
}
