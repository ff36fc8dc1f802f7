use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use ndarray::Array2;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Normal;

use crate::cloud::{cloud_fitness, transform_cloud};
use crate::types::{pose_from_parts, wrap_angle, yaw_from_pose, Particle, PointCloud, Pose};

/// Weighted sample of planar pose hypotheses.
///
/// The particle vector and the RNG sit behind their own mutexes so the
/// expensive scan-scoring in `update` can run on a copy of the population
/// while prediction keeps servicing odometry callbacks.
pub struct ParticleFilter {
    particles: Mutex<Vec<Particle>>,
    rng: Mutex<StdRng>,
    weights_updated: AtomicBool,
    num_particles: usize,
    initial_sigma_x: f64,
    initial_sigma_y: f64,
    initial_sigma_yaw: f64,
    predict_sigma_x: f64,
    predict_sigma_y: f64,
    predict_sigma_yaw: f64,
}

impl ParticleFilter {
    pub fn new(
        num_particles: usize,
        initial_sigmas: (f64, f64, f64),
        predict_sigmas: (f64, f64, f64),
        rng_seed: Option<u64>,
    ) -> Self {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            particles: Mutex::new(vec![Particle::default(); num_particles]),
            rng: Mutex::new(rng),
            weights_updated: AtomicBool::new(false),
            num_particles,
            initial_sigma_x: initial_sigmas.0,
            initial_sigma_y: initial_sigmas.1,
            initial_sigma_yaw: initial_sigmas.2,
            predict_sigma_x: predict_sigmas.0,
            predict_sigma_y: predict_sigmas.1,
            predict_sigma_yaw: predict_sigmas.2,
        }
    }

    pub fn num_particles(&self) -> usize {
        self.num_particles
    }

    /// Draws every particle from independent gaussians around the given pose.
    pub fn initialize(&self, initial_x: f64, initial_y: f64, initial_yaw: f64) {
        let mut particles = self.lock_particles();
        let mut rng = self.lock_rng();
        for particle in particles.iter_mut() {
            particle.x = sample_gaussian(&mut rng, initial_x, self.initial_sigma_x);
            particle.y = sample_gaussian(&mut rng, initial_y, self.initial_sigma_y);
            particle.yaw = sample_gaussian(&mut rng, initial_yaw, self.initial_sigma_yaw);
            particle.weight = 1.0;
        }
    }

    /// Shifts every particle by the odometry delta.
    ///
    /// Process noise is injected only on the first predict after a weight
    /// update; pure-motion predictions in between add the delta exactly, so
    /// repeated odometry ticks do not inflate the spread.
    pub fn predict(&self, delta_x: f64, delta_y: f64, delta_yaw: f64) {
        let delta_yaw = wrap_angle(delta_yaw);
        let (sigma_x, sigma_y, sigma_yaw) = if self.weights_updated.swap(false, Ordering::SeqCst) {
            (
                self.predict_sigma_x,
                self.predict_sigma_y,
                self.predict_sigma_yaw,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let mut particles = self.lock_particles();
        let mut rng = self.lock_rng();
        for particle in particles.iter_mut() {
            particle.x = sample_gaussian(&mut rng, particle.x + delta_x, sigma_x);
            particle.y = sample_gaussian(&mut rng, particle.y + delta_y, sigma_y);
            particle.yaw = sample_gaussian(&mut rng, particle.yaw + delta_yaw, sigma_yaw);
        }
    }

    /// Scores every particle by moving the map cloud onto the particle's
    /// planar pose and measuring cloud-to-cloud fitness against the scan.
    ///
    /// Scoring runs on a copy of the population so odometry prediction is
    /// not blocked while clouds are matched.
    pub fn update(&self, last_pose: &Pose, raw_cloud: &PointCloud, map_cloud: &PointCloud) {
        if map_cloud.is_empty() {
            return;
        }

        let mut scored = self.lock_particles().clone();

        for particle in scored.iter_mut() {
            let delta = delta_pose_from_particle(particle, last_pose);
            let particle_cloud = transform_cloud(map_cloud, &delta);
            let score = cloud_fitness(raw_cloud, &particle_cloud);
            particle.weight = 1.0 / score.max(f64::MIN_POSITIVE);
        }

        let mut particles = self.lock_particles();
        for (particle, update) in particles.iter_mut().zip(&scored) {
            particle.weight = update.weight;
        }
        drop(particles);

        self.weights_updated.store(true, Ordering::SeqCst);
    }

    /// Draws a new population with replacement, proportionally to weight.
    pub fn resample(&self) {
        let mut particles = self.lock_particles();
        let weights: Vec<f64> = particles.iter().map(|particle| particle.weight).collect();
        let Ok(distribution) = WeightedIndex::new(&weights) else {
            return;
        };

        let mut rng = self.lock_rng();
        let resampled: Vec<Particle> = (0..self.num_particles)
            .map(|_| particles[distribution.sample(&mut *rng)])
            .collect();
        *particles = resampled;
    }

    /// Planar pose of the highest-weight particle; ties keep the lowest
    /// index. The posterior can be multi-modal at terrain symmetries, so a
    /// weighted mean would average incompatible hypotheses.
    pub fn estimate(&self) -> (f64, f64, f64) {
        let particles = self.lock_particles();
        let Some(first) = particles.first() else {
            return (0.0, 0.0, 0.0);
        };
        let best = particles
            .iter()
            .skip(1)
            .fold(first, |best, particle| {
                if particle.weight > best.weight {
                    particle
                } else {
                    best
                }
            });
        (best.x, best.y, best.yaw)
    }

    /// Sample variance of the particle yaws, used as the prior variance
    /// when fusing an absolute yaw measurement.
    pub fn yaw_spread(&self) -> f64 {
        let particles = self.lock_particles();
        if particles.len() < 2 {
            return 0.0;
        }
        let mean = particles.iter().map(|p| p.yaw).sum::<f64>() / particles.len() as f64;
        particles
            .iter()
            .map(|p| {
                let deviation = wrap_angle(p.yaw - mean);
                deviation * deviation
            })
            .sum::<f64>()
            / particles.len() as f64
    }

    /// Snapshot of the population as a (num_particles x 4) table of
    /// (x, y, yaw, weight) rows.
    pub fn particles_array(&self) -> Array2<f64> {
        let particles = self.lock_particles();
        let mut array = Array2::<f64>::zeros((particles.len(), 4));
        for (row, particle) in particles.iter().enumerate() {
            array[[row, 0]] = particle.x;
            array[[row, 1]] = particle.y;
            array[[row, 2]] = particle.yaw;
            array[[row, 3]] = particle.weight;
        }
        array
    }

    fn lock_particles(&self) -> MutexGuard<'_, Vec<Particle>> {
        self.particles.lock().expect("particle mutex poisoned")
    }

    fn lock_rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().expect("particle RNG mutex poisoned")
    }
}

fn sample_gaussian(rng: &mut StdRng, mean: f64, sigma: f64) -> f64 {
    match Normal::new(mean, sigma) {
        Ok(distribution) => distribution.sample(rng),
        Err(_) => mean,
    }
}

/// Rigid delta that carries the map cloud from the reference pose onto the
/// particle's planar pose; z, roll and pitch are untouched.
fn delta_pose_from_particle(particle: &Particle, pose: &Pose) -> Pose {
    let delta_yaw = wrap_angle(particle.yaw - yaw_from_pose(pose));
    pose_from_parts(
        nalgebra::Vector3::new(
            particle.x - pose.translation.x,
            particle.y - pose.translation.y,
            0.0,
        ),
        0.0,
        0.0,
        delta_yaw,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;
    use approx::assert_relative_eq;

    fn seeded_filter(num_particles: usize) -> ParticleFilter {
        ParticleFilter::new(
            num_particles,
            (0.5, 0.5, 0.1),
            (0.05, 0.05, 0.01),
            Some(42),
        )
    }

    fn flat_cloud() -> PointCloud {
        let mut cloud = PointCloud::new();
        for i in 0..5 {
            for j in 0..5 {
                cloud.push(Point::new(i as f64 * 0.4, j as f64 * 0.4, 0.1 * i as f64));
            }
        }
        cloud
    }

    #[test]
    fn test_population_size_is_conserved() {
        let filter = seeded_filter(50);
        filter.initialize(0.0, 0.0, 0.0);
        filter.predict(0.1, 0.0, 0.0);
        filter.update(&Pose::identity(), &flat_cloud(), &flat_cloud());
        filter.resample();
        assert_eq!(filter.particles_array().nrows(), 50);
    }

    #[test]
    fn test_weights_positive_after_update() {
        let filter = seeded_filter(30);
        filter.initialize(0.0, 0.0, 0.0);
        filter.update(&Pose::identity(), &flat_cloud(), &flat_cloud());
        let table = filter.particles_array();
        for row in 0..table.nrows() {
            assert!(table[[row, 3]] > 0.0);
        }
    }

    #[test]
    fn test_seeded_initialization_is_reproducible() {
        let a = seeded_filter(20);
        let b = seeded_filter(20);
        a.initialize(1.0, -1.0, 0.5);
        b.initialize(1.0, -1.0, 0.5);
        assert_eq!(a.particles_array(), b.particles_array());
    }

    #[test]
    fn test_predict_without_update_adds_exact_delta() {
        let filter = ParticleFilter::new(10, (0.0, 0.0, 0.0), (0.3, 0.3, 0.1), Some(7));
        filter.initialize(0.0, 0.0, 0.0);
        filter.predict(1.0, -2.0, 0.25);
        let table = filter.particles_array();
        for row in 0..table.nrows() {
            assert_relative_eq!(table[[row, 0]], 1.0);
            assert_relative_eq!(table[[row, 1]], -2.0);
            assert_relative_eq!(table[[row, 2]], 0.25);
        }
    }

    #[test]
    fn test_process_noise_injected_once_per_update_cycle() {
        let filter = ParticleFilter::new(10, (0.0, 0.0, 0.0), (0.3, 0.3, 0.1), Some(7));
        filter.initialize(0.0, 0.0, 0.0);
        filter.update(&Pose::identity(), &flat_cloud(), &flat_cloud());

        // First predict after the update: noise makes the particles spread.
        filter.predict(0.0, 0.0, 0.0);
        let noisy = filter.particles_array();
        let spread = (0..noisy.nrows())
            .map(|row| noisy[[row, 0]].abs())
            .fold(0.0_f64, f64::max);
        assert!(spread > 0.0);

        // Second predict: pure motion, every particle shifts exactly.
        filter.predict(0.5, 0.0, 0.0);
        let shifted = filter.particles_array();
        for row in 0..shifted.nrows() {
            assert_relative_eq!(shifted[[row, 0]], noisy[[row, 0]] + 0.5, epsilon = 1e-12);
            assert_relative_eq!(shifted[[row, 1]], noisy[[row, 1]], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_update_with_empty_map_cloud_is_noop() {
        let filter = seeded_filter(10);
        filter.initialize(0.0, 0.0, 0.0);
        let before = filter.particles_array();
        filter.update(&Pose::identity(), &flat_cloud(), &PointCloud::new());
        assert_eq!(filter.particles_array(), before);
    }

    #[test]
    fn test_estimate_returns_argmax_particle() {
        let filter = seeded_filter(25);
        filter.initialize(0.0, 0.0, 0.0);
        filter.update(&Pose::identity(), &flat_cloud(), &flat_cloud());

        let table = filter.particles_array();
        let mut best_row = 0;
        for row in 1..table.nrows() {
            if table[[row, 3]] > table[[best_row, 3]] {
                best_row = row;
            }
        }
        let (x, y, yaw) = filter.estimate();
        assert_relative_eq!(x, table[[best_row, 0]]);
        assert_relative_eq!(y, table[[best_row, 1]]);
        assert_relative_eq!(yaw, table[[best_row, 2]]);
    }

    #[test]
    fn test_resample_draws_from_existing_population() {
        let filter = seeded_filter(20);
        filter.initialize(0.0, 0.0, 0.0);
        filter.update(&Pose::identity(), &flat_cloud(), &flat_cloud());
        let before = filter.particles_array();
        filter.resample();
        let after = filter.particles_array();

        assert_eq!(after.nrows(), 20);
        for row in 0..after.nrows() {
            let x = after[[row, 0]];
            let y = after[[row, 1]];
            let survives = (0..before.nrows())
                .any(|src| before[[src, 0]] == x && before[[src, 1]] == y);
            assert!(survives);
        }
    }

    #[test]
    fn test_yaw_spread_zero_for_identical_yaws() {
        let filter = ParticleFilter::new(10, (0.0, 0.0, 0.0), (0.0, 0.0, 0.0), Some(1));
        filter.initialize(0.0, 0.0, 1.0);
        assert_relative_eq!(filter.yaw_spread(), 0.0);
    }
}
