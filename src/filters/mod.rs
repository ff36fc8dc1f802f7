/// Monte Carlo pose filtering.
///
/// The particle filter carries the planar (x, y, yaw) belief; the full
/// 6-DoF pose is assembled around it by the pose estimation layer.
pub mod particle_filter;

pub use particle_filter::ParticleFilter;
