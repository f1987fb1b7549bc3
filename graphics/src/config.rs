//! Renderer configuration.

use std::time::Duration;

use inflight_core::cascade::{DEFAULT_CASCADE_FACTORS, MAX_CASCADES};

/// Upper bound on frames in flight.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 8;

/// Which device backend to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendType {
    /// Vulkan if available, otherwise the dummy device.
    #[default]
    Auto,
    Vulkan,
    Dummy,
}

/// Cascaded shadow map parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowConfig {
    /// Distance covered by the last cascade.
    pub view_distance: f32,
    /// Far split of each cascade as a fraction of `view_distance`.
    pub cascade_factors: Vec<f32>,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            view_distance: 1000.0,
            cascade_factors: DEFAULT_CASCADE_FACTORS.to_vec(),
        }
    }
}

impl ShadowConfig {
    pub fn with_view_distance(mut self, distance: f32) -> Self {
        assert!(
            distance.is_finite() && distance > 0.0,
            "shadow view distance must be positive, got {distance}"
        );
        self.view_distance = distance;
        self
    }

    /// Set the split factors. Must be increasing, at most [`MAX_CASCADES`].
    pub fn with_cascade_factors(mut self, factors: &[f32]) -> Self {
        assert!(
            !factors.is_empty() && factors.len() <= MAX_CASCADES,
            "expected 1..={MAX_CASCADES} cascade factors, got {}",
            factors.len()
        );
        assert!(
            factors.windows(2).all(|w| w[0] < w[1]),
            "cascade factors must be strictly increasing"
        );
        self.cascade_factors = factors.to_vec();
        self
    }
}

/// Configuration for creating a [`RenderingContext`](crate::RenderingContext).
///
/// # Example
///
/// ```
/// use inflight_graphics::{BackendType, RendererConfig};
///
/// let config = RendererConfig::new()
///     .with_backend(BackendType::Dummy)
///     .with_frames_in_flight(2)
///     .with_worker_threads(0);
/// assert_eq!(config.frames_in_flight, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    pub application_name: String,
    pub backend: BackendType,
    /// Number of frame slots, `1..=MAX_FRAMES_IN_FLIGHT`.
    pub frames_in_flight: u32,
    /// Worker threads for stage recording. Zero records on the calling thread.
    pub worker_threads: usize,
    /// Upper bound on a single frame fence wait.
    pub fence_timeout: Duration,
    /// Enable API validation layers.
    pub validation: bool,
    /// Size of each slot's dynamic uniform buffer in bytes.
    pub dynamic_uniform_size: u64,
    pub shadow: ShadowConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            application_name: "inflight".to_string(),
            backend: BackendType::Auto,
            frames_in_flight: 3,
            worker_threads: cores.saturating_sub(1).max(1),
            fence_timeout: Duration::from_secs(10),
            validation: cfg!(debug_assertions),
            dynamic_uniform_size: 64 * 1024,
            shadow: ShadowConfig::default(),
        }
    }
}

impl RendererConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    /// Set the number of frames in flight, clamped to `1..=MAX_FRAMES_IN_FLIGHT`.
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        let clamped = frames.clamp(1, MAX_FRAMES_IN_FLIGHT);
        if clamped != frames {
            log::warn!("frames_in_flight {frames} out of range, using {clamped}");
        }
        self.frames_in_flight = clamped;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    pub fn with_dynamic_uniform_size(mut self, size: u64) -> Self {
        self.dynamic_uniform_size = size;
        self
    }

    pub fn with_shadow(mut self, shadow: ShadowConfig) -> Self {
        self.shadow = shadow;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert!(config.worker_threads >= 1);
        assert_eq!(config.fence_timeout, Duration::from_secs(10));
        assert_eq!(config.shadow.view_distance, 1000.0);
        assert_eq!(config.shadow.cascade_factors.len(), 4);
    }

    #[test]
    fn test_frames_in_flight_is_clamped() {
        assert_eq!(RendererConfig::new().with_frames_in_flight(0).frames_in_flight, 1);
        assert_eq!(
            RendererConfig::new().with_frames_in_flight(64).frames_in_flight,
            MAX_FRAMES_IN_FLIGHT
        );
    }

    #[test]
    #[should_panic(expected = "view distance must be positive")]
    fn test_view_distance_must_be_positive() {
        let _ = ShadowConfig::default().with_view_distance(0.0);
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn test_cascade_factors_must_increase() {
        let _ = ShadowConfig::default().with_cascade_factors(&[0.5, 0.25]);
    }
}
