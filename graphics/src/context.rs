//! Rendering context.
//!
//! [`RenderingContext`] owns the shared services of a renderer: the device
//! backend, the worker task system and the destruction queue. Components
//! take the context at construction and keep `Arc` clones of what they use,
//! so nothing lives in global state.

use std::sync::Arc;

use inflight_core::cascade::{CascadeCamera, CascadeInfo, compute_cascades};
use inflight_core::math::Vec3;
use inflight_core::tasks::TaskSystem;

use crate::backend::{GpuBackend, create_backend};
use crate::config::RendererConfig;
use crate::destruction::DestructionQueue;
use crate::error::GraphicsError;

pub struct RenderingContext {
    config: RendererConfig,
    backend: Arc<dyn GpuBackend>,
    tasks: Arc<TaskSystem>,
    destruction: Arc<DestructionQueue>,
}

impl RenderingContext {
    /// Create the backend selected by `config` and the services around it.
    pub fn new(config: RendererConfig) -> Result<Self, GraphicsError> {
        let backend = create_backend(&config)?;
        Ok(Self::with_backend(config, backend))
    }

    /// Build a context around an existing backend.
    pub fn with_backend(config: RendererConfig, backend: Arc<dyn GpuBackend>) -> Self {
        log::info!(
            "Rendering context '{}': {} backend, {} frames in flight, {} workers",
            config.application_name,
            backend.name(),
            config.frames_in_flight,
            config.worker_threads
        );
        let tasks = Arc::new(TaskSystem::new(config.worker_threads));
        let destruction = Arc::new(DestructionQueue::new(
            Arc::clone(&backend),
            Arc::clone(&tasks),
            config.frames_in_flight,
        ));
        Self {
            config,
            backend,
            tasks,
            destruction,
        }
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn tasks(&self) -> &Arc<TaskSystem> {
        &self.tasks
    }

    pub fn destruction(&self) -> &Arc<DestructionQueue> {
        &self.destruction
    }

    pub fn frame_count(&self) -> u32 {
        self.config.frames_in_flight
    }

    /// Fit the configured shadow cascades for this frame's camera.
    pub fn compute_cascades(
        &self,
        light_direction: Vec3,
        camera: &CascadeCamera,
    ) -> Vec<CascadeInfo> {
        inflight_core::profile_function!();
        let shadow = &self.config.shadow;
        compute_cascades(
            light_direction,
            shadow.view_distance,
            &shadow.cascade_factors,
            camera,
        )
    }

    /// Wait for the device and destroy every retired resource.
    ///
    /// After device loss nothing is executing any more, so the queue is still
    /// flushed before the error is returned.
    pub fn shutdown(&self) -> Result<(), GraphicsError> {
        if let Err(e) = self.backend.wait_idle() {
            if !e.is_device_failure() {
                return Err(e);
            }
            log::warn!("Device failed before shutdown ({e}), destroying retired resources anyway");
            self.destruction.flush();
            return Err(e);
        }
        self.destruction.flush();
        log::info!(
            "Rendering context shut down, {} resources destroyed",
            self.destruction.destroyed_count()
        );
        Ok(())
    }
}

impl std::fmt::Debug for RenderingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderingContext")
            .field("backend", &self.backend.name())
            .field("frames_in_flight", &self.config.frames_in_flight)
            .field("tasks", &self.tasks)
            .field("destruction", &self.destruction)
            .finish()
    }
}

static_assertions::assert_impl_all!(RenderingContext: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendType, ShadowConfig};
    use crate::resource::GpuResource;

    #[test]
    fn test_dummy_context() {
        let config = RendererConfig::new()
            .with_backend(BackendType::Dummy)
            .with_frames_in_flight(2)
            .with_worker_threads(1);
        let context = RenderingContext::new(config).unwrap();
        assert_eq!(context.backend().name(), "Dummy");
        assert_eq!(context.frame_count(), 2);
        assert_eq!(context.destruction().frame_count(), 2);
        assert_eq!(context.tasks().num_threads(), 1);
        context.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_after_device_loss_still_destroys() {
        let backend = Arc::new(crate::backend::dummy::DummyBackend::new());
        let config = RendererConfig::new()
            .with_backend(BackendType::Dummy)
            .with_worker_threads(0);
        let context = RenderingContext::with_backend(config, backend.clone());
        let buffer = backend
            .create_buffer(&crate::types::BufferDescriptor::dynamic_uniform(64))
            .unwrap();
        context.destruction().retire(GpuResource::Buffer(buffer));

        backend.lose_device();
        assert_eq!(context.shutdown(), Err(GraphicsError::DeviceLost));
        assert_eq!(context.destruction().destroyed_count(), 1);
        assert!(!backend.is_alive(&GpuResource::Buffer(buffer)));
    }

    #[test]
    fn test_cascades_follow_shadow_config() {
        let config = RendererConfig::new()
            .with_backend(BackendType::Dummy)
            .with_worker_threads(0)
            .with_shadow(
                ShadowConfig::default()
                    .with_view_distance(200.0)
                    .with_cascade_factors(&[0.25, 1.0]),
            );
        let context = RenderingContext::new(config).unwrap();
        let camera = CascadeCamera::perspective(
            Vec3::zeros(),
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::new(0.0, 1.0, 0.0),
            1.0,
            1.5,
            0.1,
        );
        let cascades = context.compute_cascades(Vec3::new(0.0, -1.0, -0.5), &camera);
        assert_eq!(cascades.len(), 2);
        assert_eq!(cascades[0].split_distance, 50.0);
        assert_eq!(cascades[1].split_distance, 200.0);
    }

    #[test]
    fn test_short_view_distance_keeps_every_cascade() {
        let config = RendererConfig::new()
            .with_backend(BackendType::Dummy)
            .with_worker_threads(0)
            .with_shadow(ShadowConfig::default().with_view_distance(5.0));
        let context = RenderingContext::new(config).unwrap();
        let camera = CascadeCamera::perspective(
            Vec3::new(0.0, 2.0, 5.0),
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::new(0.0, 1.0, 0.0),
            1.0,
            1.5,
            0.1,
        );
        let cascades = context.compute_cascades(Vec3::new(-0.4, -1.0, -0.3), &camera);
        assert_eq!(cascades.len(), 4);
        assert!(cascades.iter().all(|cascade| cascade.depth_range > 0.0));
    }
}
