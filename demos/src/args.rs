//! Command line arguments of the demo drivers.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use inflight_graphics::{BackendType, RendererConfig, ShadowConfig};

/// Device backend selection for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliBackend {
    /// Vulkan when a device is available, otherwise the dummy device.
    #[default]
    Auto,
    /// Native Vulkan via ash.
    Vulkan,
    /// Software device for CI and machines without a GPU.
    Dummy,
}

impl From<CliBackend> for BackendType {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Auto => BackendType::Auto,
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Dummy => BackendType::Dummy,
        }
    }
}

/// Arguments of the `frame_loop` driver.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "frame_loop",
    about = "Render a fixed number of headless frames through the inflight frame loop"
)]
pub struct FrameLoopArgs {
    /// Device backend to render with.
    #[arg(long, value_enum, default_value_t = CliBackend::Auto)]
    pub backend: CliBackend,

    /// Frames the CPU may record ahead of the device.
    #[arg(long, default_value_t = 3)]
    pub frames_in_flight: u32,

    /// Number of frames to render before exiting.
    #[arg(long, default_value_t = 300)]
    pub frames: u64,

    /// Worker threads for stage recording (default: cores - 1).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Number of offscreen images standing in for a swapchain.
    #[arg(long, default_value_t = 3)]
    pub swapchain_images: u32,

    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    #[arg(long, default_value_t = 720)]
    pub height: u32,

    /// Edge length of each shadow cascade map.
    #[arg(long, default_value_t = 1024)]
    pub shadow_size: u32,

    /// Distance covered by the last shadow cascade.
    #[arg(long, default_value_t = 1000.0)]
    pub view_distance: f32,

    /// The scene is a `grid` x `grid` field of cubes.
    #[arg(long, default_value_t = 8)]
    pub grid: u32,

    /// Double the swapchain size before this frame.
    #[arg(long)]
    pub resize_at: Option<u64>,

    /// Directory with `mesh.vert.spv`, `mesh.frag.spv`, `fullscreen.vert.spv`
    /// and `composite.frag.spv`.
    #[arg(long)]
    pub shader_dir: Option<PathBuf>,

    /// Upper bound on one frame fence wait, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub fence_timeout_ms: u64,

    /// Disable API validation layers.
    #[arg(long)]
    pub no_validation: bool,
}

impl FrameLoopArgs {
    /// Renderer configuration described by the arguments.
    pub fn renderer_config(&self) -> RendererConfig {
        let mut config = RendererConfig::new()
            .with_application_name("inflight frame_loop")
            .with_backend(self.backend.into())
            .with_frames_in_flight(self.frames_in_flight)
            .with_fence_timeout(Duration::from_millis(self.fence_timeout_ms))
            .with_shadow(ShadowConfig::default().with_view_distance(self.view_distance));
        if let Some(workers) = self.workers {
            config = config.with_worker_threads(workers);
        }
        if self.no_validation {
            config = config.with_validation(false);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = FrameLoopArgs::try_parse_from(["frame_loop"]).unwrap();
        assert_eq!(args.backend, CliBackend::Auto);
        assert_eq!(args.frames, 300);
        assert!(args.resize_at.is_none());

        let config = args.renderer_config();
        assert_eq!(config.backend, BackendType::Auto);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.shadow.view_distance, 1000.0);
    }

    #[test]
    fn test_overrides() {
        let args = FrameLoopArgs::try_parse_from([
            "frame_loop",
            "--backend",
            "dummy",
            "--frames-in-flight",
            "2",
            "--workers",
            "0",
            "--resize-at",
            "10",
            "--no-validation",
        ])
        .unwrap();
        assert_eq!(args.resize_at, Some(10));

        let config = args.renderer_config();
        assert_eq!(config.backend, BackendType::Dummy);
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.worker_threads, 0);
        assert!(!config.validation);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(FrameLoopArgs::try_parse_from(["frame_loop", "--backend", "metal"]).is_err());
    }
}
