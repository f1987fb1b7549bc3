//! # Frame Loop Demo
//!
//! Renders a field of cubes through shadow cascades, an opaque pass and a
//! composite pass without a window. Offscreen textures stand in for the
//! swapchain, so the demo runs on CI machines with the dummy backend.
//!
//! ```bash
//! cargo run --bin frame_loop -- --backend dummy --frames 600 --resize-at 300
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use inflight_core::cascade::MAX_CASCADES;
use inflight_demos::args::FrameLoopArgs;
use inflight_demos::scene::{OrbitCamera, build_scene, cube_vertex_layout, upload_cube};
use inflight_graphics::types::PushConstantRange;
use inflight_graphics::{
    ClearValue, DepthStencilState, Extent2d, FrameDataLayout, FrameEngine, FullscreenStage,
    GpuBackend, GpuResource, GraphicsError, LoadOp, OutputTarget, PipelineAssembler,
    PresentImage, RenderStageDescription, RenderTargetDescriptor, RenderableStage,
    RenderingContext, ShaderStageSource, ShaderStages, ShadowCascadeStage, StoreOp,
    SwapchainImages, TargetSize, TextureDescriptor, TextureFormat, TextureUsage, VisibilityFlags,
};

const SWAPCHAIN_FORMAT: TextureFormat = TextureFormat::Bgra8Unorm;

/// SPIR-V of every pipeline the demo builds.
struct Shaders {
    mesh_vertex: Vec<u32>,
    mesh_fragment: Vec<u32>,
    fullscreen_vertex: Vec<u32>,
    composite_fragment: Vec<u32>,
}

impl Shaders {
    fn load(dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            mesh_vertex: read_spirv(&dir.join("mesh.vert.spv"))?,
            mesh_fragment: read_spirv(&dir.join("mesh.frag.spv"))?,
            fullscreen_vertex: read_spirv(&dir.join("fullscreen.vert.spv"))?,
            composite_fragment: read_spirv(&dir.join("composite.frag.spv"))?,
        })
    }

    /// Header-only modules. Only the dummy device accepts these.
    fn placeholder() -> Self {
        let header = vec![0x0723_0203, 0x0001_0000, 0, 1, 0];
        Self {
            mesh_vertex: header.clone(),
            mesh_fragment: header.clone(),
            fullscreen_vertex: header.clone(),
            composite_fragment: header,
        }
    }
}

fn read_spirv(path: &Path) -> Result<Vec<u32>, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(format!("{}: length is not a multiple of 4", path.display()).into());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

fn create_swapchain(
    backend: &dyn GpuBackend,
    count: u32,
    extent: Extent2d,
) -> Result<SwapchainImages, GraphicsError> {
    let descriptor = TextureDescriptor::new(
        extent,
        SWAPCHAIN_FORMAT,
        TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
    )
    .with_label("swapchain image");
    let images = (0..count)
        .map(|_| backend.create_texture(&descriptor))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SwapchainImages {
        images,
        format: SWAPCHAIN_FORMAT,
        extent,
    })
}

fn matrix_push_constants() -> PushConstantRange {
    PushConstantRange {
        stages: ShaderStages::VERTEX,
        offset: 0,
        size: 64,
    }
}

/// Finalize every stage and attach its recorder.
fn build_stages(
    args: &FrameLoopArgs,
    cascades: usize,
    assembler: &mut PipelineAssembler,
    engine: &mut FrameEngine,
    shaders: Option<&Shaders>,
) -> Result<(), GraphicsError> {
    let mesh = |description: RenderStageDescription, with_fragment: bool| match shaders {
        Some(shaders) => {
            let description = description
                .with_shader(ShaderStageSource::new(
                    ShaderStages::VERTEX,
                    shaders.mesh_vertex.clone(),
                ))
                .with_vertex_layout(cube_vertex_layout())
                .with_push_constants(matrix_push_constants());
            if with_fragment {
                description.with_shader(ShaderStageSource::new(
                    ShaderStages::FRAGMENT,
                    shaders.mesh_fragment.clone(),
                ))
            } else {
                description
            }
        }
        None => description,
    };

    for cascade in 0..cascades {
        let map = assembler.create_render_target(RenderTargetDescriptor::new(
            format!("shadow cascade {cascade}"),
            TextureFormat::Depth32Float,
            TargetSize::Absolute(Extent2d::new(args.shadow_size, args.shadow_size)),
        ))?;
        let mut description = mesh(
            RenderStageDescription::new(format!("shadow_{cascade}")).with_depth(
                map,
                LoadOp::Clear(ClearValue::depth(1.0)),
                StoreOp::Store,
            ),
            false,
        );
        if shaders.is_some() {
            description = description.with_depth_stencil(DepthStencilState::depth_read_write());
        }
        let stage = assembler.finalize(description)?;
        engine.register_recorder(stage, ShadowCascadeStage::new(cascade));
    }

    let hdr = assembler.create_render_target(RenderTargetDescriptor::new(
        "hdr",
        TextureFormat::Rgba16Float,
        TargetSize::SwapchainRelative(1.0),
    ))?;
    let depth = assembler.create_render_target(RenderTargetDescriptor::new(
        "depth",
        TextureFormat::Depth32Float,
        TargetSize::SwapchainRelative(1.0),
    ))?;
    let mut opaque = mesh(
        RenderStageDescription::new("opaque")
            .with_output(OutputTarget::RenderTarget(hdr))
            .with_color_load(LoadOp::Clear(ClearValue::color(0.05, 0.05, 0.08, 1.0)))
            .with_depth(depth, LoadOp::Clear(ClearValue::depth(1.0)), StoreOp::DontCare),
        true,
    );
    if shaders.is_some() {
        opaque = opaque.with_depth_stencil(DepthStencilState::depth_read_write());
    }
    let stage = assembler.finalize(opaque)?;
    engine.register_recorder(stage, RenderableStage::new(VisibilityFlags::VISIBLE));

    let mut composite = RenderStageDescription::new("composite")
        .with_output(OutputTarget::Screen)
        .with_color_load(LoadOp::Clear(ClearValue::color(0.0, 0.0, 0.0, 1.0)));
    if let Some(shaders) = shaders {
        composite = composite
            .with_shader(ShaderStageSource::new(
                ShaderStages::VERTEX,
                shaders.fullscreen_vertex.clone(),
            ))
            .with_shader(ShaderStageSource::new(
                ShaderStages::FRAGMENT,
                shaders.composite_fragment.clone(),
            ));
    }
    let stage = assembler.finalize(composite)?;
    engine.register_recorder(stage, FullscreenStage::new());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = FrameLoopArgs::parse();
    inflight_core::profiling::start();
    log::info!("Starting inflight frame loop demo");
    log::info!("Core version: {}", inflight_core::VERSION);
    log::info!("Graphics version: {}", inflight_graphics::VERSION);

    let config = args.renderer_config();
    let cascades = config.shadow.cascade_factors.len().min(MAX_CASCADES);
    let context = RenderingContext::new(config)?;
    let backend = Arc::clone(context.backend());

    let shaders = match &args.shader_dir {
        Some(dir) => Some(Shaders::load(dir)?),
        None if backend.name() == "Dummy" => Some(Shaders::placeholder()),
        None => {
            log::warn!("No --shader-dir given, stages will only clear");
            None
        }
    };

    let mut extent = Extent2d::new(args.width, args.height);
    let mut swapchain = create_swapchain(backend.as_ref(), args.swapchain_images, extent)?;
    let mut assembler = PipelineAssembler::new(&context, swapchain.clone());
    let mut engine = FrameEngine::new(
        &context,
        &FrameDataLayout::new(context.config().dynamic_uniform_size),
    )?;
    build_stages(
        &args,
        cascades,
        &mut assembler,
        &mut engine,
        shaders.as_ref(),
    )?;

    let mesh = upload_cube(backend.as_ref())?;
    let mut camera = OrbitCamera::new(extent.width as f32 / extent.height as f32);
    let light_direction = inflight_core::math::Vec3::new(-0.4, -1.0, -0.3);

    let started = Instant::now();
    for frame in 0..args.frames {
        if args.resize_at == Some(frame) {
            extent = Extent2d::new(extent.width * 2, extent.height * 2);
            let resized = create_swapchain(backend.as_ref(), args.swapchain_images, extent)?;
            let old = std::mem::replace(&mut swapchain, resized);
            assembler.rebuild(swapchain.clone())?;
            context
                .destruction()
                .retire_all(old.images.into_iter().map(GpuResource::Texture));
            camera.aspect = extent.width as f32 / extent.height as f32;
        }

        let cascades = context.compute_cascades(light_direction, &camera.cascade_camera(frame));
        let scene = build_scene(mesh, args.grid, camera.view_projection(frame), cascades);
        let image = PresentImage {
            index: (frame % swapchain.images.len() as u64) as u32,
            image_available: None,
        };
        engine.render_frame(&assembler, image, Arc::new(scene));

        if frame > 0 && frame % 100 == 0 {
            log::info!(
                "Frame {frame}: {} passes, {} stage buffers, {} draws",
                engine.last_stats().render_passes_begun,
                engine.last_stats().stages_executed,
                engine.last_stats().draws
            );
        }
    }
    engine.wait_idle();
    let elapsed = started.elapsed();

    let totals = engine.total_stats();
    engine.shutdown();
    assembler.release();
    context.destruction().retire(GpuResource::Buffer(mesh));
    context
        .destruction()
        .retire_all(swapchain.images.into_iter().map(GpuResource::Texture));
    context.shutdown()?;

    let per_frame = elapsed.as_secs_f64() * 1000.0 / totals.frames.max(1) as f64;
    println!(
        "{} frames in {:.2?} ({per_frame:.3} ms/frame) on the {} backend",
        totals.frames,
        elapsed,
        backend.name()
    );
    println!(
        "{} render passes, {} subpasses advanced, {} stage buffers executed, {} copies, {} draws",
        totals.render_passes_begun,
        totals.subpasses_advanced,
        totals.stages_executed,
        totals.copies,
        totals.draws
    );
    println!(
        "{} resources destroyed through the destruction queue",
        context.destruction().destroyed_count()
    );
    Ok(())
}
