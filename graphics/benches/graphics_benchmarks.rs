use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use inflight_graphics::concat::{PlanStage, plan};
use inflight_graphics::{
    BackendType, BufferDescriptor, BufferUsage, ClearValue, DestructionQueue, Extent2d,
    FrameDataLayout, FrameEngine, FrameScene, GpuBackend, GpuResource, LoadOp, OutputTarget,
    PipelineAssembler, PresentImage, RenderPassHandle, RenderStageDescription,
    RenderTargetDescriptor, RendererConfig, RenderingContext, StageEncoder, StageFrame,
    SwapchainImages, TargetSize, TextureDescriptor, TextureFormat, TextureUsage,
};

fn dummy_context(frames: u32) -> RenderingContext {
    RenderingContext::new(
        RendererConfig::new()
            .with_backend(BackendType::Dummy)
            .with_frames_in_flight(frames)
            .with_worker_threads(4),
    )
    .expect("dummy context")
}

fn swapchain(backend: &dyn GpuBackend) -> SwapchainImages {
    let extent = Extent2d::new(64, 64);
    let images = (0..3)
        .map(|_| {
            backend
                .create_texture(&TextureDescriptor::new(
                    extent,
                    TextureFormat::Bgra8Unorm,
                    TextureUsage::RENDER_ATTACHMENT,
                ))
                .expect("swapchain image")
        })
        .collect();
    SwapchainImages {
        images,
        format: TextureFormat::Bgra8Unorm,
        extent,
    }
}

// ---------------------------------------------------------------------------
// Concatenation planning
// ---------------------------------------------------------------------------

fn plan_stages(count: u64) -> Vec<PlanStage> {
    // Groups of four stages share a pass, every other stage draws.
    (0..count)
        .map(|i| PlanStage {
            render_pass: RenderPassHandle::from_raw(i / 4),
            subpass: (i % 4) as u32,
            draws: (i % 2) as u32,
            has_copy: i % 16 == 0 && i > 0,
        })
        .collect()
}

fn bench_plan_small(c: &mut Criterion) {
    let stages = plan_stages(8);
    c.bench_function("concat_plan_8_stages", |b| {
        b.iter(|| plan(black_box(&stages)));
    });
}

fn bench_plan_large(c: &mut Criterion) {
    let stages = plan_stages(256);
    c.bench_function("concat_plan_256_stages", |b| {
        b.iter(|| plan(black_box(&stages)));
    });
}

// ---------------------------------------------------------------------------
// Frame loop
// ---------------------------------------------------------------------------

fn bench_frame_loop(c: &mut Criterion) {
    let context = dummy_context(3);
    let images = swapchain(context.backend().as_ref());
    let mut assembler = PipelineAssembler::new(&context, images);
    let hdr = assembler
        .create_render_target(RenderTargetDescriptor::new(
            "hdr",
            TextureFormat::Rgba16Float,
            TargetSize::SwapchainRelative(1.0),
        ))
        .expect("hdr target");

    let mut stages = assembler
        .finalize_group(
            (0..4)
                .map(|i| {
                    RenderStageDescription::new(format!("opaque_{i}"))
                        .with_output(OutputTarget::RenderTarget(hdr))
                        .with_color_load(LoadOp::Clear(ClearValue::color(0.0, 0.0, 0.0, 1.0)))
                })
                .collect(),
        )
        .expect("opaque group");
    stages.push(
        assembler
            .finalize(
                RenderStageDescription::new("present")
                    .with_output(OutputTarget::Screen)
                    .with_color_load(LoadOp::Clear(ClearValue::color(0.0, 0.0, 0.0, 1.0))),
            )
            .expect("present stage"),
    );

    let mut engine = FrameEngine::new(&context, &FrameDataLayout::new(1024)).expect("engine");
    for &stage in &stages {
        engine.register_recorder(stage, |_: &StageFrame, encoder: &mut StageEncoder| {
            for _ in 0..64 {
                encoder.draw(3, 1);
            }
        });
    }

    let scene = Arc::new(FrameScene::new());
    let mut image = 0;
    c.bench_function("frame_loop_5_stages_320_draws", |b| {
        b.iter(|| {
            let present = PresentImage {
                index: image,
                image_available: None,
            };
            image = (image + 1) % 3;
            engine.render_frame(&assembler, present, scene.clone())
        });
    });

    engine.shutdown();
    assembler.release();
    context.shutdown().expect("shutdown");
}

// ---------------------------------------------------------------------------
// Destruction queue
// ---------------------------------------------------------------------------

fn bench_retire_and_sweep(c: &mut Criterion) {
    let context = dummy_context(2);
    let queue: &DestructionQueue = context.destruction();
    let backend = context.backend();
    let mut slot = 0u32;
    c.bench_function("destruction_retire_64_and_sweep", |b| {
        b.iter(|| {
            for _ in 0..64 {
                let buffer = backend
                    .create_buffer(&BufferDescriptor::new(256, BufferUsage::VERTEX))
                    .expect("buffer");
                queue.retire(GpuResource::Buffer(buffer));
            }
            queue.sweep(slot, &[true, true]);
            slot = (slot + 1) % 2;
        });
    });
    context.shutdown().expect("shutdown");
}

criterion_group!(
    benches,
    bench_plan_small,
    bench_plan_large,
    bench_frame_loop,
    bench_retire_and_sweep,
);
criterion_main!(benches);
