//! Frames-in-flight loop tests.
//!
//! These drive the complete begin/end frame cycle against a backend and check
//! the synchronization contract between frame slots and the device.

mod common;

use common::{Backend, TestContext, empty_scene, present, rgba8_image};
use inflight_graphics::backend::Command;
use inflight_graphics::{
    ClearValue, Extent2d, GpuResource, LoadOp, OutputTarget, RenderStageDescription,
    RenderTargetDescriptor, StageEncoder, StageFrame, StoreOp, SwapchainImages, TargetSize,
    TextureDescriptor, TextureFormat, TextureLayout, TextureUsage,
};
use rstest::rstest;

fn clear_stage(name: &str, color: ClearValue) -> RenderStageDescription {
    RenderStageDescription::new(name)
        .with_output(OutputTarget::Screen)
        .with_color_load(LoadOp::Clear(color))
}

fn draw_triangle(_: &StageFrame, encoder: &mut StageEncoder) {
    encoder.draw(3, 1);
}

// ============================================================================
// Clears
// ============================================================================

/// A stage that declares a clear but records nothing still clears the image.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_clear_without_draws(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 2, 1) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };

    ctx.assembler
        .finalize(clear_stage("clear", ClearValue::color(1.0, 0.0, 0.0, 1.0)))
        .expect("Failed to finalize clear stage");

    let mut engine = ctx.engine();
    engine.render_frame(&ctx.assembler, present(0), empty_scene());

    let stats = engine.last_stats();
    assert_eq!(stats.render_passes_begun, 1);
    assert_eq!(stats.stages_executed, 0);
    assert_eq!(stats.draws, 0);

    engine.wait_idle();
    assert_eq!(ctx.read_screen(0), rgba8_image([255, 0, 0, 255]));

    ctx.shutdown(engine);
}

/// Later frames overwrite the clear of earlier ones.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_clear_tracks_latest_frame(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 2, 1) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };

    let stage = ctx
        .assembler
        .finalize(clear_stage("clear", ClearValue::color(0.0, 1.0, 0.0, 1.0)))
        .expect("Failed to finalize clear stage");
    let mut engine = ctx.engine();
    engine.register_recorder(stage, draw_triangle);

    for _ in 0..4 {
        engine.render_frame(&ctx.assembler, present(0), empty_scene());
    }
    ctx.dummy().complete_all();
    assert_eq!(
        ctx.dummy().texture_contents(ctx.screen_image(0)),
        Some(rgba8_image([0, 255, 0, 255]))
    );
    assert_eq!(ctx.dummy().stats().draws_executed, 4);
    assert_eq!(ctx.dummy().stats().layout_mismatches, 0);

    ctx.shutdown(engine);
}

// ============================================================================
// Slot reuse
// ============================================================================

/// A slot's command buffers are never rewritten while its previous
/// submission is still executing, for any number of slots.
#[rstest]
#[case::dummy_one_slot(Backend::Dummy, 1)]
#[case::dummy_two_slots(Backend::Dummy, 2)]
#[case::dummy_three_slots(Backend::Dummy, 3)]
fn test_slot_reuse_waits_for_fence(#[case] backend: Backend, #[case] frames: u32) {
    let Some(mut ctx) = TestContext::new(backend, frames, 1) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };

    let stage = ctx
        .assembler
        .finalize(clear_stage("clear", ClearValue::color(0.0, 0.0, 0.0, 1.0)))
        .expect("Failed to finalize clear stage");
    let mut engine = ctx.engine();
    engine.register_recorder(stage, draw_triangle);

    for frame in 0..12u32 {
        engine.render_frame(&ctx.assembler, present(0), empty_scene());
        // Nothing completes on its own, so at most one submission per slot
        // may be outstanding.
        let pending = ctx.dummy().pending_submissions() as u32;
        assert_eq!(pending, (frame + 1).min(frames));
        assert_eq!(ctx.dummy().stats().writes_while_pending, 0);
    }

    let dummy = ctx.dummy.clone().expect("dummy backend");
    ctx.shutdown(engine);
    assert_eq!(dummy.stats().destroyed_while_pending, 0);
}

/// Ten frames back to back over three slots: every fence is waited on once
/// per signal and no command buffer is touched while pending.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_ten_frames_over_three_slots(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 3, 3) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };

    let stage = ctx
        .assembler
        .finalize(clear_stage("clear", ClearValue::color(0.2, 0.2, 0.2, 1.0)))
        .expect("Failed to finalize clear stage");
    let mut engine = ctx.engine();
    engine.register_recorder(stage, draw_triangle);

    for frame in 0..10u32 {
        engine.render_frame(&ctx.assembler, present(frame % 3), empty_scene());
    }

    let stats = ctx.dummy().stats();
    assert_eq!(stats.submissions, 10);
    assert_eq!(stats.fence_waits, 10);
    assert_eq!(stats.redundant_fence_waits, 0);
    assert_eq!(stats.writes_while_pending, 0);
    assert_eq!(engine.total_stats().frames, 10);
    assert_eq!(engine.total_stats().draws, 10);

    ctx.shutdown(engine);
}

/// Each frame begins the framebuffer of the image it presents to.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_framebuffer_follows_present_image(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 2, 3) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };

    let stage = ctx
        .assembler
        .finalize(clear_stage("clear", ClearValue::color(0.0, 0.0, 1.0, 1.0)))
        .expect("Failed to finalize clear stage");
    let mut engine = ctx.engine();

    for image in [2, 0, 1] {
        engine.render_frame(&ctx.assembler, present(image), empty_scene());
        let primary = engine.frame_data().current_command_buffer();
        let begun: Vec<_> = ctx
            .dummy()
            .recorded_commands(primary)
            .into_iter()
            .filter_map(|command| match command {
                Command::BeginRenderPass { framebuffer, .. } => Some(framebuffer),
                _ => None,
            })
            .collect();
        assert_eq!(begun, vec![ctx.assembler.native(stage).framebuffers[image as usize]]);
    }

    engine.wait_idle();
    for image in 0..3 {
        assert_eq!(ctx.read_screen(image), rgba8_image([0, 0, 255, 255]));
    }

    ctx.shutdown(engine);
}

/// Rebuilding for a new swapchain retires the old objects and the loop
/// continues without touching anything the device still uses.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_rebuild_between_frames(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 2, 2) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };

    let stage = ctx
        .assembler
        .finalize(clear_stage("clear", ClearValue::color(1.0, 1.0, 1.0, 1.0)))
        .expect("Failed to finalize clear stage");
    let mut engine = ctx.engine();
    engine.register_recorder(stage, draw_triangle);

    for frame in 0..3u32 {
        engine.render_frame(&ctx.assembler, present(frame % 2), empty_scene());
    }

    let old_pass = ctx.assembler.native(stage).render_pass;
    let extent = Extent2d::new(16, 12);
    let images = (0..2)
        .map(|_| {
            ctx.context
                .backend()
                .create_texture(&TextureDescriptor::new(
                    extent,
                    common::SWAPCHAIN_FORMAT,
                    TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
                ))
                .expect("Failed to create swapchain image")
        })
        .collect();
    let old_images = std::mem::replace(
        &mut ctx.swapchain,
        SwapchainImages {
            images,
            format: common::SWAPCHAIN_FORMAT,
            extent,
        },
    );
    ctx.assembler
        .rebuild(ctx.swapchain.clone())
        .expect("Failed to rebuild stages");

    let native = ctx.assembler.native(stage);
    assert_ne!(native.render_pass, old_pass);
    assert_eq!(native.extent, extent);
    let old = GpuResource::RenderPass(old_pass);
    assert!(ctx.context.destruction().is_pending(&old));

    for frame in 0..6u32 {
        engine.render_frame(&ctx.assembler, present(frame % 2), empty_scene());
    }
    ctx.context.destruction().wait_drain();

    let dummy = ctx.dummy();
    assert!(!dummy.is_alive(&old));
    assert_eq!(dummy.stats().destroy_count(&old), 1);
    assert_eq!(dummy.stats().destroyed_while_pending, 0);
    assert_eq!(dummy.stats().writes_while_pending, 0);

    for image in old_images.images {
        ctx.context.backend().destroy(GpuResource::Texture(image));
    }
    ctx.shutdown(engine);
}

// ============================================================================
// Layouts
// ============================================================================

/// Stages that load their attachments find them in their settled layout on
/// the very first frame, and again after a rebuild recreated them.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_first_load_of_new_attachments(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 2, 2) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };

    let hdr = ctx
        .assembler
        .create_render_target(RenderTargetDescriptor::new(
            "hdr",
            TextureFormat::Rgba16Float,
            TargetSize::SwapchainRelative(1.0),
        ))
        .expect("Failed to create render target");
    let depth = ctx
        .assembler
        .create_render_target(RenderTargetDescriptor::new(
            "depth",
            TextureFormat::Depth32Float,
            TargetSize::SwapchainRelative(1.0),
        ))
        .expect("Failed to create depth target");
    ctx.assembler
        .finalize(
            RenderStageDescription::new("accumulate")
                .with_output(OutputTarget::RenderTarget(hdr))
                .with_color_load(LoadOp::Load)
                .with_depth(depth, LoadOp::Load, StoreOp::Store),
        )
        .expect("Failed to finalize accumulate stage");
    ctx.assembler
        .finalize(
            RenderStageDescription::new("overlay")
                .with_output(OutputTarget::Screen)
                .with_color_load(LoadOp::Load),
        )
        .expect("Failed to finalize overlay stage");

    let hdr_texture = ctx.assembler.render_target(hdr).texture;
    assert_eq!(
        ctx.dummy().texture_layout(hdr_texture),
        Some(TextureLayout::Undefined)
    );

    let mut engine = ctx.engine();
    for frame in 0..4u32 {
        engine.render_frame(&ctx.assembler, present(frame % 2), empty_scene());
    }
    engine.wait_idle();
    let dummy = ctx.dummy();
    assert_eq!(dummy.stats().layout_mismatches, 0);
    assert_eq!(
        dummy.texture_layout(hdr_texture),
        Some(TextureLayout::ShaderReadOnly)
    );
    assert_eq!(
        dummy.texture_layout(ctx.assembler.render_target(depth).texture),
        Some(TextureLayout::DepthStencilAttachment)
    );

    let extent = Extent2d::new(16, 16);
    let images = (0..2)
        .map(|_| {
            ctx.context
                .backend()
                .create_texture(&TextureDescriptor::new(
                    extent,
                    common::SWAPCHAIN_FORMAT,
                    TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
                ))
                .expect("Failed to create swapchain image")
        })
        .collect();
    let old_images = std::mem::replace(
        &mut ctx.swapchain,
        SwapchainImages {
            images,
            format: common::SWAPCHAIN_FORMAT,
            extent,
        },
    );
    ctx.assembler
        .rebuild(ctx.swapchain.clone())
        .expect("Failed to rebuild stages");
    assert_ne!(ctx.assembler.render_target(hdr).texture, hdr_texture);

    for frame in 0..4u32 {
        engine.render_frame(&ctx.assembler, present(frame % 2), empty_scene());
    }
    engine.wait_idle();
    assert_eq!(ctx.dummy().stats().layout_mismatches, 0);
    assert_eq!(ctx.read_screen(1).len(), (extent.area() * 4) as usize);

    for image in old_images.images {
        ctx.context.backend().destroy(GpuResource::Texture(image));
    }
    ctx.shutdown(engine);
}

/// Shutdown destroys every object the loop created, exactly once.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_shutdown_releases_everything(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 3, 1) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };

    let stage = ctx
        .assembler
        .finalize(clear_stage("clear", ClearValue::color(0.0, 0.0, 0.0, 0.0)))
        .expect("Failed to finalize clear stage");
    let mut engine = ctx.engine();
    engine.register_recorder(stage, draw_triangle);
    for _ in 0..5 {
        engine.render_frame(&ctx.assembler, present(0), empty_scene());
    }

    let dummy = ctx.dummy.clone().expect("dummy backend");
    ctx.shutdown(engine);

    let stats = dummy.stats();
    assert_eq!(dummy.live_objects(), 0);
    assert_eq!(stats.double_destroys, 0);
    assert_eq!(stats.destroyed_while_pending, 0);
}
