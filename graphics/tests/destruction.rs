//! Deferred destruction driven by the frame loop.

mod common;

use std::sync::Arc;
use std::thread;

use common::{Backend, TestContext, empty_scene, present};
use inflight_graphics::{
    BufferDescriptor, BufferUsage, ClearValue, GpuResource, LoadOp, OutputTarget,
    RenderStageDescription, ResourceKind,
};
use rstest::rstest;

fn clear_screen(ctx: &mut TestContext) {
    ctx.assembler
        .finalize(
            RenderStageDescription::new("clear")
                .with_output(OutputTarget::Screen)
                .with_color_load(LoadOp::Clear(ClearValue::color(0.0, 0.0, 0.0, 1.0))),
        )
        .expect("Failed to finalize clear stage");
}

fn create_buffer(ctx: &TestContext) -> GpuResource {
    GpuResource::Buffer(
        ctx.context
            .backend()
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::VERTEX))
            .expect("Failed to create buffer"),
    )
}

/// A resource retired right before a sweep stays queued and alive.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_retire_then_immediate_sweep(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 3, 1) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };
    clear_screen(&mut ctx);
    let mut engine = ctx.engine();
    engine.render_frame(&ctx.assembler, present(0), empty_scene());

    let buffer = create_buffer(&ctx);
    ctx.context.destruction().retire(buffer.clone());
    // The next frame sweeps straight away, while the device is still busy.
    engine.render_frame(&ctx.assembler, present(0), empty_scene());
    ctx.context.destruction().wait_drain();

    assert!(ctx.context.destruction().is_pending(&buffer));
    assert!(ctx.dummy().is_alive(&buffer));
    assert_eq!(ctx.dummy().stats().destroy_count(&buffer), 0);

    ctx.shutdown(engine);
}

/// Destroyed exactly once, after `frame_count` sweeps and never before.
#[rstest]
#[case::dummy_one_slot(Backend::Dummy, 1)]
#[case::dummy_two_slots(Backend::Dummy, 2)]
#[case::dummy_three_slots(Backend::Dummy, 3)]
fn test_destroyed_after_frame_count_sweeps(#[case] backend: Backend, #[case] frames: u32) {
    let Some(mut ctx) = TestContext::new(backend, frames, 1) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };
    clear_screen(&mut ctx);
    let mut engine = ctx.engine();
    engine.render_frame(&ctx.assembler, present(0), empty_scene());

    let buffer = create_buffer(&ctx);
    ctx.context.destruction().retire(buffer.clone());

    for sweep in 1..frames {
        engine.render_frame(&ctx.assembler, present(0), empty_scene());
        ctx.context.destruction().wait_drain();
        assert!(ctx.dummy().is_alive(&buffer), "destroyed after {sweep} sweeps");
    }

    engine.render_frame(&ctx.assembler, present(0), empty_scene());
    ctx.context.destruction().wait_drain();
    assert!(!ctx.dummy().is_alive(&buffer));
    assert!(!ctx.context.destruction().is_pending(&buffer));

    for _ in 0..2 * frames {
        engine.render_frame(&ctx.assembler, present(0), empty_scene());
    }
    ctx.context.destruction().wait_drain();

    let stats = ctx.dummy().stats();
    assert_eq!(stats.destroy_count(&buffer), 1);
    assert_eq!(stats.destroyed_while_pending, 0);

    ctx.shutdown(engine);
}

/// Retirement is allowed from any thread while frames are running.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_retire_from_worker_threads(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 2, 1) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };
    clear_screen(&mut ctx);
    let mut engine = ctx.engine();

    let resources: Vec<GpuResource> = (0..32).map(|_| create_buffer(&ctx)).collect();
    let queue = Arc::clone(ctx.context.destruction());
    let handles: Vec<_> = resources
        .chunks(8)
        .map(|chunk| {
            let queue = Arc::clone(&queue);
            let chunk = chunk.to_vec();
            thread::spawn(move || queue.retire_all(chunk))
        })
        .collect();
    engine.render_frame(&ctx.assembler, present(0), empty_scene());
    for handle in handles {
        handle.join().expect("retiring thread panicked");
    }

    for _ in 0..6 {
        engine.render_frame(&ctx.assembler, present(0), empty_scene());
        queue.wait_drain();
    }

    let stats = ctx.dummy().stats();
    for resource in &resources {
        assert_eq!(stats.destroy_count(resource), 1, "{resource}");
    }
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(stats.destroyed_while_pending, 0);

    ctx.shutdown(engine);
}

/// Every kind of stage and slot object goes through the queue at shutdown.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_shutdown_retires_every_kind(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, 2, 1) else {
        eprintln!("Skipping test: {} backend not available", backend.name());
        return;
    };
    clear_screen(&mut ctx);
    let engine = ctx.engine();

    let queue = Arc::clone(ctx.context.destruction());
    engine.shutdown();
    ctx.assembler.release();

    let mut kinds: Vec<ResourceKind> = (0..queue.frame_count() as usize)
        .flat_map(|slot| queue.bucket(slot))
        .map(|record| record.kind())
        .collect();
    kinds.sort();
    kinds.dedup();
    for expected in [
        ResourceKind::CommandPool,
        ResourceKind::Fence,
        ResourceKind::Semaphore,
        ResourceKind::Buffer,
        ResourceKind::RenderPass,
        ResourceKind::Framebuffer,
        ResourceKind::PipelineLayout,
    ] {
        assert!(kinds.contains(&expected), "{expected} was not retired");
    }

    ctx.context
        .shutdown()
        .expect("Failed to shut down rendering context");
    assert_eq!(queue.pending_count(), 0);
}
