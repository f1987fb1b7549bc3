use criterion::{Criterion, black_box, criterion_group, criterion_main};

use inflight_core::cascade::{
    CascadeCamera, DEFAULT_CASCADE_FACTORS, compute_cascade, compute_cascades,
};
use inflight_core::math::{Vec3, WORLD_UP};
use inflight_core::tasks::TaskSystem;

fn camera() -> CascadeCamera {
    CascadeCamera::perspective(
        Vec3::new(0.0, 2.0, 0.0),
        Vec3::new(0.0, -0.2, -1.0),
        WORLD_UP,
        std::f32::consts::FRAC_PI_3,
        16.0 / 9.0,
        0.1,
    )
}

// ---------------------------------------------------------------------------
// Cascades
// ---------------------------------------------------------------------------

fn bench_single_cascade(c: &mut Criterion) {
    let camera = camera();
    let light = Vec3::new(-0.3, -1.0, -0.2);
    c.bench_function("compute_cascade", |b| {
        b.iter(|| compute_cascade(black_box(light), black_box(15.625), black_box(62.5), &camera));
    });
}

fn bench_all_cascades(c: &mut Criterion) {
    let camera = camera();
    let light = Vec3::new(-0.3, -1.0, -0.2);
    c.bench_function("compute_cascades_4", |b| {
        b.iter(|| {
            compute_cascades(
                black_box(light),
                black_box(1000.0),
                &DEFAULT_CASCADE_FACTORS,
                &camera,
            )
        });
    });
}

fn bench_frustum_culling(c: &mut Criterion) {
    let cascade = compute_cascade(Vec3::new(-0.3, -1.0, -0.2), 0.1, 15.625, &camera());
    let points: Vec<Vec3> = (0..1024)
        .map(|i| Vec3::new((i % 32) as f32 - 16.0, 0.0, -((i / 32) as f32)))
        .collect();
    c.bench_function("cascade_cull_1024_spheres", |b| {
        b.iter(|| {
            points
                .iter()
                .filter(|p| cascade.frustum.contains_sphere(p, 0.5))
                .count()
        });
    });
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn bench_task_fan_out(c: &mut Criterion) {
    let tasks = TaskSystem::new(4);
    c.bench_function("task_fan_out_16", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..16u64).map(|i| tasks.spawn(move || i * 3)).collect();
            tasks.wait_all(handles)
        });
    });
}

criterion_group!(
    benches,
    bench_single_cascade,
    bench_all_cascades,
    bench_frustum_culling,
    bench_task_fan_out
);
criterion_main!(benches);
