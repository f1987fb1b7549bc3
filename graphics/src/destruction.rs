//! Deferred destruction of GPU resources.
//!
//! A retired resource goes into the bucket of the frame slot that was active
//! when it was retired. Every frame, [`DestructionQueue::sweep`] ages all
//! records by one frame and promotes the records whose bucket fence has
//! signaled and that have aged at least one full cycle of frame slots. The
//! promoted records are destroyed by a background task on the
//! [`TaskSystem`], so slow native frees never stall the render loop.
//!
//! The lock only guards the bucket and list bookkeeping. It is never held
//! while waiting on the GPU or on the drain task.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use inflight_core::tasks::{TaskHandle, TaskSystem};
use parking_lot::Mutex;

use crate::backend::GpuBackend;
use crate::resource::{GpuResource, ResourceKey, ResourceKind};

/// A retired resource waiting for the GPU to let go of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestructionRecord {
    resource: GpuResource,
    frames_elapsed: u32,
}

impl DestructionRecord {
    pub fn kind(&self) -> ResourceKind {
        self.resource.kind()
    }

    pub fn resource(&self) -> &GpuResource {
        &self.resource
    }

    /// Number of sweeps since the resource was retired.
    pub fn frames_elapsed(&self) -> u32 {
        self.frames_elapsed
    }
}

struct QueueState {
    /// One bucket per frame slot.
    buckets: Vec<Vec<DestructionRecord>>,
    active_slot: usize,
    /// Promoted records not yet handed to a drain task.
    ready: Vec<GpuResource>,
    /// Keys of everything retired and not yet destroyed.
    pending_keys: HashSet<ResourceKey>,
    drain: Option<TaskHandle<usize>>,
}

/// Frame-gated queue of resources awaiting destruction.
pub struct DestructionQueue {
    backend: Arc<dyn GpuBackend>,
    tasks: Arc<TaskSystem>,
    state: Arc<Mutex<QueueState>>,
    destroyed: Arc<AtomicU64>,
    frame_count: u32,
}

impl DestructionQueue {
    pub fn new(backend: Arc<dyn GpuBackend>, tasks: Arc<TaskSystem>, frame_count: u32) -> Self {
        assert!(frame_count > 0, "destruction queue needs at least one frame slot");
        Self {
            backend,
            tasks,
            state: Arc::new(Mutex::new(QueueState {
                buckets: (0..frame_count).map(|_| Vec::new()).collect(),
                active_slot: 0,
                ready: Vec::new(),
                pending_keys: HashSet::new(),
                drain: None,
            })),
            destroyed: Arc::new(AtomicU64::new(0)),
            frame_count,
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Queue a resource for destruction once the GPU is done with it.
    ///
    /// Callable from any thread. Retiring a resource that is already queued
    /// is a programmer error.
    pub fn retire(&self, resource: GpuResource) {
        log::trace!("Retiring {resource}");
        let mut state = self.state.lock();
        let newly_retired = state.pending_keys.insert(resource.key());
        debug_assert!(newly_retired, "{resource} retired twice");
        let slot = state.active_slot;
        state.buckets[slot].push(DestructionRecord {
            resource,
            frames_elapsed: 0,
        });
    }

    /// Retire several resources at once.
    pub fn retire_all(&self, resources: impl IntoIterator<Item = GpuResource>) {
        for resource in resources {
            self.retire(resource);
        }
    }

    /// Advance the queue by one frame.
    ///
    /// `frame_index` becomes the active slot for following retirements.
    /// `fence_signaled[i]` tells whether slot `i`'s fence has signaled.
    pub fn sweep(&self, frame_index: u32, fence_signaled: &[bool]) {
        inflight_core::profile_scope!("destruction_sweep");
        assert_eq!(
            fence_signaled.len(),
            self.frame_count as usize,
            "one fence status per frame slot"
        );

        let finished_drain = {
            let mut state = self.state.lock();
            let frame_count = self.frame_count;
            let mut promoted = Vec::new();
            for (slot, bucket) in state.buckets.iter_mut().enumerate() {
                for record in bucket.iter_mut() {
                    record.frames_elapsed += 1;
                }
                if !fence_signaled[slot] {
                    continue;
                }
                let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(bucket)
                    .into_iter()
                    .partition(|record| record.frames_elapsed >= frame_count);
                *bucket = waiting;
                promoted.extend(ready.into_iter().map(|record| record.resource));
            }
            state.ready.extend(promoted);
            state.active_slot = frame_index as usize;
            inflight_core::profile_plot!(
                "retired resources",
                state.buckets.iter().map(Vec::len).sum::<usize>()
            );

            match state.drain.take() {
                Some(drain) if !drain.is_finished() => {
                    // Previous drain still running; try again next frame.
                    state.drain = Some(drain);
                    None
                }
                finished => {
                    if !state.ready.is_empty() {
                        let batch = std::mem::take(&mut state.ready);
                        state.drain = Some(self.spawn_drain(batch));
                    }
                    finished
                }
            }
        };

        // Finished already, so this only collects the result.
        if let Some(drain) = finished_drain {
            self.tasks.wait(drain);
        }
    }

    fn spawn_drain(&self, batch: Vec<GpuResource>) -> TaskHandle<usize> {
        log::debug!("Draining {} retired resources", batch.len());
        let backend = Arc::clone(&self.backend);
        let state = Arc::clone(&self.state);
        let destroyed = Arc::clone(&self.destroyed);
        self.tasks.spawn(move || {
            inflight_core::profile_scope!("destruction_drain");
            let keys: Vec<ResourceKey> = batch.iter().map(GpuResource::key).collect();
            let count = batch.len();
            for resource in batch {
                backend.destroy(resource);
            }
            let mut state = state.lock();
            for key in &keys {
                state.pending_keys.remove(key);
            }
            destroyed.fetch_add(count as u64, Ordering::Release);
            count
        })
    }

    /// Block until the current drain task (if any) has finished.
    pub fn wait_drain(&self) {
        let drain = self.state.lock().drain.take();
        if let Some(drain) = drain {
            self.tasks.wait(drain);
        }
    }

    /// Destroy everything still queued, regardless of age.
    ///
    /// Only valid once the device is idle, typically at shutdown.
    pub fn flush(&self) {
        self.wait_drain();
        let resources: Vec<GpuResource> = {
            let mut state = self.state.lock();
            let mut resources = std::mem::take(&mut state.ready);
            for bucket in &mut state.buckets {
                resources.extend(bucket.drain(..).map(|record| record.resource));
            }
            state.pending_keys.clear();
            resources
        };
        if !resources.is_empty() {
            log::debug!("Flushing {} retired resources", resources.len());
        }
        let count = resources.len() as u64;
        for resource in resources {
            self.backend.destroy(resource);
        }
        self.destroyed.fetch_add(count, Ordering::Release);
    }

    /// Records still waiting in a slot bucket.
    pub fn pending_count(&self) -> usize {
        self.state.lock().buckets.iter().map(Vec::len).sum()
    }

    /// Records promoted but not yet handed to a drain task.
    pub fn ready_count(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Total resources destroyed through this queue.
    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Returns true if `resource` was retired and has not been destroyed yet.
    pub fn is_pending(&self, resource: &GpuResource) -> bool {
        self.state.lock().pending_keys.contains(&resource.key())
    }

    /// Snapshot of the records waiting in `slot`'s bucket.
    pub fn bucket(&self, slot: usize) -> Vec<DestructionRecord> {
        self.state.lock().buckets[slot].clone()
    }
}

impl std::fmt::Debug for DestructionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DestructionQueue")
            .field("frame_count", &self.frame_count)
            .field("active_slot", &state.active_slot)
            .field("pending", &state.buckets.iter().map(Vec::len).sum::<usize>())
            .field("ready", &state.ready.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(DestructionQueue: Send, Sync);

impl Drop for DestructionQueue {
    fn drop(&mut self) {
        let state = self.state.lock();
        let leaked = state.pending_keys.len();
        if leaked > 0 {
            log::warn!("Destruction queue dropped with {leaked} resources not destroyed");
        }
    }
}
