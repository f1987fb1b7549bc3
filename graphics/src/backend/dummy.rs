//! Dummy GPU backend for testing and headless runs.
//!
//! This backend does not talk to a GPU. Every native object lives in one
//! generation-checked [`Arena`], so a handle used after destruction is
//! detected instead of aliasing a newer object. Command buffers store the
//! commands recorded into them and are replayed when their submission
//! completes: render pass clears and texture copies are applied to texture
//! contents, which makes cleared attachments readable through
//! [`GpuBackend::read_texture`].
//!
//! Submissions complete either immediately ([`CompletionMode::Immediate`])
//! or when the test says so ([`CompletionMode::Deferred`]), which lets tests
//! observe what the engine does while the "GPU" is still busy. Hazards that a
//! real device would turn into corruption are counted in [`DummyStats`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use crate::arena::{Arena, ArenaIndex};
use crate::error::GraphicsError;
use crate::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, FenceHandle, FramebufferHandle, PipelineHandle,
    PipelineLayoutHandle, RenderPassHandle, SemaphoreHandle, ShaderModuleHandle, TextureHandle,
};
use crate::resource::{GpuResource, ResourceKey};
use crate::types::{
    BufferDescriptor, ClearValue, DescriptorBinding, DescriptorType, ShaderStages,
    TextureDescriptor, TextureFormat, TextureLayout,
};

use super::{
    Command, CommandBufferBegin, CommandBufferLevel, FramebufferDescriptor, GpuBackend,
    GraphicsPipelineDescriptor, PipelineLayoutDescriptor, RenderPassDescriptor, Submission,
};

/// Largest texture width or height the dummy device accepts.
pub const MAX_TEXTURE_DIMENSION: u32 = 16384;

/// When submitted work finishes on the dummy device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Work completes inside `submit`.
    #[default]
    Immediate,
    /// Work stays pending until [`DummyBackend::complete_next`],
    /// [`DummyBackend::complete_all`], or a wait on its fence.
    Deferred,
}

/// Counters collected by the dummy device.
#[derive(Debug, Clone, Default)]
pub struct DummyStats {
    pub submissions: u64,
    pub fence_waits: u64,
    /// Waits on a fence that was already waited on since it last signaled.
    pub redundant_fence_waits: u64,
    /// Begins or records on a command buffer whose submission is unfinished.
    pub writes_while_pending: u64,
    /// Objects destroyed while a pending submission still referenced them.
    pub destroyed_while_pending: u64,
    /// Barriers and render passes whose expected layout did not match.
    pub layout_mismatches: u64,
    pub render_passes_executed: u64,
    pub draws_executed: u64,
    pub copies_executed: u64,
    /// Destroy calls on handles that were not alive.
    pub double_destroys: u64,
    /// Destroy calls per resource.
    pub destroy_calls: HashMap<ResourceKey, u32>,
}

impl DummyStats {
    /// How many times `resource` was passed to `destroy`.
    pub fn destroy_count(&self, resource: &GpuResource) -> u32 {
        self.destroy_calls.get(&resource.key()).copied().unwrap_or(0)
    }

    /// Total destroy calls.
    pub fn total_destroys(&self) -> u64 {
        self.destroy_calls.values().map(|&n| n as u64).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordStatus {
    Initial,
    Recording,
    Executable,
    Pending,
}

struct CommandBufferState {
    pool: CommandPoolHandle,
    level: CommandBufferLevel,
    status: RecordStatus,
    commands: Vec<Command>,
}

struct TextureState {
    descriptor: TextureDescriptor,
    contents: Vec<u8>,
    layout: TextureLayout,
}

struct DescriptorSetState {
    layout: DescriptorSetLayoutHandle,
    buffers: HashMap<u32, (BufferHandle, u64, u64)>,
}

enum Object {
    Fence { signaled: bool, waits_since_signal: u32 },
    Semaphore,
    CommandPool { buffers: Vec<CommandBufferHandle> },
    CommandBuffer(CommandBufferState),
    Buffer { data: Vec<u8> },
    Texture(TextureState),
    ShaderModule,
    DescriptorSetLayout(Vec<DescriptorBinding>),
    DescriptorSet(DescriptorSetState),
    PipelineLayout,
    Pipeline,
    RenderPass(RenderPassDescriptor),
    Framebuffer(FramebufferDescriptor),
}

struct PendingSubmission {
    submission: Submission,
    /// Raw handles of every object the submission touches.
    references: HashSet<u64>,
}

struct State {
    objects: Arena<Object>,
    pending: VecDeque<PendingSubmission>,
    mode: CompletionMode,
    device_lost: bool,
    stats: DummyStats,
}

/// Dummy GPU backend.
pub struct DummyBackend {
    state: Mutex<State>,
}

fn index(raw: u64) -> ArenaIndex {
    ArenaIndex::from_bits(raw)
}

fn invalid(what: &str, raw: u64) -> GraphicsError {
    GraphicsError::InvalidParameter(format!("unknown or destroyed {what} {raw:#x}"))
}

impl DummyBackend {
    /// Create a dummy backend that completes work immediately.
    pub fn new() -> Self {
        Self::with_completion(CompletionMode::Immediate)
    }

    pub fn with_completion(mode: CompletionMode) -> Self {
        Self {
            state: Mutex::new(State {
                objects: Arena::new(),
                pending: VecDeque::new(),
                mode,
                device_lost: false,
                stats: DummyStats::default(),
            }),
        }
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.state.lock().mode = mode;
    }

    /// Finish the oldest pending submission. Returns false if none is pending.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        match state.pending.pop_front() {
            Some(pending) => {
                state.execute(&pending.submission);
                true
            }
            None => false,
        }
    }

    /// Finish every pending submission, returning how many completed.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        state.complete_all()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Make every following wait and submission fail with `DeviceLost`.
    pub fn lose_device(&self) {
        self.state.lock().device_lost = true;
    }

    pub fn stats(&self) -> DummyStats {
        self.state.lock().stats.clone()
    }

    /// Commands currently recorded in a command buffer.
    pub fn recorded_commands(&self, command_buffer: CommandBufferHandle) -> Vec<Command> {
        match self.state.lock().objects.get(index(command_buffer.raw())) {
            Some(Object::CommandBuffer(cb)) => cb.commands.clone(),
            _ => Vec::new(),
        }
    }

    pub fn texture_contents(&self, texture: TextureHandle) -> Option<Vec<u8>> {
        match self.state.lock().objects.get(index(texture.raw())) {
            Some(Object::Texture(t)) => Some(t.contents.clone()),
            _ => None,
        }
    }

    pub fn texture_layout(&self, texture: TextureHandle) -> Option<TextureLayout> {
        match self.state.lock().objects.get(index(texture.raw())) {
            Some(Object::Texture(t)) => Some(t.layout),
            _ => None,
        }
    }

    /// Descriptor a live render pass was created from.
    pub fn render_pass_descriptor(
        &self,
        render_pass: RenderPassHandle,
    ) -> Option<RenderPassDescriptor> {
        self.state.lock().render_pass(render_pass).cloned()
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        match self.state.lock().objects.get(index(buffer.raw())) {
            Some(Object::Buffer { data }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Returns true if the object behind `resource` has not been destroyed.
    pub fn is_alive(&self, resource: &GpuResource) -> bool {
        let state = self.state.lock();
        match resource {
            GpuResource::CommandBuffers { buffers, .. } => buffers
                .iter()
                .any(|b| state.objects.contains(index(b.raw()))),
            other => state.objects.contains(index(other.raw())),
        }
    }

    /// Number of live native objects of any kind.
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DummyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DummyBackend")
            .field("mode", &state.mode)
            .field("objects", &state.objects.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(DummyBackend: Send, Sync);

impl State {
    fn insert(&mut self, object: Object) -> u64 {
        self.objects.insert(object).to_bits()
    }

    fn command_buffer(
        &mut self,
        command_buffer: CommandBufferHandle,
    ) -> Result<&mut CommandBufferState, GraphicsError> {
        match self.objects.get_mut(index(command_buffer.raw())) {
            Some(Object::CommandBuffer(cb)) => Ok(cb),
            _ => Err(invalid("command buffer", command_buffer.raw())),
        }
    }

    fn texture(&mut self, texture: TextureHandle) -> Option<&mut TextureState> {
        match self.objects.get_mut(index(texture.raw())) {
            Some(Object::Texture(t)) => Some(t),
            _ => None,
        }
    }

    fn render_pass(&self, render_pass: RenderPassHandle) -> Option<&RenderPassDescriptor> {
        match self.objects.get(index(render_pass.raw())) {
            Some(Object::RenderPass(desc)) => Some(desc),
            _ => None,
        }
    }

    fn framebuffer(&self, framebuffer: FramebufferHandle) -> Option<&FramebufferDescriptor> {
        match self.objects.get(index(framebuffer.raw())) {
            Some(Object::Framebuffer(desc)) => Some(desc),
            _ => None,
        }
    }

    fn complete_all(&mut self) -> usize {
        let mut count = 0;
        while let Some(pending) = self.pending.pop_front() {
            self.execute(&pending.submission);
            count += 1;
        }
        count
    }

    /// Complete pending submissions in order until `fence` has signaled.
    fn complete_until(&mut self, fence: FenceHandle) -> bool {
        let Some(position) = self
            .pending
            .iter()
            .position(|p| p.submission.fence == Some(fence))
        else {
            return false;
        };
        let completed: Vec<_> = self.pending.drain(..=position).collect();
        for pending in completed {
            self.execute(&pending.submission);
        }
        true
    }

    /// Collect every handle a submission touches.
    fn references(&self, submission: &Submission) -> HashSet<u64> {
        let mut refs = HashSet::new();
        let mut queue = vec![submission.command_buffer];
        while let Some(cb) = queue.pop() {
            refs.insert(cb.raw());
            let Some(Object::CommandBuffer(state)) = self.objects.get(index(cb.raw())) else {
                continue;
            };
            refs.insert(state.pool.raw());
            for command in &state.commands {
                match command {
                    Command::BeginRenderPass {
                        render_pass,
                        framebuffer,
                        ..
                    } => {
                        refs.insert(render_pass.raw());
                        refs.insert(framebuffer.raw());
                        if let Some(fb) = self.framebuffer(*framebuffer) {
                            refs.extend(fb.attachments.iter().map(|t| t.raw()));
                        }
                    }
                    Command::ExecuteCommands(secondaries) => queue.extend(secondaries),
                    Command::TextureBarrier { texture, .. } => {
                        refs.insert(texture.raw());
                    }
                    Command::CopyTexture {
                        source,
                        destination,
                        ..
                    } => {
                        refs.insert(source.raw());
                        refs.insert(destination.raw());
                    }
                    Command::BindPipeline(pipeline) => {
                        refs.insert(pipeline.raw());
                    }
                    Command::BindDescriptorSets { layout, sets, .. } => {
                        refs.insert(layout.raw());
                        for set in sets {
                            refs.insert(set.raw());
                            if let Some(Object::DescriptorSet(bound)) =
                                self.objects.get(index(set.raw()))
                            {
                                refs.extend(bound.buffers.values().map(|(b, _, _)| b.raw()));
                            }
                        }
                    }
                    Command::PushConstants { layout, .. } => {
                        refs.insert(layout.raw());
                    }
                    Command::BindVertexBuffers { buffers, .. } => {
                        refs.extend(buffers.iter().map(|(b, _)| b.raw()));
                    }
                    Command::BindIndexBuffer { buffer, .. } => {
                        refs.insert(buffer.raw());
                    }
                    Command::NextSubpass { .. }
                    | Command::EndRenderPass
                    | Command::Draw { .. }
                    | Command::DrawIndexed { .. } => {}
                }
            }
        }
        refs
    }

    fn set_status(&mut self, command_buffer: CommandBufferHandle, status: RecordStatus) {
        if let Ok(cb) = self.command_buffer(command_buffer) {
            cb.status = status;
        }
    }

    fn check_layout(&mut self, texture: TextureHandle, expected: TextureLayout) {
        let Some(state) = self.texture(texture) else {
            return;
        };
        // Expecting `Undefined` discards the contents, so any layout will do.
        if expected != TextureLayout::Undefined && state.layout != expected {
            log::warn!(
                "DummyBackend: texture {:#x} is in {:?}, expected {:?}",
                texture.raw(),
                state.layout,
                expected
            );
            self.stats.layout_mismatches += 1;
        }
    }

    /// Replay a submission as if the device had executed it.
    fn execute(&mut self, submission: &Submission) {
        let primary = submission.command_buffer;
        let commands = match self.command_buffer(primary) {
            Ok(cb) => cb.commands.clone(),
            Err(e) => {
                log::error!("DummyBackend: executing submission failed: {e}");
                return;
            }
        };
        self.set_status(primary, RecordStatus::Executable);

        let mut active: Option<(Vec<TextureHandle>, Vec<TextureLayout>)> = None;
        for command in &commands {
            match command {
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    ..
                } => {
                    let (Some(pass), Some(fb)) = (
                        self.render_pass(*render_pass).cloned(),
                        self.framebuffer(*framebuffer).cloned(),
                    ) else {
                        log::error!("DummyBackend: render pass begun with a destroyed object");
                        continue;
                    };
                    for (attachment, texture) in pass.attachments.iter().zip(&fb.attachments) {
                        self.check_layout(*texture, attachment.initial_layout);
                        if let Some(value) = attachment.load.clear_value()
                            && let Some(state) = self.texture(*texture)
                        {
                            state.contents = fill(&state.descriptor, value);
                        }
                    }
                    let finals = pass.attachments.iter().map(|a| a.final_layout).collect();
                    active = Some((fb.attachments, finals));
                    self.stats.render_passes_executed += 1;
                }
                Command::EndRenderPass => {
                    if let Some((textures, finals)) = active.take() {
                        for (texture, layout) in textures.into_iter().zip(finals) {
                            if let Some(state) = self.texture(texture) {
                                state.layout = layout;
                            }
                        }
                    }
                }
                Command::ExecuteCommands(secondaries) => {
                    for secondary in secondaries {
                        let draws = match self.command_buffer(*secondary) {
                            Ok(cb) => {
                                cb.status = RecordStatus::Executable;
                                cb.commands.iter().filter(|c| c.is_draw()).count()
                            }
                            Err(_) => 0,
                        };
                        self.stats.draws_executed += draws as u64;
                    }
                }
                Command::TextureBarrier {
                    texture,
                    old_layout,
                    new_layout,
                } => {
                    self.check_layout(*texture, *old_layout);
                    if let Some(state) = self.texture(*texture) {
                        state.layout = *new_layout;
                    }
                }
                Command::CopyTexture {
                    source,
                    destination,
                    ..
                } => {
                    let data = self.texture(*source).map(|t| t.contents.clone());
                    if let (Some(data), Some(dst)) = (data, self.texture(*destination)) {
                        let len = data.len().min(dst.contents.len());
                        dst.contents[..len].copy_from_slice(&data[..len]);
                    }
                    self.stats.copies_executed += 1;
                }
                Command::Draw { .. } | Command::DrawIndexed { .. } => {
                    self.stats.draws_executed += 1;
                }
                _ => {}
            }
        }

        if let Some(fence) = submission.fence
            && let Some(Object::Fence {
                signaled,
                waits_since_signal,
            }) = self.objects.get_mut(index(fence.raw()))
        {
            *signaled = true;
            *waits_since_signal = 0;
        }
    }

    fn destroy_object(&mut self, raw: u64, what: &str) -> Option<Object> {
        if self.pending.iter().any(|p| p.references.contains(&raw)) {
            log::error!("DummyBackend: {what} {raw:#x} destroyed while in use by the device");
            self.stats.destroyed_while_pending += 1;
        }
        let object = self.objects.remove(index(raw));
        if object.is_none() {
            log::error!("DummyBackend: {what} {raw:#x} destroyed twice or never created");
            self.stats.double_destroys += 1;
        }
        object
    }
}

/// Contents of a texture cleared to `value`.
fn fill(descriptor: &TextureDescriptor, value: ClearValue) -> Vec<u8> {
    let texel = encode_texel(descriptor.format, value);
    let mut contents = Vec::with_capacity(descriptor.byte_size() as usize);
    for _ in 0..descriptor.extent.area() {
        contents.extend_from_slice(&texel);
    }
    contents
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn encode_texel(format: TextureFormat, value: ClearValue) -> Vec<u8> {
    let size = format.block_size() as usize;
    match (value, format) {
        (
            ClearValue::Color { r, g, b, a },
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb,
        ) => vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)],
        (
            ClearValue::Color { r, g, b, a },
            TextureFormat::Bgra8Unorm | TextureFormat::Bgra8UnormSrgb,
        ) => vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)],
        (ClearValue::Color { r, g, b, a }, TextureFormat::Rgba32Float) => {
            bytemuck::cast_slice::<f32, u8>(&[r, g, b, a]).to_vec()
        }
        (ClearValue::Color { r, .. }, TextureFormat::R32Float) => r.to_le_bytes().to_vec(),
        (ClearValue::DepthStencil { depth, .. }, TextureFormat::Depth32Float) => {
            depth.to_le_bytes().to_vec()
        }
        (ClearValue::DepthStencil { depth, .. }, TextureFormat::Depth16Unorm) => {
            ((depth.clamp(0.0, 1.0) * 65535.0).round() as u16)
                .to_le_bytes()
                .to_vec()
        }
        (ClearValue::DepthStencil { depth, stencil }, TextureFormat::Depth24PlusStencil8) => {
            let depth = (depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
            (depth | (stencil << 24)).to_le_bytes().to_vec()
        }
        _ => vec![0; size],
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle, GraphicsError> {
        let raw = self.state.lock().insert(Object::Fence {
            signaled,
            waits_since_signal: 0,
        });
        Ok(FenceHandle::from_raw(raw))
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle, GraphicsError> {
        Ok(SemaphoreHandle::from_raw(
            self.state.lock().insert(Object::Semaphore),
        ))
    }

    /// The timeout is not simulated: an unsignaled fence with no pending
    /// submission behind it reports a timeout straight away.
    fn wait_fence(&self, fence: FenceHandle, _timeout: Duration) -> Result<bool, GraphicsError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.device_lost {
            return Err(GraphicsError::DeviceLost);
        }
        state.stats.fence_waits += 1;

        let signaled = match state.objects.get_mut(index(fence.raw())) {
            Some(Object::Fence {
                signaled,
                waits_since_signal,
            }) => {
                *waits_since_signal += 1;
                if *waits_since_signal > 1 {
                    log::warn!("DummyBackend: fence {:#x} waited on again", fence.raw());
                    state.stats.redundant_fence_waits += 1;
                }
                *signaled
            }
            _ => return Err(invalid("fence", fence.raw())),
        };

        if signaled {
            return Ok(true);
        }
        Ok(state.complete_until(fence))
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), GraphicsError> {
        match self.state.lock().objects.get_mut(index(fence.raw())) {
            Some(Object::Fence {
                signaled,
                waits_since_signal,
            }) => {
                *signaled = false;
                *waits_since_signal = 0;
                Ok(())
            }
            _ => Err(invalid("fence", fence.raw())),
        }
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> Result<bool, GraphicsError> {
        match self.state.lock().objects.get(index(fence.raw())) {
            Some(Object::Fence { signaled, .. }) => Ok(*signaled),
            _ => Err(invalid("fence", fence.raw())),
        }
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(GraphicsError::DeviceLost);
        }
        state.complete_all();
        Ok(())
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferHandle, GraphicsError> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".to_string(),
            ));
        }
        let raw = self.state.lock().insert(Object::Buffer {
            data: vec![0; descriptor.size as usize],
        });
        Ok(BufferHandle::from_raw(raw))
    }

    fn write_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        let Some(Object::Buffer { data: contents }) = state.objects.get_mut(index(buffer.raw()))
        else {
            return Err(invalid("buffer", buffer.raw()));
        };
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<TextureHandle, GraphicsError> {
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}, {:?})",
            descriptor.label,
            descriptor.extent.width,
            descriptor.extent.height,
            descriptor.format
        );
        if descriptor.extent.area() == 0 {
            return Err(GraphicsError::InvalidParameter(
                "texture extent must be non-zero".to_string(),
            ));
        }
        if descriptor.extent.width.max(descriptor.extent.height) > MAX_TEXTURE_DIMENSION {
            return Err(GraphicsError::InvalidParameter(format!(
                "texture extent {}x{} exceeds the {MAX_TEXTURE_DIMENSION} texel limit",
                descriptor.extent.width, descriptor.extent.height
            )));
        }
        let raw = self.state.lock().insert(Object::Texture(TextureState {
            descriptor: descriptor.clone(),
            contents: vec![0; descriptor.byte_size() as usize],
            layout: TextureLayout::Undefined,
        }));
        Ok(TextureHandle::from_raw(raw))
    }

    fn read_texture(
        &self,
        texture: TextureHandle,
        layout: TextureLayout,
    ) -> Result<Vec<u8>, GraphicsError> {
        let mut state = self.state.lock();
        state.complete_all();
        state.check_layout(texture, layout);
        state
            .texture(texture)
            .map(|t| t.contents.clone())
            .ok_or_else(|| invalid("texture", texture.raw()))
    }

    fn create_shader_module(
        &self,
        stage: ShaderStages,
        code: &[u32],
    ) -> Result<ShaderModuleHandle, GraphicsError> {
        log::trace!("DummyBackend: creating {stage:?} shader ({} words)", code.len());
        if code.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "shader code is empty".to_string(),
            ));
        }
        Ok(ShaderModuleHandle::from_raw(
            self.state.lock().insert(Object::ShaderModule),
        ))
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutHandle, GraphicsError> {
        let raw = self
            .state
            .lock()
            .insert(Object::DescriptorSetLayout(bindings.to_vec()));
        Ok(DescriptorSetLayoutHandle::from_raw(raw))
    }

    fn allocate_descriptor_set(
        &self,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle, GraphicsError> {
        let mut state = self.state.lock();
        if !matches!(
            state.objects.get(index(layout.raw())),
            Some(Object::DescriptorSetLayout(_))
        ) {
            return Err(invalid("descriptor set layout", layout.raw()));
        }
        let raw = state.insert(Object::DescriptorSet(DescriptorSetState {
            layout,
            buffers: HashMap::new(),
        }));
        Ok(DescriptorSetHandle::from_raw(raw))
    }

    fn write_buffer_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        ty: DescriptorType,
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if !matches!(state.objects.get(index(buffer.raw())), Some(Object::Buffer { .. })) {
            return Err(invalid("buffer", buffer.raw()));
        }
        let layout = match state.objects.get(index(set.raw())) {
            Some(Object::DescriptorSet(s)) => s.layout,
            _ => return Err(invalid("descriptor set", set.raw())),
        };
        let declared = match state.objects.get(index(layout.raw())) {
            Some(Object::DescriptorSetLayout(bindings)) => {
                bindings.iter().find(|b| b.binding == binding).map(|b| b.ty)
            }
            _ => None,
        };
        if declared != Some(ty) {
            return Err(GraphicsError::InvalidParameter(format!(
                "binding {binding} is {declared:?}, not {ty:?}"
            )));
        }
        if let Some(Object::DescriptorSet(s)) = state.objects.get_mut(index(set.raw())) {
            s.buffers.insert(binding, (buffer, offset, range));
        }
        Ok(())
    }

    fn create_pipeline_layout(
        &self,
        descriptor: &PipelineLayoutDescriptor,
    ) -> Result<PipelineLayoutHandle, GraphicsError> {
        let mut state = self.state.lock();
        for layout in &descriptor.set_layouts {
            if !state.objects.contains(index(layout.raw())) {
                return Err(invalid("descriptor set layout", layout.raw()));
            }
        }
        Ok(PipelineLayoutHandle::from_raw(
            state.insert(Object::PipelineLayout),
        ))
    }

    fn create_render_pass(
        &self,
        descriptor: &RenderPassDescriptor,
    ) -> Result<RenderPassHandle, GraphicsError> {
        log::trace!(
            "DummyBackend: creating render pass {:?} ({} attachments, {} subpasses)",
            descriptor.label,
            descriptor.attachments.len(),
            descriptor.subpasses.len()
        );
        let attachment_count = descriptor.attachments.len() as u32;
        let out_of_range = descriptor.subpasses.iter().any(|subpass| {
            subpass
                .color_attachments
                .iter()
                .chain(subpass.depth_attachment.iter())
                .any(|&i| i >= attachment_count)
        });
        if descriptor.subpasses.is_empty() || out_of_range {
            return Err(GraphicsError::InvalidParameter(
                "render pass subpasses reference missing attachments".to_string(),
            ));
        }
        let raw = self
            .state
            .lock()
            .insert(Object::RenderPass(descriptor.clone()));
        Ok(RenderPassHandle::from_raw(raw))
    }

    fn create_framebuffer(
        &self,
        descriptor: &FramebufferDescriptor,
    ) -> Result<FramebufferHandle, GraphicsError> {
        let mut state = self.state.lock();
        let Some(pass) = state.render_pass(descriptor.render_pass).cloned() else {
            return Err(invalid("render pass", descriptor.render_pass.raw()));
        };
        if pass.attachments.len() != descriptor.attachments.len() {
            return Err(GraphicsError::InvalidParameter(format!(
                "framebuffer has {} attachments, render pass expects {}",
                descriptor.attachments.len(),
                pass.attachments.len()
            )));
        }
        for (attachment, texture) in pass.attachments.iter().zip(&descriptor.attachments) {
            let Some(t) = state.texture(*texture) else {
                return Err(invalid("texture", texture.raw()));
            };
            if t.descriptor.format != attachment.format
                || t.descriptor.extent != descriptor.extent
            {
                return Err(GraphicsError::InvalidParameter(format!(
                    "texture {:#x} does not match its framebuffer attachment",
                    texture.raw()
                )));
            }
        }
        Ok(FramebufferHandle::from_raw(
            state.insert(Object::Framebuffer(descriptor.clone())),
        ))
    }

    fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> Result<PipelineHandle, GraphicsError> {
        let mut state = self.state.lock();
        if !matches!(
            state.objects.get(index(descriptor.layout.raw())),
            Some(Object::PipelineLayout)
        ) {
            return Err(invalid("pipeline layout", descriptor.layout.raw()));
        }
        let Some(pass) = state.render_pass(descriptor.render_pass) else {
            return Err(invalid("render pass", descriptor.render_pass.raw()));
        };
        let Some(subpass) = pass.subpasses.get(descriptor.subpass as usize) else {
            return Err(GraphicsError::InvalidParameter(format!(
                "render pass has no subpass {}",
                descriptor.subpass
            )));
        };
        if subpass.color_attachments.len() as u32 != descriptor.color_attachment_count {
            return Err(GraphicsError::InvalidParameter(
                "pipeline color outputs do not match the subpass".to_string(),
            ));
        }
        for stage in &descriptor.stages {
            if !matches!(
                state.objects.get(index(stage.module.raw())),
                Some(Object::ShaderModule)
            ) {
                return Err(invalid("shader module", stage.module.raw()));
            }
        }
        Ok(PipelineHandle::from_raw(state.insert(Object::Pipeline)))
    }

    fn destroy(&self, resource: GpuResource) {
        log::trace!("DummyBackend: destroying {resource}");
        let mut state = self.state.lock();
        *state.stats.destroy_calls.entry(resource.key()).or_default() += 1;

        let kind = resource.kind();
        match resource {
            GpuResource::CommandBuffers { pool, buffers } => {
                for buffer in &buffers {
                    state.destroy_object(buffer.raw(), kind.name());
                }
                if let Some(Object::CommandPool { buffers: owned }) =
                    state.objects.get_mut(index(pool.raw()))
                {
                    owned.retain(|b| !buffers.contains(b));
                }
            }
            GpuResource::CommandPool(pool) => {
                // Destroying a pool frees the buffers still allocated from it.
                if let Some(Object::CommandPool { buffers }) =
                    state.destroy_object(pool.raw(), kind.name())
                {
                    for buffer in buffers {
                        state.objects.remove(index(buffer.raw()));
                    }
                }
            }
            other => {
                let raw = other.raw();
                let object = state.destroy_object(raw, kind.name());
                let matches = match (&other, &object) {
                    (_, None) => true,
                    (GpuResource::Buffer(_), Some(Object::Buffer { .. }))
                    | (
                        GpuResource::Texture(_)
                        | GpuResource::RenderTarget(_)
                        | GpuResource::DepthBuffer(_),
                        Some(Object::Texture(_)),
                    )
                    | (GpuResource::DescriptorSet(_), Some(Object::DescriptorSet(_)))
                    | (GpuResource::DescriptorSetLayout(_), Some(Object::DescriptorSetLayout(_)))
                    | (GpuResource::Pipeline(_), Some(Object::Pipeline))
                    | (GpuResource::PipelineLayout(_), Some(Object::PipelineLayout))
                    | (GpuResource::RenderPass(_), Some(Object::RenderPass(_)))
                    | (GpuResource::Framebuffer(_), Some(Object::Framebuffer(_)))
                    | (GpuResource::Fence(_), Some(Object::Fence { .. }))
                    | (GpuResource::Semaphore(_), Some(Object::Semaphore))
                    | (GpuResource::ShaderModule(_), Some(Object::ShaderModule)) => true,
                    _ => false,
                };
                assert!(matches, "destroyed {other} through a handle of another kind");
            }
        }
    }

    fn create_command_pool(&self) -> Result<CommandPoolHandle, GraphicsError> {
        let raw = self
            .state
            .lock()
            .insert(Object::CommandPool { buffers: Vec::new() });
        Ok(CommandPoolHandle::from_raw(raw))
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        level: CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>, GraphicsError> {
        let mut state = self.state.lock();
        if !matches!(
            state.objects.get(index(pool.raw())),
            Some(Object::CommandPool { .. })
        ) {
            return Err(invalid("command pool", pool.raw()));
        }
        let buffers: Vec<_> = (0..count)
            .map(|_| {
                CommandBufferHandle::from_raw(state.insert(Object::CommandBuffer(
                    CommandBufferState {
                        pool,
                        level,
                        status: RecordStatus::Initial,
                        commands: Vec::new(),
                    },
                )))
            })
            .collect();
        if let Some(Object::CommandPool { buffers: owned }) =
            state.objects.get_mut(index(pool.raw()))
        {
            owned.extend_from_slice(&buffers);
        }
        Ok(buffers)
    }

    fn begin_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        begin: &CommandBufferBegin,
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        let cb = state.command_buffer(command_buffer)?;
        let pending = cb.status == RecordStatus::Pending;
        let level_matches = matches!(
            (cb.level, begin),
            (CommandBufferLevel::Primary, CommandBufferBegin::Primary)
                | (CommandBufferLevel::Secondary, CommandBufferBegin::Secondary(_))
        );
        if !level_matches {
            return Err(GraphicsError::InvalidParameter(format!(
                "{:?} command buffer begun as {begin:?}",
                cb.level
            )));
        }
        cb.status = RecordStatus::Recording;
        cb.commands.clear();
        if pending {
            log::error!(
                "DummyBackend: command buffer {:#x} reset while still pending",
                command_buffer.raw()
            );
            state.stats.writes_while_pending += 1;
        }
        Ok(())
    }

    fn end_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        let cb = state.command_buffer(command_buffer)?;
        if cb.status != RecordStatus::Recording {
            return Err(GraphicsError::InvalidParameter(format!(
                "command buffer {:#x} ended while {:?}",
                command_buffer.raw(),
                cb.status
            )));
        }
        cb.status = RecordStatus::Executable;
        Ok(())
    }

    fn record(&self, command_buffer: CommandBufferHandle, command: Command) {
        let mut state = self.state.lock();
        let status = match state.command_buffer(command_buffer) {
            Ok(cb) => {
                let status = cb.status;
                cb.commands.push(command);
                status
            }
            Err(e) => {
                log::error!("DummyBackend: record failed: {e}");
                return;
            }
        };
        match status {
            RecordStatus::Recording => {}
            RecordStatus::Pending => state.stats.writes_while_pending += 1,
            other => log::warn!(
                "DummyBackend: recording into command buffer {:#x} while {other:?}",
                command_buffer.raw()
            ),
        }
    }

    fn submit(&self, submission: &Submission) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(GraphicsError::DeviceLost);
        }

        let cb = state.command_buffer(submission.command_buffer)?;
        match cb.status {
            RecordStatus::Executable => {}
            RecordStatus::Pending => {
                return Err(GraphicsError::InvalidParameter(
                    "command buffer submitted while still pending".to_string(),
                ));
            }
            other => {
                return Err(GraphicsError::InvalidParameter(format!(
                    "command buffer submitted while {other:?}"
                )));
            }
        }
        if let Some(fence) = submission.fence {
            match state.objects.get(index(fence.raw())) {
                Some(Object::Fence { signaled: false, .. }) => {}
                Some(Object::Fence { signaled: true, .. }) => {
                    return Err(GraphicsError::InvalidParameter(
                        "submission fence must be unsignaled".to_string(),
                    ));
                }
                _ => return Err(invalid("fence", fence.raw())),
            }
        }

        let references = state.references(submission);
        for raw in &references {
            if let Some(Object::CommandBuffer(cb)) = state.objects.get_mut(index(*raw)) {
                cb.status = RecordStatus::Pending;
            }
        }
        state.stats.submissions += 1;

        match state.mode {
            CompletionMode::Immediate => state.execute(submission),
            CompletionMode::Deferred => state.pending.push_back(PendingSubmission {
                submission: submission.clone(),
                references,
            }),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttachmentDescriptor, SubpassContents, SubpassDescriptor};
    use crate::types::{BufferUsage, Extent2d, LoadOp, SampleCount, StoreOp, TextureUsage};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn color_target(backend: &DummyBackend) -> TextureHandle {
        backend
            .create_texture(&TextureDescriptor::new(
                Extent2d::new(2, 2),
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
            ))
            .unwrap()
    }

    fn clear_pass(
        backend: &DummyBackend,
        texture: TextureHandle,
    ) -> (RenderPassHandle, FramebufferHandle) {
        let pass = backend
            .create_render_pass(&RenderPassDescriptor {
                label: None,
                attachments: vec![AttachmentDescriptor {
                    format: TextureFormat::Rgba8Unorm,
                    samples: SampleCount::X1,
                    load: LoadOp::Clear(ClearValue::color(1.0, 0.0, 0.0, 1.0)),
                    store: StoreOp::Store,
                    initial_layout: TextureLayout::Undefined,
                    final_layout: TextureLayout::ShaderReadOnly,
                }],
                subpasses: vec![SubpassDescriptor {
                    color_attachments: vec![0],
                    depth_attachment: None,
                }],
                dependencies: Vec::new(),
            })
            .unwrap();
        let framebuffer = backend
            .create_framebuffer(&FramebufferDescriptor {
                render_pass: pass,
                attachments: vec![texture],
                extent: Extent2d::new(2, 2),
            })
            .unwrap();
        (pass, framebuffer)
    }

    fn primary(backend: &DummyBackend) -> CommandBufferHandle {
        let pool = backend.create_command_pool().unwrap();
        backend
            .allocate_command_buffers(pool, CommandBufferLevel::Primary, 1)
            .unwrap()[0]
    }

    #[test]
    fn test_clear_is_applied_on_completion() {
        let backend = DummyBackend::with_completion(CompletionMode::Deferred);
        let texture = color_target(&backend);
        let (pass, framebuffer) = clear_pass(&backend, texture);
        let cb = primary(&backend);
        let fence = backend.create_fence(false).unwrap();

        backend.begin_command_buffer(cb, &CommandBufferBegin::Primary).unwrap();
        backend.record(
            cb,
            Command::BeginRenderPass {
                render_pass: pass,
                framebuffer,
                extent: Extent2d::new(2, 2),
                clear_values: vec![ClearValue::color(1.0, 0.0, 0.0, 1.0)],
                contents: SubpassContents::Inline,
            },
        );
        backend.record(cb, Command::EndRenderPass);
        backend.end_command_buffer(cb).unwrap();
        backend
            .submit(&Submission {
                command_buffer: cb,
                wait_semaphores: Vec::new(),
                signal_semaphores: Vec::new(),
                fence: Some(fence),
            })
            .unwrap();

        assert_eq!(backend.texture_contents(texture).unwrap(), vec![0; 16]);
        assert!(!backend.is_fence_signaled(fence).unwrap());

        // Waiting on the fence lets the device catch up.
        assert!(backend.wait_fence(fence, TIMEOUT).unwrap());
        let contents = backend.texture_contents(texture).unwrap();
        assert_eq!(&contents[..4], &[255, 0, 0, 255]);
        assert_eq!(
            backend.texture_layout(texture),
            Some(TextureLayout::ShaderReadOnly)
        );
    }

    #[test]
    fn test_loading_undefined_contents_is_a_mismatch() {
        let backend = DummyBackend::new();
        let texture = color_target(&backend);
        let pass = backend
            .create_render_pass(&RenderPassDescriptor {
                label: None,
                attachments: vec![AttachmentDescriptor {
                    format: TextureFormat::Rgba8Unorm,
                    samples: SampleCount::X1,
                    load: LoadOp::Load,
                    store: StoreOp::Store,
                    initial_layout: TextureLayout::ShaderReadOnly,
                    final_layout: TextureLayout::ShaderReadOnly,
                }],
                subpasses: vec![SubpassDescriptor {
                    color_attachments: vec![0],
                    depth_attachment: None,
                }],
                dependencies: Vec::new(),
            })
            .unwrap();
        let framebuffer = backend
            .create_framebuffer(&FramebufferDescriptor {
                render_pass: pass,
                attachments: vec![texture],
                extent: Extent2d::new(2, 2),
            })
            .unwrap();
        let begin = |framebuffer| Command::BeginRenderPass {
            render_pass: pass,
            framebuffer,
            extent: Extent2d::new(2, 2),
            clear_values: vec![ClearValue::default()],
            contents: SubpassContents::Inline,
        };
        let submit = |cb| {
            backend
                .submit(&Submission {
                    command_buffer: cb,
                    wait_semaphores: Vec::new(),
                    signal_semaphores: Vec::new(),
                    fence: None,
                })
                .unwrap()
        };

        // A fresh texture is Undefined, not ShaderReadOnly.
        let cb = primary(&backend);
        backend.begin_command_buffer(cb, &CommandBufferBegin::Primary).unwrap();
        backend.record(cb, begin(framebuffer));
        backend.record(cb, Command::EndRenderPass);
        backend.end_command_buffer(cb).unwrap();
        submit(cb);
        assert_eq!(backend.stats().layout_mismatches, 1);

        // Moved out of Undefined first, the same load is fine.
        let other = color_target(&backend);
        let framebuffer = backend
            .create_framebuffer(&FramebufferDescriptor {
                render_pass: pass,
                attachments: vec![other],
                extent: Extent2d::new(2, 2),
            })
            .unwrap();
        let cb = primary(&backend);
        backend.begin_command_buffer(cb, &CommandBufferBegin::Primary).unwrap();
        backend.record(
            cb,
            Command::TextureBarrier {
                texture: other,
                old_layout: TextureLayout::Undefined,
                new_layout: TextureLayout::ShaderReadOnly,
            },
        );
        backend.record(cb, begin(framebuffer));
        backend.record(cb, Command::EndRenderPass);
        backend.end_command_buffer(cb).unwrap();
        submit(cb);
        assert_eq!(backend.stats().layout_mismatches, 1);
    }

    #[test]
    fn test_wait_without_submission_times_out() {
        let backend = DummyBackend::new();
        let fence = backend.create_fence(false).unwrap();
        assert!(!backend.wait_fence(fence, TIMEOUT).unwrap());
    }

    #[test]
    fn test_repeated_fence_wait_is_counted() {
        let backend = DummyBackend::new();
        let fence = backend.create_fence(true).unwrap();
        assert!(backend.wait_fence(fence, TIMEOUT).unwrap());
        assert!(backend.wait_fence(fence, TIMEOUT).unwrap());
        let stats = backend.stats();
        assert_eq!(stats.fence_waits, 2);
        assert_eq!(stats.redundant_fence_waits, 1);
    }

    #[test]
    fn test_rerecording_pending_buffer_is_counted() {
        let backend = DummyBackend::with_completion(CompletionMode::Deferred);
        let cb = primary(&backend);
        backend.begin_command_buffer(cb, &CommandBufferBegin::Primary).unwrap();
        backend.end_command_buffer(cb).unwrap();
        backend
            .submit(&Submission {
                command_buffer: cb,
                wait_semaphores: Vec::new(),
                signal_semaphores: Vec::new(),
                fence: None,
            })
            .unwrap();

        backend.begin_command_buffer(cb, &CommandBufferBegin::Primary).unwrap();
        assert_eq!(backend.stats().writes_while_pending, 1);
    }

    #[test]
    fn test_submit_with_signaled_fence_is_rejected() {
        let backend = DummyBackend::new();
        let cb = primary(&backend);
        let fence = backend.create_fence(true).unwrap();
        backend.begin_command_buffer(cb, &CommandBufferBegin::Primary).unwrap();
        backend.end_command_buffer(cb).unwrap();
        let result = backend.submit(&Submission {
            command_buffer: cb,
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
            fence: Some(fence),
        });
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
    }

    #[test]
    fn test_double_destroy_is_counted() {
        let backend = DummyBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::UNIFORM))
            .unwrap();
        let resource = GpuResource::Buffer(buffer);
        backend.destroy(resource.clone());
        assert!(!backend.is_alive(&resource));
        backend.destroy(resource.clone());

        let stats = backend.stats();
        assert_eq!(stats.destroy_count(&resource), 2);
        assert_eq!(stats.double_destroys, 1);
    }

    #[test]
    fn test_destroying_pool_frees_its_buffers() {
        let backend = DummyBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let buffers = backend
            .allocate_command_buffers(pool, CommandBufferLevel::Secondary, 3)
            .unwrap();
        assert_eq!(backend.live_objects(), 4);

        backend.destroy(GpuResource::CommandBuffers {
            pool,
            buffers: vec![buffers[0]],
        });
        backend.destroy(GpuResource::CommandPool(pool));
        assert_eq!(backend.live_objects(), 0);
        assert_eq!(backend.stats().double_destroys, 0);
    }

    #[test]
    fn test_destroy_while_pending_is_counted() {
        let backend = DummyBackend::with_completion(CompletionMode::Deferred);
        let texture = color_target(&backend);
        let (pass, framebuffer) = clear_pass(&backend, texture);
        let cb = primary(&backend);
        backend.begin_command_buffer(cb, &CommandBufferBegin::Primary).unwrap();
        backend.record(
            cb,
            Command::BeginRenderPass {
                render_pass: pass,
                framebuffer,
                extent: Extent2d::new(2, 2),
                clear_values: vec![ClearValue::default()],
                contents: SubpassContents::Inline,
            },
        );
        backend.record(cb, Command::EndRenderPass);
        backend.end_command_buffer(cb).unwrap();
        backend
            .submit(&Submission {
                command_buffer: cb,
                wait_semaphores: Vec::new(),
                signal_semaphores: Vec::new(),
                fence: None,
            })
            .unwrap();

        backend.destroy(GpuResource::RenderTarget(texture));
        assert_eq!(backend.stats().destroyed_while_pending, 1);
    }

    #[test]
    fn test_write_buffer_bounds() {
        let backend = DummyBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(8, BufferUsage::UNIFORM))
            .unwrap();
        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            backend.buffer_contents(buffer).unwrap(),
            vec![0, 0, 0, 0, 1, 2, 3, 4]
        );
        assert!(backend.write_buffer(buffer, 6, &[0; 4]).is_err());
    }

    #[test]
    fn test_depth_texel_encoding() {
        let texel = encode_texel(TextureFormat::Depth32Float, ClearValue::depth(1.0));
        assert_eq!(texel, 1.0f32.to_le_bytes().to_vec());
        let texel = encode_texel(
            TextureFormat::Bgra8Unorm,
            ClearValue::color(0.0, 0.5, 1.0, 1.0),
        );
        assert_eq!(texel, vec![255, 128, 0, 255]);
    }
}
