//! Buffers: vertex and index data, per-slot dynamic uniforms, readback staging.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
        /// Host-visible memory the CPU writes through [`GpuBackend::write_buffer`].
        ///
        /// [`GpuBackend::write_buffer`]: crate::backend::GpuBackend::write_buffer
        const MAP_WRITE = 1 << 6;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    /// Host-writable uniform buffer bound as a dynamic uniform of a frame slot.
    pub fn dynamic_uniform(size: u64) -> Self {
        Self::new(size, BufferUsage::UNIFORM | BufferUsage::MAP_WRITE)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether the buffer must be placed in CPU-visible memory.
    pub fn is_host_visible(&self) -> bool {
        self.usage.contains(BufferUsage::MAP_WRITE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    Uint16,
    #[default]
    Uint32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_uniform_is_host_visible() {
        let descriptor = BufferDescriptor::dynamic_uniform(256);
        assert!(descriptor.is_host_visible());
        assert!(descriptor.usage.contains(BufferUsage::UNIFORM));
        assert!(!BufferDescriptor::new(256, BufferUsage::VERTEX).is_host_visible());
    }
}
