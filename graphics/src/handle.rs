//! Typed handles to native device objects.
//!
//! Each handle is a plain `u64` owned by the backend that issued it. The dummy
//! backend packs an [`ArenaIndex`](crate::arena::ArenaIndex) into it, the
//! Vulkan backend stores the raw `vk::*` handle.

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a backend-specific raw value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The backend-specific raw value.
            pub const fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// CPU-observable completion primitive.
    FenceHandle
);
gpu_handle!(
    /// GPU-side ordering primitive between submissions.
    SemaphoreHandle
);
gpu_handle!(CommandPoolHandle);
gpu_handle!(CommandBufferHandle);
gpu_handle!(BufferHandle);
gpu_handle!(
    /// An image together with its default view.
    TextureHandle
);
gpu_handle!(ShaderModuleHandle);
gpu_handle!(DescriptorSetLayoutHandle);
gpu_handle!(DescriptorSetHandle);
gpu_handle!(PipelineLayoutHandle);
gpu_handle!(PipelineHandle);
gpu_handle!(RenderPassHandle);
gpu_handle!(FramebufferHandle);
