//! Opaque handles to backend-owned objects.
//!
//! The backend owns every GPU object; callers only hold these copyable ids and
//! ask the backend to destroy what they created. Handles order by creation, which
//! gives draw sorting a stable key.

use std::fmt;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_handle!(
    /// GPU buffer.
    BufferHandle
);
define_handle!(
    /// GPU image together with its default view.
    ImageHandle
);
define_handle!(SamplerHandle);
define_handle!(ShaderModuleHandle);
define_handle!(PipelineLayoutHandle);
define_handle!(PipelineHandle);
define_handle!(DescriptorSetLayoutHandle);
define_handle!(DescriptorPoolHandle);
define_handle!(DescriptorSetHandle);
define_handle!(
    /// Command recording context. Resetting it recycles every buffer recorded from it.
    CommandPoolHandle
);
define_handle!(
    /// CPU-waitable completion signal.
    FenceHandle
);
define_handle!(
    /// GPU-only signal between queue operations.
    SemaphoreHandle
);
