// novade-drm-backend/src/renderers/mod.rs
//! GPU side of the backend: the per-device rendering context, per-output swap
//! chains and the scan-out framebuffer cache.

use std::io;
use std::os::fd::BorrowedFd;

use crate::errors::RenderError;

pub mod framebuffer;
pub mod render_context;

#[cfg(feature = "renderer_gbm")]
pub mod gbm_egl;

pub use framebuffer::{get_or_create_scanout_id, FramebufferGuard, ScanoutBuffer};
pub use render_context::RenderContext;

#[cfg(feature = "renderer_gbm")]
pub use gbm_egl::GbmEglPlatform;

/// `GBM_FORMAT_XRGB8888` fourcc: 32 bpp, 8 bits per channel, no alpha.
/// Every scan-out capable device accepts it.
pub const GBM_FORMAT_XRGB8888: u32 = u32::from_le_bytes(*b"XR24");

/// A rendering configuration together with the native pixel format it renders
/// into, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDescriptor<C> {
    pub config: C,
    pub native_visual_id: Option<u32>,
}

/// Buffer allocation device plus an EGL-like display/context API.
///
/// Acquisition methods return `None`/`false`/`Err` on failure and acquire
/// nothing in that case. Release methods are infallible; failures are logged by
/// the implementation.
pub trait GpuPlatform {
    type Device;
    type Display: Copy;
    type Config: Copy;
    type Context: Copy;
    /// Per-output swap chain bound to a presentation target.
    type Surface;
    /// A locked front buffer. Dropping it hands it back to its swap chain.
    type Buffer: ScanoutBuffer;

    /// Resolves the platform-display entry points. `false` if unsupported.
    fn load_platform_extensions(&mut self) -> bool;

    fn create_device(&mut self, fd: BorrowedFd<'_>) -> io::Result<Self::Device>;

    fn destroy_device(&mut self, device: Self::Device);

    /// Binds the ES rendering API for the calling thread.
    fn bind_es_api(&mut self) -> bool;

    /// Gets and initializes the platform display for `device`.
    fn open_display(&mut self, device: &Self::Device) -> Option<Self::Display>;

    fn terminate_display(&mut self, display: Self::Display);

    /// All configs of `display`, in platform order.
    fn configs(&mut self, display: Self::Display) -> Vec<ConfigDescriptor<Self::Config>>;

    /// Creates an ES 3 context.
    fn create_context(
        &mut self,
        display: Self::Display,
        config: Self::Config,
    ) -> Option<Self::Context>;

    fn destroy_context(&mut self, display: Self::Display, context: Self::Context);

    fn create_surface(
        &mut self,
        device: &Self::Device,
        display: Self::Display,
        config: Self::Config,
        width: u32,
        height: u32,
    ) -> Result<Self::Surface, RenderError>;

    fn destroy_surface(&mut self, display: Self::Display, surface: Self::Surface);

    /// Binds `context` with `surface` as draw and read target. `None` unbinds.
    fn make_current(
        &mut self,
        display: Self::Display,
        context: Self::Context,
        surface: Option<&Self::Surface>,
    ) -> Result<(), RenderError>;

    /// Clears the current target to `color`.
    fn clear(&mut self, width: u32, height: u32, color: [f32; 4]);

    fn swap_buffers(
        &mut self,
        display: Self::Display,
        surface: &Self::Surface,
    ) -> Result<(), RenderError>;

    fn lock_front_buffer(&mut self, surface: &Self::Surface) -> Result<Self::Buffer, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xrgb8888_fourcc() {
        assert_eq!(GBM_FORMAT_XRGB8888, 0x3432_5258);
    }
}
