// novade-drm-backend/src/renderers/framebuffer.rs
use std::fmt;
use std::rc::Rc;

use tracing::{trace, warn};

use crate::errors::RenderError;
use crate::kms::{BufferGeometry, FramebufferId, KmsDevice};

/// Colour depth of scan-out framebuffers.
pub const SCANOUT_DEPTH: u32 = 24;
/// Bits per pixel of scan-out framebuffers (XRGB8888).
pub const SCANOUT_BPP: u32 = 32;

/// Owns a kernel framebuffer registration and removes it when dropped.
///
/// Stored on the GPU buffer it was created for, so the registration lives
/// exactly as long as the buffer.
pub struct FramebufferGuard {
    id: FramebufferId,
    kms: Rc<dyn KmsDevice>,
}

impl FramebufferGuard {
    pub fn new(id: FramebufferId, kms: Rc<dyn KmsDevice>) -> Self {
        Self { id, kms }
    }

    pub fn id(&self) -> FramebufferId {
        self.id
    }
}

impl fmt::Debug for FramebufferGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramebufferGuard").field("id", &self.id).finish()
    }
}

impl Drop for FramebufferGuard {
    fn drop(&mut self) {
        trace!(framebuffer = self.id.0, "Removing scan-out framebuffer");
        if let Err(err) = self.kms.destroy_framebuffer(self.id) {
            warn!(framebuffer = self.id.0, "Failed to remove framebuffer: {}", err);
        }
    }
}

/// A GPU buffer that can carry its own scan-out registration.
pub trait ScanoutBuffer {
    fn geometry(&self) -> Result<BufferGeometry, RenderError>;

    /// The cached registration, if one was attached before.
    fn framebuffer(&self) -> Option<FramebufferId>;

    /// Stores `guard` on the buffer. It is dropped together with the buffer.
    fn attach_framebuffer(&mut self, guard: FramebufferGuard) -> Result<(), RenderError>;
}

/// Returns the scan-out framebuffer of `buffer`, registering it on first use.
///
/// The mapping is stable for the buffer's lifetime, so a swap chain cycling
/// through the same buffers registers each of them exactly once.
pub fn get_or_create_scanout_id<B: ScanoutBuffer + ?Sized>(
    kms: &Rc<dyn KmsDevice>,
    buffer: &mut B,
) -> Result<FramebufferId, RenderError> {
    if let Some(id) = buffer.framebuffer() {
        return Ok(id);
    }

    let geometry = buffer.geometry()?;
    let id = kms
        .add_framebuffer(&geometry, SCANOUT_DEPTH, SCANOUT_BPP)
        .map_err(RenderError::Framebuffer)?;
    trace!(
        framebuffer = id.0,
        width = geometry.width,
        height = geometry.height,
        stride = geometry.stride,
        "Registered scan-out framebuffer"
    );

    // On failure the guard is dropped here and the registration removed.
    buffer.attach_framebuffer(FramebufferGuard::new(id, Rc::clone(kms)))?;
    Ok(id)
}
