// novade-drm-backend/src/backend/swap.rs
use std::rc::Rc;

use tracing::{debug, trace, warn};

use super::{DrmBackend, OutputId};
use crate::errors::{BackendError, Result};
use crate::event::{EventQueue, OutputEvent};
use crate::kms::KmsDevice;
use crate::renderers::{get_or_create_scanout_id, GpuPlatform};

impl<K, P, Q> DrmBackend<K, P, Q>
where
    K: KmsDevice + 'static,
    P: GpuPlatform,
    Q: EventQueue,
{
    /// Makes the output's surface the current drawing target.
    pub fn begin(&mut self, id: OutputId) -> Result<()> {
        let output = self.outputs.get(id.slot()).ok_or(BackendError::UnknownOutput(id))?;
        let surface = output.surface.as_ref().ok_or(BackendError::NotConnected(id))?;
        self.renderer.make_current(&surface.swapchain)?;
        Ok(())
    }

    /// Presents what was drawn since [`Self::begin`] with a page flip.
    ///
    /// The caller must wait for [`OutputEvent::RenderReady`] before calling
    /// this again; a second flip while one is outstanding is rejected by the
    /// kernel.
    pub fn end(&mut self, id: OutputId) -> Result<()> {
        let kms: Rc<dyn KmsDevice> = self.kms.clone();
        let output = self.outputs.get_mut(id.slot()).ok_or(BackendError::UnknownOutput(id))?;
        if output.flip_pending {
            warn!(output = %id, "Page flip requested while the previous one is still pending");
        }
        let crtc = output.crtc.ok_or(BackendError::NotConnected(id))?;
        let surface = output.surface.as_mut().ok_or(BackendError::NotConnected(id))?;

        self.renderer.swap_buffers(&surface.swapchain)?;
        let mut buffer = self.renderer.lock_front_buffer(&surface.swapchain)?;
        let framebuffer = get_or_create_scanout_id(&kms, &mut buffer)?;
        self.kms.page_flip(crtc, framebuffer)?;
        // Hand the buffer back to the swap chain; its framebuffer stays cached on it.
        drop(buffer);

        surface.last_framebuffer = Some(framebuffer);
        output.flip_pending = true;
        trace!(output = %id, framebuffer = framebuffer.0, "Page flip scheduled");
        Ok(())
    }

    /// Reads queued page-flip completions and routes each to the output that
    /// owns the flipped CRTC. Returns the number of completions handled.
    pub fn dispatch_completion(&mut self) -> Result<usize> {
        let completions = self.kms.receive_events()?;
        let mut handled = 0;

        for completion in completions {
            let Some(id) = self.claims.owner(completion.crtc) else {
                debug!(crtc = completion.crtc.0, "Page flip completed on an unclaimed CRTC");
                continue;
            };
            let Some(output) = self.outputs.get_mut(id.slot()) else {
                continue;
            };

            output.flip_pending = false;
            handled += 1;
            trace!(output = %id, frame = completion.frame, "Page flip completed");
            if !output.cleanup {
                self.events.push(OutputEvent::RenderReady(id));
            }
        }

        Ok(handled)
    }
}
