// novade-drm-backend/src/backend/lifecycle.rs
//! Mode-set and teardown of single outputs.

use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::output::OutputSurface;
use super::{allocate_crtc, resolve_mode, DrmBackend, OutputId, OutputState};
use crate::config::ModeRequest;
use crate::errors::{BackendError, ModesetError, Result};
use crate::event::{EventQueue, OutputEvent};
use crate::kms::{ConnectorHandle, ConnectorInfo, CrtcHandle, CrtcInfo, DisplayMode, FramebufferId, KmsDevice};
use crate::renderers::{get_or_create_scanout_id, GpuPlatform};

const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Puts the CRTC binding found at mode-set time back and switches off a CRTC
/// that was claimed in its place. A saved CRTC that had no mode was inactive,
/// so there is nothing to restore and the claimed CRTC is switched off. Best
/// effort.
fn restore_crtc<K: KmsDevice + ?Sized>(
    kms: &K,
    connector: ConnectorHandle,
    claimed: Option<CrtcHandle>,
    saved: Option<&CrtcInfo>,
) {
    let mut restored = None;
    if let Some(saved) = saved.filter(|saved| saved.mode.is_some()) {
        match kms.set_crtc(
            saved.handle,
            saved.framebuffer,
            saved.position,
            &[connector],
            saved.mode.as_ref(),
        ) {
            Ok(()) => restored = Some(saved.handle),
            Err(err) => {
                warn!(crtc = saved.handle.0, "Could not restore previous CRTC configuration: {}", err)
            }
        }
    }

    if let Some(crtc) = claimed {
        if restored != Some(crtc) {
            if let Err(err) = kms.set_crtc(crtc, None, (0, 0), &[], None) {
                warn!(crtc = crtc.0, "Could not disable CRTC: {}", err);
            }
        }
    }
}

impl<K, P, Q> DrmBackend<K, P, Q>
where
    K: KmsDevice + 'static,
    P: GpuPlatform,
    Q: EventQueue,
{
    /// Mode-sets an output from a request string (`preferred`, `current`,
    /// `<w>x<h>[@<r>]`).
    ///
    /// On any failure the output reverts to [`OutputState::Disconnected`] and
    /// an [`OutputEvent::Removed`] is emitted.
    pub fn select_and_commit_mode(&mut self, id: OutputId, request: &str) -> Result<()> {
        self.output_mut(id)?;
        match request.parse::<ModeRequest>() {
            Ok(request) => self.commit_mode(id, &request),
            Err(err) => Err(self.fail_modeset(id, ModesetError::Mode(err.into()))),
        }
    }

    /// Mode-sets an output: claims a CRTC, creates its surface, commits the
    /// mode with a black frame and schedules the first page flip.
    ///
    /// The completion of that flip produces the output's first
    /// [`OutputEvent::RenderReady`].
    ///
    /// If the output's previous surface cannot be torn down because its page
    /// flip never drains, the output also reverts to
    /// [`OutputState::Disconnected`] with an [`OutputEvent::Removed`], but keeps
    /// its surface and CRTC until a later [`Self::teardown_output`] succeeds.
    pub fn commit_mode(&mut self, id: OutputId, request: &ModeRequest) -> Result<()> {
        if self.output_mut(id)?.surface.is_some() {
            debug!(output = %id, "Tearing down previous surface before mode-set");
            if let Err(err) = self.teardown_output(id) {
                let output = &mut self.outputs[id.slot()];
                warn!(output = %id, name = %output.name, "Mode-set failed: {}", err);
                output.state = OutputState::Disconnected;
                self.events.push(OutputEvent::Removed(id));
                return Err(err);
            }
        }

        match self.try_modeset(id, request) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_modeset(id, err)),
        }
    }

    fn fail_modeset(&mut self, id: OutputId, err: ModesetError) -> BackendError {
        self.claims.release_owner(id);
        if let Some(output) = self.outputs.get_mut(id.slot()) {
            warn!(output = %id, name = %output.name, "Mode-set failed: {}", err);
            output.reset_modeset();
            output.state = OutputState::Disconnected;
        }
        self.events.push(OutputEvent::Removed(id));
        BackendError::Modeset(err)
    }

    fn try_modeset(&mut self, id: OutputId, request: &ModeRequest) -> std::result::Result<(), ModesetError> {
        let connector = self.outputs[id.slot()].connector;
        let info = self.kms.connector_info(connector)?;
        if !info.is_connected() {
            return Err(ModesetError::LinkInactive);
        }
        if info.modes.is_empty() {
            return Err(ModesetError::NoModes);
        }

        let saved_crtc = self.active_crtc(&info);
        let previous_mode = saved_crtc.as_ref().and_then(|crtc| crtc.mode.as_ref());
        let mode = resolve_mode(&info.modes, previous_mode, request)?.clone();
        info!(output = %id, name = %self.outputs[id.slot()].name, %mode, "Configuring output");

        let resources = self.kms.resource_handles()?;
        let (encoder, crtc) = allocate_crtc(&*self.kms, &info, &resources.crtcs, &mut self.claims, id)?;
        debug!(output = %id, encoder = encoder.0, crtc = crtc.0, "Allocated CRTC");

        let output = &mut self.outputs[id.slot()];
        output.modes = info.modes;
        output.saved_crtc = saved_crtc;
        output.mode = Some(mode.clone());
        output.encoder = Some(encoder);
        output.crtc = Some(crtc);
        output.state = OutputState::Connected;

        self.init_surface(id, crtc, &mode)
    }

    /// The CRTC currently driving the connector, through its current encoder.
    fn active_crtc(&self, info: &ConnectorInfo) -> Option<CrtcInfo> {
        let encoder = info.current_encoder?;
        let crtc = match self.kms.encoder_info(encoder) {
            Ok(encoder) => encoder.crtc?,
            Err(err) => {
                debug!(encoder = encoder.0, "Could not read current encoder: {}", err);
                return None;
            }
        };
        match self.kms.crtc_info(crtc) {
            Ok(info) => Some(info),
            Err(err) => {
                debug!(crtc = crtc.0, "Could not read current CRTC: {}", err);
                None
            }
        }
    }

    fn init_surface(
        &mut self,
        id: OutputId,
        crtc: CrtcHandle,
        mode: &DisplayMode,
    ) -> std::result::Result<(), ModesetError> {
        let (width, height) = mode.size();
        let swapchain = self.renderer.create_surface(width, height)?;
        let connector = self.outputs[id.slot()].connector;

        match self.present_first_frame(&swapchain, connector, crtc, mode) {
            Ok(framebuffer) => {
                let output = &mut self.outputs[id.slot()];
                output.surface = Some(OutputSurface {
                    swapchain,
                    width,
                    height,
                    last_framebuffer: Some(framebuffer),
                });
                output.flip_pending = true;
                Ok(())
            }
            Err(err) => {
                let saved = self.outputs[id.slot()].saved_crtc.as_ref();
                restore_crtc(&*self.kms, connector, Some(crtc), saved);
                self.renderer.destroy_surface(swapchain);
                Err(err)
            }
        }
    }

    fn present_first_frame(
        &mut self,
        swapchain: &P::Surface,
        connector: ConnectorHandle,
        crtc: CrtcHandle,
        mode: &DisplayMode,
    ) -> std::result::Result<FramebufferId, ModesetError> {
        let (width, height) = mode.size();
        self.renderer.make_current(swapchain)?;
        self.renderer.clear(width, height, BLACK);
        self.renderer.swap_buffers(swapchain)?;

        let kms: Rc<dyn KmsDevice> = self.kms.clone();
        let mut buffer = self.renderer.lock_front_buffer(swapchain)?;
        let framebuffer = get_or_create_scanout_id(&kms, &mut buffer)?;

        self.kms.set_crtc(crtc, Some(framebuffer), (0, 0), &[connector], Some(mode))?;
        self.kms.page_flip(crtc, framebuffer)?;
        Ok(framebuffer)
    }

    /// Releases an output's surface and CRTC and restores the CRTC binding the
    /// output had before it was mode-set.
    ///
    /// A no-op for outputs without a surface. Otherwise blocks, dispatching
    /// completion events in place, until the output's outstanding page flip has
    /// completed; no [`OutputEvent::RenderReady`] is emitted for it. Fails with
    /// [`BackendError::FlipDrainTimeout`] if that takes longer than
    /// [`DrmBackend::flip_drain_timeout`], leaving the output untouched.
    pub fn teardown_output(&mut self, id: OutputId) -> Result<()> {
        let output = self.output_mut(id)?;
        if output.surface.is_none() {
            return Ok(());
        }
        output.cleanup = true;

        self.drain_page_flip(id)?;
        self.release_output(id);
        Ok(())
    }

    /// Busy-waits on the completion fd until the output's flip is dispatched.
    fn drain_page_flip(&mut self, id: OutputId) -> Result<()> {
        let timeout = self.flip_drain_timeout;
        let deadline = Instant::now() + timeout;

        while self.outputs[id.slot()].flip_pending {
            let now = Instant::now();
            if now >= deadline {
                error!(output = %id, ?timeout, "Page flip did not complete, giving up on teardown");
                return Err(BackendError::FlipDrainTimeout { output: id, timeout });
            }
            if self.kms.wait_for_events(deadline - now)? {
                self.dispatch_completion()?;
            }
        }
        Ok(())
    }

    /// Frees everything a mode-set acquired, without waiting for page flips.
    pub(super) fn release_output(&mut self, id: OutputId) {
        let Some(output) = self.outputs.get_mut(id.slot()) else {
            return;
        };
        let Some(surface) = output.surface.take() else {
            return;
        };

        restore_crtc(&*self.kms, output.connector, output.crtc, output.saved_crtc.as_ref());
        self.renderer.destroy_surface(surface.swapchain);
        self.claims.release_owner(id);

        output.reset_modeset();
        if output.state == OutputState::Connected {
            output.state = OutputState::Disconnected;
        }
        info!(output = %id, name = %output.name, "Output released");
    }
}
