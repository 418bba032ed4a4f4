// novade-drm-backend/src/backend/mod.rs
//! The DRM output backend: hotplug scanning, per-output lifecycle and the
//! page-flip driven frame protocol.
//!
//! Everything runs on the caller's thread. The only blocking operation is
//! [`DrmBackend::teardown_output`], which drains an outstanding page flip
//! before releasing the output's CRTC and surface.

use std::os::fd::AsFd;
use std::rc::Rc;
use std::time::Duration;

use tracing::{error, info};

use crate::errors::{BackendError, Result};
use crate::event::EventQueue;
use crate::kms::KmsDevice;
use crate::renderers::{GpuPlatform, RenderContext};

pub mod allocator;
mod lifecycle;
mod output;
mod scanner;
mod swap;


pub use allocator::{allocate_crtc, resolve_mode, select_mode, CrtcClaims};
pub use output::{Output, OutputId, OutputState};

/// Default bound on the page-flip drain during output teardown.
pub const DEFAULT_FLIP_DRAIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Output backend of one DRM device.
pub struct DrmBackend<K, P, Q>
where
    K: KmsDevice + 'static,
    P: GpuPlatform,
    Q: EventQueue,
{
    // Outputs are declared first: their surfaces go before the renderer.
    outputs: Vec<Output<P>>,
    claims: CrtcClaims,
    renderer: RenderContext<P>,
    kms: Rc<K>,
    events: Q,
    flip_drain_timeout: Duration,
}

impl<K, P, Q> DrmBackend<K, P, Q>
where
    K: KmsDevice + 'static,
    P: GpuPlatform,
    Q: EventQueue,
{
    pub fn new(kms: Rc<K>, renderer: RenderContext<P>, events: Q) -> Self {
        Self {
            outputs: Vec::new(),
            claims: CrtcClaims::new(),
            renderer,
            kms,
            events,
            flip_drain_timeout: DEFAULT_FLIP_DRAIN_TIMEOUT,
        }
    }

    /// Creates the rendering context on `kms`'s device and wraps both.
    pub fn initialize(kms: K, platform: P, events: Q) -> Result<Self>
    where
        K: AsFd,
    {
        let renderer = RenderContext::initialize(platform, kms.as_fd())?;
        Ok(Self::new(Rc::new(kms), renderer, events))
    }

    pub fn set_flip_drain_timeout(&mut self, timeout: Duration) {
        self.flip_drain_timeout = timeout;
    }

    pub fn flip_drain_timeout(&self) -> Duration {
        self.flip_drain_timeout
    }

    pub fn output(&self, id: OutputId) -> Option<&Output<P>> {
        self.outputs.get(id.slot())
    }

    pub fn outputs(&self) -> impl Iterator<Item = (OutputId, &Output<P>)> {
        self.outputs
            .iter()
            .enumerate()
            .map(|(slot, output)| (OutputId::new(slot), output))
    }

    /// Looks an output up by its stable name.
    pub fn find_output(&self, name: &str) -> Option<OutputId> {
        self.outputs()
            .find(|(_, output)| output.name() == name)
            .map(|(id, _)| id)
    }

    pub fn claims(&self) -> &CrtcClaims {
        &self.claims
    }

    /// The rendering context, for drawing between [`Self::begin`] and [`Self::end`].
    pub fn renderer_mut(&mut self) -> &mut RenderContext<P> {
        &mut self.renderer
    }

    pub fn events(&self) -> &Q {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut Q {
        &mut self.events
    }

    fn output_mut(&mut self, id: OutputId) -> Result<&mut Output<P>> {
        self.outputs
            .get_mut(id.slot())
            .ok_or(BackendError::UnknownOutput(id))
    }

    /// Tears every output down, then releases the rendering context.
    ///
    /// Outputs whose page flip cannot be drained are released anyway, since the
    /// device is going away.
    pub fn teardown_device(mut self) {
        self.release_all_outputs();
        self.renderer.teardown();
        info!("DRM backend shut down");
    }

    fn release_all_outputs(&mut self) {
        for slot in 0..self.outputs.len() {
            let id = OutputId::new(slot);
            if let Err(err) = self.teardown_output(id) {
                error!(output = %id, "Output teardown failed, forcing release: {}", err);
                self.release_output(id);
            }
        }
    }
}

impl<K, P, Q> Drop for DrmBackend<K, P, Q>
where
    K: KmsDevice + 'static,
    P: GpuPlatform,
    Q: EventQueue,
{
    fn drop(&mut self) {
        self.release_all_outputs();
    }
}
