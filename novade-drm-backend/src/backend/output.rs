// novade-drm-backend/src/backend/output.rs
use std::fmt;

use crate::kms::{ConnectorHandle, CrtcHandle, CrtcInfo, DisplayMode, EncoderHandle, FramebufferId};
use crate::renderers::GpuPlatform;

/// Identity of an output: the index of its connector slot.
///
/// Slots are never removed, so an id stays valid for the backend's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(usize);

impl OutputId {
    pub const fn new(slot: usize) -> Self {
        Self(slot)
    }

    pub fn slot(&self) -> usize {
        self.0
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// Slot allocated but its connector has not been read yet.
    Invalid,
    Disconnected,
    /// Link is active; waiting for a mode-set.
    NeedsModeset,
    /// Mode set, surface created, CRTC claimed.
    Connected,
}

/// The swap chain of a connected output.
pub(crate) struct OutputSurface<P: GpuPlatform> {
    pub(crate) swapchain: P::Surface,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) last_framebuffer: Option<FramebufferId>,
}

/// Per-connector-slot record, kept across rescans.
pub struct Output<P: GpuPlatform> {
    pub(crate) name: String,
    pub(crate) connector: ConnectorHandle,
    pub(crate) state: OutputState,
    pub(crate) encoder: Option<EncoderHandle>,
    pub(crate) crtc: Option<CrtcHandle>,
    pub(crate) mode: Option<DisplayMode>,
    pub(crate) modes: Vec<DisplayMode>,
    /// CRTC binding found at mode-set time. Source of `current` requests and
    /// restored on teardown.
    pub(crate) saved_crtc: Option<CrtcInfo>,
    pub(crate) surface: Option<OutputSurface<P>>,
    pub(crate) flip_pending: bool,
    pub(crate) cleanup: bool,
}

impl<P: GpuPlatform> Output<P> {
    pub(crate) fn new(connector: ConnectorHandle) -> Self {
        Self {
            name: String::new(),
            connector,
            state: OutputState::Invalid,
            encoder: None,
            crtc: None,
            mode: None,
            modes: Vec::new(),
            saved_crtc: None,
            surface: None,
            flip_pending: false,
            cleanup: false,
        }
    }

    /// Stable name such as `HDMI-A-1`. Empty until the connector was first read.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> ConnectorHandle {
        self.connector
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    pub fn encoder(&self) -> Option<EncoderHandle> {
        self.encoder
    }

    pub fn crtc(&self) -> Option<CrtcHandle> {
        self.crtc
    }

    pub fn mode(&self) -> Option<&DisplayMode> {
        self.mode.as_ref()
    }

    pub fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    pub fn saved_crtc(&self) -> Option<&CrtcInfo> {
        self.saved_crtc.as_ref()
    }

    pub fn has_surface(&self) -> bool {
        self.surface.is_some()
    }

    pub fn surface_size(&self) -> Option<(u32, u32)> {
        self.surface.as_ref().map(|surface| (surface.width, surface.height))
    }

    pub fn last_framebuffer(&self) -> Option<FramebufferId> {
        self.surface.as_ref().and_then(|surface| surface.last_framebuffer)
    }

    /// A page flip was issued and its completion has not been dispatched yet.
    pub fn is_flip_pending(&self) -> bool {
        self.flip_pending
    }

    pub fn is_cleaning_up(&self) -> bool {
        self.cleanup
    }

    /// Drops everything acquired by a mode-set. The surface must already be gone.
    pub(crate) fn reset_modeset(&mut self) {
        self.encoder = None;
        self.crtc = None;
        self.mode = None;
        self.saved_crtc = None;
        self.flip_pending = false;
        self.cleanup = false;
    }
}

impl<P: GpuPlatform> fmt::Debug for Output<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.name)
            .field("connector", &self.connector)
            .field("state", &self.state)
            .field("crtc", &self.crtc)
            .field("mode", &self.mode.as_ref().map(ToString::to_string))
            .field("has_surface", &self.surface.is_some())
            .field("flip_pending", &self.flip_pending)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}
