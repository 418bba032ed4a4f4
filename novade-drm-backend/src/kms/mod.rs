// novade-drm-backend/src/kms/mod.rs
//! Kernel mode-setting resources as seen by the backend.
//!
//! The backend never talks to the kernel directly; it goes through the
//! [`KmsDevice`] trait. [`DrmCard`] is the production implementation on top of
//! the `drm` crate, tests use an in-memory double.

use std::fmt;
use std::io;
use std::time::Duration;

mod drm_card;

pub use drm_card::DrmCard;

/// Kernel handle of a connector (a physical output socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorHandle(pub u32);

/// Kernel handle of an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncoderHandle(pub u32);

/// Kernel handle of a CRTC (scan-out engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrtcHandle(pub u32);

/// Kernel framebuffer id, the scan-out registration of a GPU buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

/// A complete display timing record as advertised by a connector.
///
/// Equality compares every field, so two modes are equal only if the kernel
/// would consider them the same timing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayMode {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

impl DisplayMode {
    /// Active area in pixels.
    pub fn size(&self) -> (u32, u32) {
        (u32::from(self.hdisplay), u32::from(self.vdisplay))
    }

    /// Vertical refresh in Hz.
    pub fn refresh(&self) -> u32 {
        self.vrefresh
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.hdisplay, self.vdisplay, self.vrefresh)
    }
}

/// Link status of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

/// Connector type, used to build stable output names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorInterface {
    Unknown,
    Vga,
    DviI,
    DviD,
    DviA,
    Composite,
    SVideo,
    Lvds,
    Component,
    NinePinDin,
    DisplayPort,
    HdmiA,
    HdmiB,
    Tv,
    EmbeddedDisplayPort,
    Virtual,
    Dsi,
}

impl ConnectorInterface {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorInterface::Unknown => "Unknown",
            ConnectorInterface::Vga => "VGA",
            ConnectorInterface::DviI => "DVI-I",
            ConnectorInterface::DviD => "DVI-D",
            ConnectorInterface::DviA => "DVI-A",
            ConnectorInterface::Composite => "Composite",
            ConnectorInterface::SVideo => "SVIDEO",
            ConnectorInterface::Lvds => "LVDS",
            ConnectorInterface::Component => "Component",
            ConnectorInterface::NinePinDin => "DIN",
            ConnectorInterface::DisplayPort => "DP",
            ConnectorInterface::HdmiA => "HDMI-A",
            ConnectorInterface::HdmiB => "HDMI-B",
            ConnectorInterface::Tv => "TV",
            ConnectorInterface::EmbeddedDisplayPort => "eDP",
            ConnectorInterface::Virtual => "Virtual",
            ConnectorInterface::Dsi => "DSI",
        }
    }
}

/// Snapshot of a connector's state at query time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInfo {
    pub handle: ConnectorHandle,
    pub interface: ConnectorInterface,
    pub interface_id: u32,
    pub state: ConnectionState,
    /// Advertised modes, manufacturer-preferred mode first.
    pub modes: Vec<DisplayMode>,
    /// Encoders usable with this connector, in platform order.
    pub encoders: Vec<EncoderHandle>,
    /// Encoder currently driving the connector, if any.
    pub current_encoder: Option<EncoderHandle>,
}

impl ConnectorInfo {
    /// Stable name such as `HDMI-A-1` or `eDP-1`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.interface.as_str(), self.interface_id)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub handle: EncoderHandle,
    /// CRTC currently bound to the encoder.
    pub crtc: Option<CrtcHandle>,
    /// Bit `i` is set when the CRTC at index `i` of the device's CRTC list
    /// can be driven by this encoder.
    pub possible_crtcs: u32,
}

impl EncoderInfo {
    pub fn supports_crtc_index(&self, index: usize) -> bool {
        index < 32 && self.possible_crtcs & (1 << index) != 0
    }
}

/// Snapshot of a CRTC binding, kept to restore the display on teardown.
#[derive(Debug, Clone, PartialEq)]
pub struct CrtcInfo {
    pub handle: CrtcHandle,
    pub framebuffer: Option<FramebufferId>,
    pub position: (u32, u32),
    pub mode: Option<DisplayMode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceHandles {
    pub connectors: Vec<ConnectorHandle>,
    pub crtcs: Vec<CrtcHandle>,
}

/// Layout of a GPU buffer as needed to register it for scan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: u32,
    /// GEM handle of the buffer on the DRM device.
    pub handle: u32,
}

/// Completion of a page flip, tagged by the kernel with its CRTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlipEvent {
    pub crtc: CrtcHandle,
    pub frame: u32,
    pub duration: Duration,
}

/// The subset of the legacy KMS API the backend relies on.
///
/// All methods take `&self`; kernel state is external and the completion
/// protocol is observed only through [`KmsDevice::receive_events`].
pub trait KmsDevice {
    fn resource_handles(&self) -> io::Result<ResourceHandles>;

    fn connector_info(&self, connector: ConnectorHandle) -> io::Result<ConnectorInfo>;

    fn encoder_info(&self, encoder: EncoderHandle) -> io::Result<EncoderInfo>;

    fn crtc_info(&self, crtc: CrtcHandle) -> io::Result<CrtcInfo>;

    fn add_framebuffer(
        &self,
        geometry: &BufferGeometry,
        depth: u32,
        bpp: u32,
    ) -> io::Result<FramebufferId>;

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) -> io::Result<()>;

    /// Legacy mode commit. `None` for framebuffer and mode disables the CRTC.
    fn set_crtc(
        &self,
        crtc: CrtcHandle,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorHandle],
        mode: Option<&DisplayMode>,
    ) -> io::Result<()>;

    /// Schedules `framebuffer` for scan-out at the next vblank and requests a
    /// completion event for `crtc`.
    fn page_flip(&self, crtc: CrtcHandle, framebuffer: FramebufferId) -> io::Result<()>;

    /// Waits up to `timeout` for completion events to become readable.
    fn wait_for_events(&self, timeout: Duration) -> io::Result<bool>;

    /// Reads the completion events currently queued by the kernel.
    fn receive_events(&self) -> io::Result<Vec<PageFlipEvent>>;
}
