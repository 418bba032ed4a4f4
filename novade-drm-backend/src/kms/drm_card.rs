//! [`KmsDevice`] on top of an opened DRM primary node.

use std::ffi::c_char;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::time::Duration;

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::{
    self, connector, crtc, encoder, framebuffer, Device as ControlDevice, Event, PageFlipFlags,
};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, trace};

use super::{
    BufferGeometry, ConnectionState, ConnectorHandle, ConnectorInfo, ConnectorInterface,
    CrtcHandle, CrtcInfo, DisplayMode, EncoderHandle, EncoderInfo, FramebufferId, KmsDevice,
    PageFlipEvent, ResourceHandles,
};

/// An opened `/dev/dri/cardN` node.
///
/// Opening the node (and any seat/session negotiation needed to become DRM
/// master) is the caller's business; this type only issues ioctls on it.
#[derive(Debug)]
pub struct DrmCard {
    file: File,
}

impl DrmCard {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!(path = %path.display(), "Opened DRM device");
        Ok(Self { file })
    }
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl drm::Device for DrmCard {}
impl ControlDevice for DrmCard {}

/// GEM buffer description handed to `drmModeAddFB`.
struct GemBuffer {
    size: (u32, u32),
    pitch: u32,
    handle: drm::buffer::Handle,
}

impl Buffer for GemBuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Xrgb8888
    }

    fn pitch(&self) -> u32 {
        self.pitch
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.handle
    }
}

fn raw_handle<T: From<control::RawResourceHandle>>(raw: u32) -> io::Result<T> {
    control::from_u32(raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "null DRM resource handle"))
}

fn interface_from_drm(interface: connector::Interface) -> ConnectorInterface {
    match interface {
        connector::Interface::VGA => ConnectorInterface::Vga,
        connector::Interface::DVII => ConnectorInterface::DviI,
        connector::Interface::DVID => ConnectorInterface::DviD,
        connector::Interface::DVIA => ConnectorInterface::DviA,
        connector::Interface::Composite => ConnectorInterface::Composite,
        connector::Interface::SVideo => ConnectorInterface::SVideo,
        connector::Interface::LVDS => ConnectorInterface::Lvds,
        connector::Interface::Component => ConnectorInterface::Component,
        connector::Interface::NinePinDIN => ConnectorInterface::NinePinDin,
        connector::Interface::DisplayPort => ConnectorInterface::DisplayPort,
        connector::Interface::HDMIA => ConnectorInterface::HdmiA,
        connector::Interface::HDMIB => ConnectorInterface::HdmiB,
        connector::Interface::TV => ConnectorInterface::Tv,
        connector::Interface::EmbeddedDisplayPort => ConnectorInterface::EmbeddedDisplayPort,
        connector::Interface::Virtual => ConnectorInterface::Virtual,
        connector::Interface::DSI => ConnectorInterface::Dsi,
        _ => ConnectorInterface::Unknown,
    }
}

fn mode_name(raw: &[c_char; 32]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub(crate) fn mode_from_drm(mode: control::Mode) -> DisplayMode {
    let raw: drm_ffi::drm_mode_modeinfo = mode.into();
    DisplayMode {
        clock: raw.clock,
        hdisplay: raw.hdisplay,
        hsync_start: raw.hsync_start,
        hsync_end: raw.hsync_end,
        htotal: raw.htotal,
        hskew: raw.hskew,
        vdisplay: raw.vdisplay,
        vsync_start: raw.vsync_start,
        vsync_end: raw.vsync_end,
        vtotal: raw.vtotal,
        vscan: raw.vscan,
        vrefresh: raw.vrefresh,
        flags: raw.flags,
        mode_type: raw.type_,
        name: mode_name(&raw.name),
    }
}

pub(crate) fn mode_to_drm(mode: &DisplayMode) -> control::Mode {
    let mut name = [0 as c_char; 32];
    // Keep the trailing NUL.
    for (dst, src) in name.iter_mut().zip(mode.name.bytes().take(31)) {
        *dst = src as c_char;
    }
    control::Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: mode.clock,
        hdisplay: mode.hdisplay,
        hsync_start: mode.hsync_start,
        hsync_end: mode.hsync_end,
        htotal: mode.htotal,
        hskew: mode.hskew,
        vdisplay: mode.vdisplay,
        vsync_start: mode.vsync_start,
        vsync_end: mode.vsync_end,
        vtotal: mode.vtotal,
        vscan: mode.vscan,
        vrefresh: mode.vrefresh,
        flags: mode.flags,
        type_: mode.mode_type,
        name,
    })
}

impl KmsDevice for DrmCard {
    fn resource_handles(&self) -> io::Result<ResourceHandles> {
        let resources = ControlDevice::resource_handles(self)?;
        Ok(ResourceHandles {
            connectors: resources
                .connectors()
                .iter()
                .map(|&handle| ConnectorHandle(u32::from(handle)))
                .collect(),
            crtcs: resources
                .crtcs()
                .iter()
                .map(|&handle| CrtcHandle(u32::from(handle)))
                .collect(),
        })
    }

    fn connector_info(&self, connector: ConnectorHandle) -> io::Result<ConnectorInfo> {
        let handle: connector::Handle = raw_handle(connector.0)?;
        // Probing re-reads EDID so hotplug is noticed on the next scan.
        let info = self.get_connector(handle, true)?;
        let state = match info.state() {
            connector::State::Connected => ConnectionState::Connected,
            connector::State::Disconnected => ConnectionState::Disconnected,
            connector::State::Unknown => ConnectionState::Unknown,
        };
        Ok(ConnectorInfo {
            handle: connector,
            interface: interface_from_drm(info.interface()),
            interface_id: info.interface_id(),
            state,
            modes: info.modes().iter().map(|&mode| mode_from_drm(mode)).collect(),
            encoders: info
                .encoders()
                .iter()
                .map(|&encoder| EncoderHandle(u32::from(encoder)))
                .collect(),
            current_encoder: info
                .current_encoder()
                .map(|encoder| EncoderHandle(u32::from(encoder))),
        })
    }

    fn encoder_info(&self, encoder: EncoderHandle) -> io::Result<EncoderInfo> {
        let handle: encoder::Handle = raw_handle(encoder.0)?;
        let info = self.get_encoder(handle)?;
        let resources = ControlDevice::resource_handles(self)?;
        let allowed = resources.filter_crtcs(info.possible_crtcs());
        let possible_crtcs = resources
            .crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| allowed.contains(*crtc))
            .fold(0u32, |mask, (index, _)| mask | (1 << index));

        Ok(EncoderInfo {
            handle: encoder,
            crtc: info.crtc().map(|crtc| CrtcHandle(u32::from(crtc))),
            possible_crtcs,
        })
    }

    fn crtc_info(&self, crtc: CrtcHandle) -> io::Result<CrtcInfo> {
        let handle: crtc::Handle = raw_handle(crtc.0)?;
        let info = self.get_crtc(handle)?;
        Ok(CrtcInfo {
            handle: crtc,
            framebuffer: info.framebuffer().map(|fb| FramebufferId(u32::from(fb))),
            position: info.position(),
            mode: info.mode().map(mode_from_drm),
        })
    }

    fn add_framebuffer(
        &self,
        geometry: &BufferGeometry,
        depth: u32,
        bpp: u32,
    ) -> io::Result<FramebufferId> {
        let buffer = GemBuffer {
            size: (geometry.width, geometry.height),
            pitch: geometry.stride,
            handle: raw_handle(geometry.handle)?,
        };
        let framebuffer = ControlDevice::add_framebuffer(self, &buffer, depth, bpp)?;
        trace!(framebuffer = u32::from(framebuffer), "Registered scan-out framebuffer");
        Ok(FramebufferId(u32::from(framebuffer)))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) -> io::Result<()> {
        let handle: framebuffer::Handle = raw_handle(framebuffer.0)?;
        ControlDevice::destroy_framebuffer(self, handle)
    }

    fn set_crtc(
        &self,
        crtc: CrtcHandle,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorHandle],
        mode: Option<&DisplayMode>,
    ) -> io::Result<()> {
        let crtc: crtc::Handle = raw_handle(crtc.0)?;
        let framebuffer = framebuffer
            .map(|fb| raw_handle::<framebuffer::Handle>(fb.0))
            .transpose()?;
        let connectors = connectors
            .iter()
            .map(|connector| raw_handle::<connector::Handle>(connector.0))
            .collect::<io::Result<Vec<_>>>()?;
        ControlDevice::set_crtc(
            self,
            crtc,
            framebuffer,
            position,
            &connectors,
            mode.map(mode_to_drm),
        )
    }

    fn page_flip(&self, crtc: CrtcHandle, framebuffer: FramebufferId) -> io::Result<()> {
        let crtc: crtc::Handle = raw_handle(crtc.0)?;
        let framebuffer: framebuffer::Handle = raw_handle(framebuffer.0)?;
        ControlDevice::page_flip(self, crtc, framebuffer, PageFlipFlags::EVENT, None)
    }

    fn wait_for_events(&self, timeout: Duration) -> io::Result<bool> {
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut fds = [PollFd::new(&self.file, PollFlags::POLLIN)];
        match poll(&mut fds, timeout_ms) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    fn receive_events(&self) -> io::Result<Vec<PageFlipEvent>> {
        let events = ControlDevice::receive_events(self)?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(flip) => Some(PageFlipEvent {
                    crtc: CrtcHandle(u32::from(flip.crtc)),
                    frame: flip.frame,
                    duration: flip.duration,
                }),
                _ => None,
            })
            .collect())
    }
}
