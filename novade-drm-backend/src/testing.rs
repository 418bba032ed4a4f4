// novade-drm-backend/src/testing.rs
//! In-memory doubles of the kernel and GPU platform for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::BorrowedFd;
use std::rc::Rc;
use std::time::Duration;

use crate::errors::RenderError;
use crate::kms::{
    BufferGeometry, ConnectionState, ConnectorHandle, ConnectorInfo, ConnectorInterface, CrtcHandle,
    CrtcInfo, DisplayMode, EncoderHandle, EncoderInfo, FramebufferId, KmsDevice, PageFlipEvent,
    ResourceHandles,
};
use crate::renderers::{ConfigDescriptor, FramebufferGuard, GpuPlatform, ScanoutBuffer, GBM_FORMAT_XRGB8888};

/// A plausible CVT timing for `width`x`height`@`refresh`.
pub fn mode(width: u16, height: u16, refresh: u32) -> DisplayMode {
    DisplayMode {
        clock: u32::from(width) * u32::from(height) * refresh / 800,
        hdisplay: width,
        hsync_start: width + 48,
        hsync_end: width + 80,
        htotal: width + 160,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 3,
        vsync_end: height + 8,
        vtotal: height + 30,
        vscan: 0,
        vrefresh: refresh,
        flags: 0x5,
        mode_type: 0x40,
        name: format!("{}x{}", width, height),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetCrtcCall {
    pub crtc: CrtcHandle,
    pub framebuffer: Option<FramebufferId>,
    pub position: (u32, u32),
    pub connectors: Vec<ConnectorHandle>,
    pub mode: Option<DisplayMode>,
}

#[derive(Default)]
struct KmsState {
    connectors: Vec<ConnectorInfo>,
    encoders: HashMap<EncoderHandle, EncoderInfo>,
    crtcs: Vec<CrtcInfo>,
    unreadable: HashSet<ConnectorHandle>,
    framebuffers: BTreeMap<FramebufferId, (BufferGeometry, u32, u32)>,
    next_framebuffer: u32,
    framebuffers_added: usize,
    framebuffers_destroyed: Vec<FramebufferId>,
    set_crtc_calls: Vec<SetCrtcCall>,
    page_flips: Vec<(CrtcHandle, FramebufferId)>,
    pending_flips: VecDeque<CrtcHandle>,
    withheld_waits: usize,
    drop_flips: bool,
    wait_calls: usize,
    frame: u32,
}

/// Kernel double: connectors, encoders and CRTCs are set up by the test, and
/// page flips complete when their events are read.
#[derive(Default)]
pub struct MockKms {
    state: RefCell<KmsState>,
}

fn not_found(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such {}", what))
}

impl MockKms {
    pub fn new() -> Self {
        let kms = Self::default();
        kms.state.borrow_mut().next_framebuffer = 100;
        kms
    }

    pub fn add_crtc(&self, handle: CrtcHandle) {
        self.state.borrow_mut().crtcs.push(CrtcInfo {
            handle,
            framebuffer: None,
            position: (0, 0),
            mode: None,
        });
    }

    pub fn add_encoder(&self, handle: EncoderHandle, possible_crtcs: u32) {
        self.state
            .borrow_mut()
            .encoders
            .insert(handle, EncoderInfo { handle, crtc: None, possible_crtcs });
    }

    /// Adds a disconnected HDMI connector advertising 1920x1080@60 and
    /// 1280x720@60.
    pub fn add_connector(&self, handle: ConnectorHandle, encoders: &[EncoderHandle]) -> ConnectorInfo {
        let mut state = self.state.borrow_mut();
        let info = ConnectorInfo {
            handle,
            interface: ConnectorInterface::HdmiA,
            interface_id: state.connectors.len() as u32 + 1,
            state: ConnectionState::Disconnected,
            modes: vec![mode(1920, 1080, 60), mode(1280, 720, 60)],
            encoders: encoders.to_vec(),
            current_encoder: None,
        };
        state.connectors.push(info.clone());
        info
    }

    fn with_connector(&self, handle: ConnectorHandle, update: impl FnOnce(&mut ConnectorInfo)) {
        let mut state = self.state.borrow_mut();
        if let Some(connector) = state.connectors.iter_mut().find(|c| c.handle == handle) {
            update(connector);
        }
    }

    pub fn plug(&self, handle: ConnectorHandle) {
        self.with_connector(handle, |c| c.state = ConnectionState::Connected);
    }

    pub fn unplug(&self, handle: ConnectorHandle) {
        self.with_connector(handle, |c| c.state = ConnectionState::Disconnected);
    }

    /// The connector disappears from the device's enumeration.
    pub fn remove_connector(&self, handle: ConnectorHandle) {
        self.state.borrow_mut().connectors.retain(|c| c.handle != handle);
    }

    pub fn set_modes(&self, handle: ConnectorHandle, modes: Vec<DisplayMode>) {
        self.with_connector(handle, |c| c.modes = modes);
    }

    pub fn set_unreadable(&self, handle: ConnectorHandle, unreadable: bool) {
        let mut state = self.state.borrow_mut();
        if unreadable {
            state.unreadable.insert(handle);
        } else {
            state.unreadable.remove(&handle);
        }
    }

    /// Marks `crtc` as driving `connector` through `encoder` with `mode`, as
    /// left behind by a previous display server.
    pub fn set_active_crtc(
        &self,
        connector: ConnectorHandle,
        encoder: EncoderHandle,
        crtc: CrtcHandle,
        framebuffer: FramebufferId,
        mode: DisplayMode,
    ) {
        self.bind_encoder(connector, encoder, crtc);
        let mut state = self.state.borrow_mut();
        if let Some(info) = state.crtcs.iter_mut().find(|info| info.handle == crtc) {
            info.framebuffer = Some(framebuffer);
            info.mode = Some(mode);
        }
    }

    /// Routes `connector` through `encoder` to `crtc` without touching the
    /// CRTC, which stays inactive unless configured otherwise.
    pub fn bind_encoder(&self, connector: ConnectorHandle, encoder: EncoderHandle, crtc: CrtcHandle) {
        self.with_connector(connector, |c| c.current_encoder = Some(encoder));
        if let Some(info) = self.state.borrow_mut().encoders.get_mut(&encoder) {
            info.crtc = Some(crtc);
        }
    }

    /// The next `count` waits for completion events report nothing readable.
    pub fn withhold_waits(&self, count: usize) {
        self.state.borrow_mut().withheld_waits = count;
    }

    /// Page flips never complete.
    pub fn drop_flips(&self, drop: bool) {
        self.state.borrow_mut().drop_flips = drop;
    }

    pub fn framebuffers_added(&self) -> usize {
        self.state.borrow().framebuffers_added
    }

    pub fn framebuffers_destroyed(&self) -> Vec<FramebufferId> {
        self.state.borrow().framebuffers_destroyed.clone()
    }

    pub fn live_framebuffers(&self) -> Vec<FramebufferId> {
        self.state.borrow().framebuffers.keys().copied().collect()
    }

    pub fn framebuffer_format(&self, id: FramebufferId) -> Option<(BufferGeometry, u32, u32)> {
        self.state.borrow().framebuffers.get(&id).copied()
    }

    pub fn set_crtc_calls(&self) -> Vec<SetCrtcCall> {
        self.state.borrow().set_crtc_calls.clone()
    }

    pub fn page_flips(&self) -> Vec<(CrtcHandle, FramebufferId)> {
        self.state.borrow().page_flips.clone()
    }

    pub fn pending_flips(&self) -> usize {
        self.state.borrow().pending_flips.len()
    }

    pub fn wait_calls(&self) -> usize {
        self.state.borrow().wait_calls
    }

    pub fn crtc(&self, handle: CrtcHandle) -> Option<CrtcInfo> {
        self.state.borrow().crtcs.iter().find(|info| info.handle == handle).cloned()
    }
}

impl KmsDevice for MockKms {
    fn resource_handles(&self) -> io::Result<ResourceHandles> {
        let state = self.state.borrow();
        Ok(ResourceHandles {
            connectors: state.connectors.iter().map(|c| c.handle).collect(),
            crtcs: state.crtcs.iter().map(|c| c.handle).collect(),
        })
    }

    fn connector_info(&self, connector: ConnectorHandle) -> io::Result<ConnectorInfo> {
        let state = self.state.borrow();
        if state.unreadable.contains(&connector) {
            return Err(io::Error::new(io::ErrorKind::Other, "connector probe failed"));
        }
        state
            .connectors
            .iter()
            .find(|c| c.handle == connector)
            .cloned()
            .ok_or_else(|| not_found("connector"))
    }

    fn encoder_info(&self, encoder: EncoderHandle) -> io::Result<EncoderInfo> {
        self.state
            .borrow()
            .encoders
            .get(&encoder)
            .cloned()
            .ok_or_else(|| not_found("encoder"))
    }

    fn crtc_info(&self, crtc: CrtcHandle) -> io::Result<CrtcInfo> {
        self.crtc(crtc).ok_or_else(|| not_found("crtc"))
    }

    fn add_framebuffer(&self, geometry: &BufferGeometry, depth: u32, bpp: u32) -> io::Result<FramebufferId> {
        let mut state = self.state.borrow_mut();
        let id = FramebufferId(state.next_framebuffer);
        state.next_framebuffer += 1;
        state.framebuffers_added += 1;
        state.framebuffers.insert(id, (*geometry, depth, bpp));
        Ok(id)
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .framebuffers
            .remove(&framebuffer)
            .ok_or_else(|| not_found("framebuffer"))?;
        state.framebuffers_destroyed.push(framebuffer);
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: CrtcHandle,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorHandle],
        mode: Option<&DisplayMode>,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let info = state
            .crtcs
            .iter_mut()
            .find(|info| info.handle == crtc)
            .ok_or_else(|| not_found("crtc"))?;
        info.framebuffer = framebuffer;
        info.position = position;
        info.mode = mode.cloned();
        state.set_crtc_calls.push(SetCrtcCall {
            crtc,
            framebuffer,
            position,
            connectors: connectors.to_vec(),
            mode: mode.cloned(),
        });
        Ok(())
    }

    fn page_flip(&self, crtc: CrtcHandle, framebuffer: FramebufferId) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.pending_flips.contains(&crtc) {
            return Err(io::Error::from_raw_os_error(16)); // EBUSY
        }
        if !state.framebuffers.contains_key(&framebuffer) {
            return Err(not_found("framebuffer"));
        }
        state.pending_flips.push_back(crtc);
        state.page_flips.push((crtc, framebuffer));
        Ok(())
    }

    fn wait_for_events(&self, _timeout: Duration) -> io::Result<bool> {
        let mut state = self.state.borrow_mut();
        state.wait_calls += 1;
        if state.withheld_waits > 0 {
            state.withheld_waits -= 1;
            return Ok(false);
        }
        Ok(!state.drop_flips && !state.pending_flips.is_empty())
    }

    fn receive_events(&self) -> io::Result<Vec<PageFlipEvent>> {
        let mut state = self.state.borrow_mut();
        if state.drop_flips {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        while let Some(crtc) = state.pending_flips.pop_front() {
            state.frame += 1;
            events.push(PageFlipEvent { crtc, frame: state.frame, duration: Duration::ZERO });
        }
        Ok(events)
    }
}

/// Calls made on [`MockPlatform`]. Only successful calls are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    LoadExtensions,
    CreateDevice,
    DestroyDevice,
    BindApi,
    OpenDisplay,
    TerminateDisplay,
    Configs,
    CreateContext,
    DestroyContext,
    CreateSurface,
    DestroySurface,
    MakeCurrent,
    Clear,
    SwapBuffers,
    LockFrontBuffer,
}

pub type CallLog = Rc<RefCell<Vec<Call>>>;

/// Swap chain double with two buffers used in turn.
pub struct MockSwapchain {
    width: u32,
    height: u32,
    slots: Vec<Rc<RefCell<Option<FramebufferGuard>>>>,
    next: Cell<usize>,
}

pub struct MockBuffer {
    geometry: BufferGeometry,
    slot: Rc<RefCell<Option<FramebufferGuard>>>,
}

impl ScanoutBuffer for MockBuffer {
    fn geometry(&self) -> Result<BufferGeometry, RenderError> {
        Ok(self.geometry)
    }

    fn framebuffer(&self) -> Option<FramebufferId> {
        self.slot.borrow().as_ref().map(FramebufferGuard::id)
    }

    fn attach_framebuffer(&mut self, guard: FramebufferGuard) -> Result<(), RenderError> {
        *self.slot.borrow_mut() = Some(guard);
        Ok(())
    }
}

pub struct MockPlatform {
    calls: CallLog,
    fail_on: Option<Call>,
    visuals: Vec<Option<u32>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            calls: Rc::new(RefCell::new(Vec::new())),
            fail_on: None,
            // ABGR8888 first: the XRGB8888 config is not the first one listed.
            visuals: vec![Some(0x3432_4241), Some(GBM_FORMAT_XRGB8888)],
        }
    }

    pub fn fail_on(mut self, call: Call) -> Self {
        self.fail_on = Some(call);
        self
    }

    pub fn with_visuals(mut self, visuals: &[Option<u32>]) -> Self {
        self.visuals = visuals.to_vec();
        self
    }

    pub fn calls(&self) -> CallLog {
        Rc::clone(&self.calls)
    }

    /// Acquired minus released device, display, context and surface handles.
    pub fn live_resources(log: &[Call]) -> isize {
        log.iter()
            .map(|call| match call {
                Call::CreateDevice | Call::OpenDisplay | Call::CreateContext | Call::CreateSurface => 1,
                Call::DestroyDevice
                | Call::TerminateDisplay
                | Call::DestroyContext
                | Call::DestroySurface => -1,
                _ => 0,
            })
            .sum()
    }

    fn attempt(&self, call: Call) -> bool {
        if self.fail_on == Some(call) {
            return false;
        }
        self.calls.borrow_mut().push(call);
        true
    }
}

impl GpuPlatform for MockPlatform {
    type Device = u32;
    type Display = u32;
    type Config = usize;
    type Context = u32;
    type Surface = MockSwapchain;
    type Buffer = MockBuffer;

    fn load_platform_extensions(&mut self) -> bool {
        self.attempt(Call::LoadExtensions)
    }

    fn create_device(&mut self, _fd: BorrowedFd<'_>) -> io::Result<Self::Device> {
        if self.attempt(Call::CreateDevice) {
            Ok(1)
        } else {
            Err(io::Error::from_raw_os_error(19)) // ENODEV
        }
    }

    fn destroy_device(&mut self, _device: Self::Device) {
        self.attempt(Call::DestroyDevice);
    }

    fn bind_es_api(&mut self) -> bool {
        self.attempt(Call::BindApi)
    }

    fn open_display(&mut self, _device: &Self::Device) -> Option<Self::Display> {
        self.attempt(Call::OpenDisplay).then_some(2)
    }

    fn terminate_display(&mut self, _display: Self::Display) {
        self.attempt(Call::TerminateDisplay);
    }

    fn configs(&mut self, _display: Self::Display) -> Vec<ConfigDescriptor<Self::Config>> {
        if !self.attempt(Call::Configs) {
            return Vec::new();
        }
        self.visuals
            .iter()
            .enumerate()
            .map(|(config, &native_visual_id)| ConfigDescriptor { config, native_visual_id })
            .collect()
    }

    fn create_context(&mut self, _display: Self::Display, _config: Self::Config) -> Option<Self::Context> {
        self.attempt(Call::CreateContext).then_some(3)
    }

    fn destroy_context(&mut self, _display: Self::Display, _context: Self::Context) {
        self.attempt(Call::DestroyContext);
    }

    fn create_surface(
        &mut self,
        _device: &Self::Device,
        _display: Self::Display,
        _config: Self::Config,
        width: u32,
        height: u32,
    ) -> Result<Self::Surface, RenderError> {
        if !self.attempt(Call::CreateSurface) {
            return Err(RenderError::SurfaceCreation("mock failure".to_string()));
        }
        Ok(MockSwapchain {
            width,
            height,
            slots: vec![Rc::new(RefCell::new(None)), Rc::new(RefCell::new(None))],
            next: Cell::new(0),
        })
    }

    fn destroy_surface(&mut self, _display: Self::Display, surface: Self::Surface) {
        self.attempt(Call::DestroySurface);
        for slot in &surface.slots {
            slot.borrow_mut().take();
        }
    }

    fn make_current(
        &mut self,
        _display: Self::Display,
        _context: Self::Context,
        _surface: Option<&Self::Surface>,
    ) -> Result<(), RenderError> {
        if self.attempt(Call::MakeCurrent) {
            Ok(())
        } else {
            Err(RenderError::MakeCurrent("mock failure".to_string()))
        }
    }

    fn clear(&mut self, _width: u32, _height: u32, _color: [f32; 4]) {
        self.attempt(Call::Clear);
    }

    fn swap_buffers(&mut self, _display: Self::Display, _surface: &Self::Surface) -> Result<(), RenderError> {
        if self.attempt(Call::SwapBuffers) {
            Ok(())
        } else {
            Err(RenderError::SwapBuffers("mock failure".to_string()))
        }
    }

    fn lock_front_buffer(&mut self, surface: &Self::Surface) -> Result<Self::Buffer, RenderError> {
        if !self.attempt(Call::LockFrontBuffer) {
            return Err(RenderError::FrontBuffer("mock failure".to_string()));
        }
        let index = surface.next.get();
        surface.next.set((index + 1) % surface.slots.len());
        Ok(MockBuffer {
            geometry: BufferGeometry {
                width: surface.width,
                height: surface.height,
                stride: surface.width * 4,
                handle: index as u32 + 1,
            },
            slot: Rc::clone(&surface.slots[index]),
        })
    }
}
