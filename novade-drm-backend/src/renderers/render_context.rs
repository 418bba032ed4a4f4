// novade-drm-backend/src/renderers/render_context.rs
//! The per-device rendering context: one allocation device, one display
//! connection and one ES context shared by every output of the GPU.

use std::fmt;
use std::os::fd::BorrowedFd;

use tracing::{debug, error, info};

use super::{ConfigDescriptor, GpuPlatform, GBM_FORMAT_XRGB8888};
use crate::errors::{RenderError, RendererInitError};

struct ContextHandles<P: GpuPlatform> {
    device: P::Device,
    display: P::Display,
    config: P::Config,
    context: P::Context,
}

/// Releases whatever a partially completed [`RenderContext::initialize`]
/// acquired, in reverse order of acquisition.
struct InitGuard<'a, P: GpuPlatform> {
    platform: &'a mut P,
    device: Option<P::Device>,
    display: Option<P::Display>,
    context: Option<P::Context>,
}

impl<P: GpuPlatform> InitGuard<'_, P> {
    /// Hands the acquired resources over. Returns `None`, releasing them on
    /// drop, if any of them is missing.
    fn disarm(mut self, config: P::Config) -> Option<ContextHandles<P>> {
        match (self.device.take(), self.display.take(), self.context.take()) {
            (Some(device), Some(display), Some(context)) => {
                Some(ContextHandles { device, display, config, context })
            }
            (device, display, context) => {
                self.device = device;
                self.display = display;
                self.context = context;
                None
            }
        }
    }
}

impl<P: GpuPlatform> Drop for InitGuard<'_, P> {
    fn drop(&mut self) {
        if let (Some(display), Some(context)) = (self.display, self.context.take()) {
            self.platform.destroy_context(display, context);
        }
        if let Some(display) = self.display.take() {
            self.platform.terminate_display(display);
        }
        if let Some(device) = self.device.take() {
            self.platform.destroy_device(device);
        }
    }
}

/// Device-wide rendering state.
///
/// Created once per DRM device with [`RenderContext::initialize`]. Released by
/// [`RenderContext::teardown`] or on drop.
pub struct RenderContext<P: GpuPlatform> {
    platform: P,
    handles: Option<ContextHandles<P>>,
}

/// Picks the first config whose native visual is XRGB8888.
pub fn choose_config<C: Copy>(configs: &[ConfigDescriptor<C>]) -> Option<C> {
    configs
        .iter()
        .find(|descriptor| descriptor.native_visual_id == Some(GBM_FORMAT_XRGB8888))
        .map(|descriptor| descriptor.config)
}

impl<P: GpuPlatform> RenderContext<P> {
    /// Sets up the allocation device, display and ES 3 context for `fd`.
    ///
    /// Either returns a fully usable context or fails having released every
    /// resource it acquired.
    pub fn initialize(mut platform: P, fd: BorrowedFd<'_>) -> Result<Self, RendererInitError> {
        let handles = Self::acquire(&mut platform, fd)?;
        info!("Rendering context initialized");
        Ok(Self { platform, handles: Some(handles) })
    }

    fn acquire(platform: &mut P, fd: BorrowedFd<'_>) -> Result<ContextHandles<P>, RendererInitError> {
        if !platform.load_platform_extensions() {
            error!("Platform display extensions are not supported");
            return Err(RendererInitError::NoDisplayExtension);
        }

        let mut guard = InitGuard { platform, device: None, display: None, context: None };

        let device = guard.platform.create_device(fd).map_err(|err| {
            error!("Could not create allocation device: {}", err);
            RendererInitError::NoDevice(err)
        })?;
        guard.device = Some(device);

        if !guard.platform.bind_es_api() {
            error!("Could not bind the OpenGL ES API");
            return Err(RendererInitError::ApiBind);
        }

        let display = match guard.device.as_ref().and_then(|device| guard.platform.open_display(device)) {
            Some(display) => display,
            None => {
                error!("Could not open platform display");
                return Err(RendererInitError::NoDisplay);
            }
        };
        guard.display = Some(display);

        let configs = guard.platform.configs(display);
        debug!(count = configs.len(), "Enumerated display configs");
        let config = choose_config(&configs).ok_or_else(|| {
            error!("No display config renders into XRGB8888");
            RendererInitError::NoConfig
        })?;

        let context = guard.platform.create_context(display, config).ok_or_else(|| {
            error!("Could not create ES context");
            RendererInitError::NoContext
        })?;
        guard.context = Some(context);

        guard.disarm(config).ok_or(RendererInitError::NoContext)
    }

    /// Releases context, display and device, in that order. Safe to call on an
    /// already torn down context.
    pub fn teardown(&mut self) {
        let Some(handles) = self.handles.take() else {
            return;
        };
        if let Err(err) = self.platform.make_current(handles.display, handles.context, None) {
            debug!("Could not unbind context before teardown: {}", err);
        }
        self.platform.destroy_context(handles.display, handles.context);
        self.platform.terminate_display(handles.display);
        self.platform.destroy_device(handles.device);
        info!("Rendering context released");
    }

    pub fn is_initialized(&self) -> bool {
        self.handles.is_some()
    }

    fn handles(&self) -> Result<&ContextHandles<P>, RenderError> {
        self.handles.as_ref().ok_or(RenderError::ContextReleased)
    }

    /// Creates the swap chain of one output.
    pub fn create_surface(&mut self, width: u32, height: u32) -> Result<P::Surface, RenderError> {
        let handles = self.handles.as_ref().ok_or(RenderError::ContextReleased)?;
        self.platform
            .create_surface(&handles.device, handles.display, handles.config, width, height)
    }

    pub fn destroy_surface(&mut self, surface: P::Surface) {
        match self.handles.as_ref() {
            Some(handles) => {
                let (display, context) = (handles.display, handles.context);
                // The surface may still be current; unbind it first.
                if let Err(err) = self.platform.make_current(display, context, None) {
                    debug!("Could not unbind surface: {}", err);
                }
                self.platform.destroy_surface(display, surface);
            }
            None => error!("Dropping an output surface after its rendering context"),
        }
    }

    /// Makes `surface` the target of subsequent drawing.
    pub fn make_current(&mut self, surface: &P::Surface) -> Result<(), RenderError> {
        let handles = self.handles()?;
        let (display, context) = (handles.display, handles.context);
        self.platform.make_current(display, context, Some(surface))
    }

    pub fn clear(&mut self, width: u32, height: u32, color: [f32; 4]) {
        self.platform.clear(width, height, color);
    }

    pub fn swap_buffers(&mut self, surface: &P::Surface) -> Result<(), RenderError> {
        let display = self.handles()?.display;
        self.platform.swap_buffers(display, surface)
    }

    pub fn lock_front_buffer(&mut self, surface: &P::Surface) -> Result<P::Buffer, RenderError> {
        self.platform.lock_front_buffer(surface)
    }
}

impl<P: GpuPlatform> Drop for RenderContext<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<P: GpuPlatform> fmt::Debug for RenderContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}
