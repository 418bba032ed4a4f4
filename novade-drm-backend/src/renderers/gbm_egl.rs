// novade-drm-backend/src/renderers/gbm_egl.rs
//! GBM allocation device + EGL (loaded at runtime) + GLES through `glow`.

use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::raw::c_void;

use gbm::{AsRaw, BufferObject, BufferObjectFlags, Device as GbmDevice, Format, Surface as GbmSurface};
use glow::HasContext;
use khronos_egl as egl;
use tracing::{debug, info, warn};

use super::{ConfigDescriptor, FramebufferGuard, GpuPlatform, ScanoutBuffer};
use crate::errors::{RenderError, RendererInitError};
use crate::kms::{BufferGeometry, FramebufferId};

type EglInstance = egl::DynamicInstance<egl::EGL1_4>;

/// `EGL_PLATFORM_GBM_MESA`
const PLATFORM_GBM_MESA: egl::Enum = 0x31D7;

type GetPlatformDisplayExt =
    unsafe extern "system" fn(egl::Enum, *mut c_void, *const egl::Int) -> egl::EGLDisplay;
type CreatePlatformWindowSurfaceExt = unsafe extern "system" fn(
    egl::EGLDisplay,
    egl::EGLConfig,
    *mut c_void,
    *const egl::Int,
) -> egl::EGLSurface;

fn gbm_error<E: fmt::Debug>(err: E) -> RenderError {
    RenderError::FrontBuffer(format!("{:?}", err))
}

/// Swap chain of one output: a GBM surface and the EGL window surface on it.
pub struct GbmSwapchain {
    gbm: GbmSurface<FramebufferGuard>,
    egl: egl::Surface,
}

impl fmt::Debug for GbmSwapchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmSwapchain").field("egl", &self.egl).finish_non_exhaustive()
    }
}

pub struct GbmEglPlatform {
    egl: EglInstance,
    get_platform_display: Option<GetPlatformDisplayExt>,
    create_platform_window_surface: Option<CreatePlatformWindowSurfaceExt>,
    gl: Option<glow::Context>,
}

impl GbmEglPlatform {
    /// Loads `libEGL.so.1`.
    pub fn load() -> Result<Self, RendererInitError> {
        let egl = unsafe { EglInstance::load_required() }
            .map_err(|err| RendererInitError::LibraryLoad(err.to_string()))?;
        Ok(Self {
            egl,
            get_platform_display: None,
            create_platform_window_surface: None,
            gl: None,
        })
    }

    fn last_error(&self) -> String {
        match self.egl.get_error() {
            Some(err) => err.to_string(),
            None => "EGL_SUCCESS".to_string(),
        }
    }
}

impl GpuPlatform for GbmEglPlatform {
    type Device = GbmDevice<OwnedFd>;
    type Display = egl::Display;
    type Config = egl::Config;
    type Context = egl::Context;
    type Surface = GbmSwapchain;
    type Buffer = BufferObject<FramebufferGuard>;

    fn load_platform_extensions(&mut self) -> bool {
        let get_display = self.egl.get_proc_address("eglGetPlatformDisplayEXT");
        let create_surface = self.egl.get_proc_address("eglCreatePlatformWindowSurfaceEXT");
        // SAFETY: the entry points have these signatures per EGL_EXT_platform_base.
        unsafe {
            self.get_platform_display = get_display
                .map(|f| std::mem::transmute::<extern "system" fn(), GetPlatformDisplayExt>(f));
            self.create_platform_window_surface = create_surface.map(|f| {
                std::mem::transmute::<extern "system" fn(), CreatePlatformWindowSurfaceExt>(f)
            });
        }
        self.get_platform_display.is_some() && self.create_platform_window_surface.is_some()
    }

    fn create_device(&mut self, fd: BorrowedFd<'_>) -> io::Result<Self::Device> {
        GbmDevice::new(fd.try_clone_to_owned()?)
    }

    fn destroy_device(&mut self, device: Self::Device) {
        drop(device);
    }

    fn bind_es_api(&mut self) -> bool {
        self.egl.bind_api(egl::OPENGL_ES_API).is_ok()
    }

    fn open_display(&mut self, device: &Self::Device) -> Option<Self::Display> {
        let get_platform_display = self.get_platform_display?;
        // SAFETY: `device` outlives the display, which is terminated before the
        // device is destroyed.
        let ptr = unsafe {
            get_platform_display(PLATFORM_GBM_MESA, device.as_raw() as *mut c_void, std::ptr::null())
        };
        if ptr.is_null() {
            return None;
        }
        let display = unsafe { egl::Display::from_ptr(ptr) };

        match self.egl.initialize(display) {
            Ok((major, minor)) => {
                info!("EGL {}.{} initialized", major, minor);
                Some(display)
            }
            Err(err) => {
                warn!("eglInitialize failed: {}", err);
                self.terminate_display(display);
                None
            }
        }
    }

    fn terminate_display(&mut self, display: Self::Display) {
        if let Err(err) = self.egl.terminate(display) {
            warn!("eglTerminate failed: {}", err);
        }
        if let Err(err) = self.egl.release_thread() {
            debug!("eglReleaseThread failed: {}", err);
        }
    }

    fn configs(&mut self, display: Self::Display) -> Vec<ConfigDescriptor<Self::Config>> {
        let count = match self.egl.get_config_count(display) {
            Ok(count) => count,
            Err(err) => {
                warn!("eglGetConfigs failed: {}", err);
                return Vec::new();
            }
        };

        let mut configs = Vec::with_capacity(count);
        if let Err(err) = self.egl.choose_config(display, &[egl::NONE], &mut configs) {
            warn!("eglChooseConfig failed: {}", err);
            return Vec::new();
        }

        configs
            .into_iter()
            .map(|config| ConfigDescriptor {
                config,
                native_visual_id: self
                    .egl
                    .get_config_attrib(display, config, egl::NATIVE_VISUAL_ID)
                    .ok()
                    .map(|id| id as u32),
            })
            .collect()
    }

    fn create_context(
        &mut self,
        display: Self::Display,
        config: Self::Config,
    ) -> Option<Self::Context> {
        let attributes = [egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE];
        match self.egl.create_context(display, config, None, &attributes) {
            Ok(context) => Some(context),
            Err(err) => {
                warn!("eglCreateContext failed: {}", err);
                None
            }
        }
    }

    fn destroy_context(&mut self, display: Self::Display, context: Self::Context) {
        self.gl = None;
        if let Err(err) = self.egl.destroy_context(display, context) {
            warn!("eglDestroyContext failed: {}", err);
        }
    }

    fn create_surface(
        &mut self,
        device: &Self::Device,
        display: Self::Display,
        config: Self::Config,
        width: u32,
        height: u32,
    ) -> Result<Self::Surface, RenderError> {
        let gbm = device
            .create_surface::<FramebufferGuard>(
                width,
                height,
                Format::Xrgb8888,
                BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING,
            )
            .map_err(|err| RenderError::SurfaceCreation(err.to_string()))?;

        let create = self.create_platform_window_surface.ok_or_else(|| {
            RenderError::SurfaceCreation("eglCreatePlatformWindowSurfaceEXT is not loaded".to_string())
        })?;
        let ptr = unsafe {
            create(display.as_ptr(), config.as_ptr(), gbm.as_raw() as *mut c_void, std::ptr::null())
        };
        if ptr.is_null() {
            return Err(RenderError::SurfaceCreation(self.last_error()));
        }
        let egl = unsafe { egl::Surface::from_ptr(ptr) };

        Ok(GbmSwapchain { gbm, egl })
    }

    fn destroy_surface(&mut self, display: Self::Display, surface: Self::Surface) {
        if let Err(err) = self.egl.destroy_surface(display, surface.egl) {
            warn!("eglDestroySurface failed: {}", err);
        }
        // Destroying the GBM surface frees its buffers, and with them their
        // framebuffer registrations.
        drop(surface.gbm);
    }

    fn make_current(
        &mut self,
        display: Self::Display,
        context: Self::Context,
        surface: Option<&Self::Surface>,
    ) -> Result<(), RenderError> {
        let result = match surface {
            Some(surface) => {
                self.egl
                    .make_current(display, Some(surface.egl), Some(surface.egl), Some(context))
            }
            None => self.egl.make_current(display, None, None, None),
        };
        result.map_err(|err| RenderError::MakeCurrent(err.to_string()))
    }

    fn clear(&mut self, width: u32, height: u32, color: [f32; 4]) {
        let egl = &self.egl;
        let gl = self.gl.get_or_insert_with(|| unsafe {
            glow::Context::from_loader_function(|name| {
                egl.get_proc_address(name)
                    .map_or(std::ptr::null(), |f| f as *const c_void)
            })
        });
        unsafe {
            gl.viewport(0, 0, width as i32, height as i32);
            gl.clear_color(color[0], color[1], color[2], color[3]);
            gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    fn swap_buffers(
        &mut self,
        display: Self::Display,
        surface: &Self::Surface,
    ) -> Result<(), RenderError> {
        self.egl
            .swap_buffers(display, surface.egl)
            .map_err(|err| RenderError::SwapBuffers(err.to_string()))
    }

    fn lock_front_buffer(&mut self, surface: &Self::Surface) -> Result<Self::Buffer, RenderError> {
        // SAFETY: called once per successful eglSwapBuffers on this surface.
        unsafe { surface.gbm.lock_front_buffer() }.map_err(gbm_error)
    }
}

impl ScanoutBuffer for BufferObject<FramebufferGuard> {
    fn geometry(&self) -> Result<BufferGeometry, RenderError> {
        let handle = self.handle().map_err(gbm_error)?;
        Ok(BufferGeometry {
            width: self.width().map_err(gbm_error)?,
            height: self.height().map_err(gbm_error)?,
            stride: self.stride().map_err(gbm_error)?,
            // SAFETY: GEM handles are reported through the u32 member.
            handle: unsafe { handle.u32_ },
        })
    }

    fn framebuffer(&self) -> Option<FramebufferId> {
        self.userdata().ok().flatten().map(FramebufferGuard::id)
    }

    fn attach_framebuffer(&mut self, guard: FramebufferGuard) -> Result<(), RenderError> {
        self.set_userdata(guard).map(drop).map_err(gbm_error)
    }
}
