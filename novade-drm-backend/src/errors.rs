// This is novade-drm-backend/src/errors.rs
// Error types for the DRM output backend using `thiserror`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::OutputId;
use crate::config::ModeRequest;
use crate::kms::ConnectorHandle;

/// Setup faults of the rendering context. Fatal to the device they occur on.
#[derive(Error, Debug)]
pub enum RendererInitError {
    #[error("Could not load libEGL: {0}")]
    LibraryLoad(String),

    #[error("EGL platform display extensions (EGL_EXT_platform_base) are not available")]
    NoDisplayExtension,

    #[error("Could not create GBM device: {0}")]
    NoDevice(#[source] io::Error),

    #[error("Could not bind the OpenGL ES API")]
    ApiBind,

    #[error("Could not create or initialize the EGL display")]
    NoDisplay,

    #[error("No EGL config with an XRGB8888 native visual")]
    NoConfig,

    #[error("Could not create EGL context")]
    NoContext,
}

/// Failures of per-output rendering operations.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Rendering context has already been torn down")]
    ContextReleased,

    #[error("Failed to create output surface: {0}")]
    SurfaceCreation(String),

    #[error("Failed to make output surface current: {0}")]
    MakeCurrent(String),

    #[error("Buffer swap failed: {0}")]
    SwapBuffers(String),

    #[error("Failed to lock front buffer: {0}")]
    FrontBuffer(String),

    #[error("Failed to register scan-out framebuffer: {0}")]
    Framebuffer(#[source] io::Error),
}

/// A mode request string that is not `preferred`, `current` or
/// `<width>x<height>[@<refresh>]`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid mode request '{0}', expected 'preferred', 'current' or '<width>x<height>[@<refresh>]'")]
pub struct ModeRequestParseError(pub String);

/// The requested mode could not be resolved against the advertised list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModeSelectError {
    #[error(transparent)]
    InvalidRequest(#[from] ModeRequestParseError),

    #[error("Output does not have a currently configured mode")]
    NoPreviousMode,

    /// The active mode is not among the advertised ones. Points at
    /// inconsistent kernel state rather than a bad request.
    #[error("Active mode is not in the advertised mode list")]
    CurrentModeMissing,

    #[error("No advertised mode matches '{0}'")]
    NoMatchingMode(ModeRequest),
}

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("No free encoder/CRTC pairing for connector {connector:?}")]
    NoCrtcAvailable { connector: ConnectorHandle },
}

/// Resource faults of a single mode-set. The output reverts to disconnected.
#[derive(Error, Debug)]
pub enum ModesetError {
    #[error("Connector link is not active")]
    LinkInactive,

    #[error("Connector advertises no modes")]
    NoModes,

    #[error("Could not select mode: {0}")]
    Mode(#[from] ModeSelectError),

    #[error("Could not allocate display resources: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Could not set up output rendering: {0}")]
    Render(#[from] RenderError),

    #[error("KMS request failed: {0}")]
    Kms(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Renderer initialization failed: {0}")]
    RendererInit(#[from] RendererInitError),

    #[error("Mode-set failed: {0}")]
    Modeset(#[from] ModesetError),

    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("KMS request failed: {0}")]
    Kms(#[from] io::Error),

    #[error("Unknown output {0}")]
    UnknownOutput(OutputId),

    #[error("Output {0} has no active surface")]
    NotConnected(OutputId),

    #[error("Page flip on output {output} did not complete within {timeout:?}")]
    FlipDrainTimeout { output: OutputId, timeout: Duration },
}

// This alias can be used throughout the backend for function return types.
pub type Result<T, E = BackendError> = std::result::Result<T, E>;
