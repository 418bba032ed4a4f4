//! KMS/DRM output backend for NovaDE.
//!
//! Discovers the outputs of one GPU, mode-sets them on demand with a claimed
//! CRTC and a GBM/EGL swap chain, and paces rendering with page-flip
//! completions. Hotplug, removal and frame readiness are reported as
//! [`OutputEvent`]s through an [`EventQueue`].
//!
//! The backend is driven entirely by its caller: [`DrmBackend::scan`] on a
//! timer or hotplug notification, [`DrmBackend::dispatch_completion`] when the
//! DRM fd becomes readable, and [`DrmBackend::begin`]/[`DrmBackend::end`]
//! around the drawing of each frame.

pub mod backend;
pub mod config;
pub mod errors;
pub mod event;
pub mod kms;
pub mod logging;
pub mod renderers;

#[cfg(test)]
mod testing;

pub use backend::{DrmBackend, Output, OutputId, OutputState};
pub use config::{BackendConfig, ModeRequest};
pub use errors::{BackendError, Result};
pub use event::{EventQueue, OutputEvent};
pub use kms::{DrmCard, KmsDevice};
pub use renderers::{GpuPlatform, RenderContext};
