// novade-drm-backend/src/main.rs
//! `novade-drm-probe`: lights up every connected output of a DRM card and
//! renders a short colour ramp on each, then restores the console.
//!
//! Usage: `novade-drm-probe [config.toml] [frames]`

use std::collections::HashMap;
use std::os::fd::AsFd;
use std::path::Path;

use anyhow::{Context, Result};
use calloop::channel::{self, Event as ChannelEvent};
use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, LoopSignal, Mode, PostAction};
use tracing::{info, warn};

use novade_drm_backend::logging::init_minimal_logging;
use novade_drm_backend::renderers::GbmEglPlatform;
use novade_drm_backend::{BackendConfig, DrmBackend, DrmCard, OutputEvent, OutputId};

const DEFAULT_FRAMES: u32 = 300;

type Backend = DrmBackend<DrmCard, GbmEglPlatform, channel::Sender<OutputEvent>>;

struct Probe {
    backend: Backend,
    config: BackendConfig,
    frames: HashMap<OutputId, u32>,
    frame_limit: u32,
    signal: LoopSignal,
}

impl Probe {
    fn handle_event(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::Added(id) => {
                let Some(output) = self.backend.output(id) else {
                    return;
                };
                let request = self.config.mode_for(output.name()).clone();
                info!(output = %id, name = output.name(), %request, "Output added");
                if let Err(err) = self.backend.commit_mode(id, &request) {
                    warn!(output = %id, "Could not configure output: {}", err);
                }
            }
            OutputEvent::Removed(id) => {
                self.frames.remove(&id);
                if let Err(err) = self.backend.teardown_output(id) {
                    warn!(output = %id, "Could not tear output down: {}", err);
                }
            }
            OutputEvent::RenderReady(id) => {
                if let Err(err) = self.draw(id) {
                    warn!(output = %id, "Frame failed: {}", err);
                }
            }
        }
    }

    fn draw(&mut self, id: OutputId) -> novade_drm_backend::Result<()> {
        let frame = {
            let frame = self.frames.entry(id).or_insert(0);
            *frame += 1;
            *frame
        };
        if frame > self.frame_limit {
            if self.frames.values().all(|frame| *frame > self.frame_limit) {
                self.signal.stop();
            }
            return Ok(());
        }
        let level = (frame % 120) as f32 / 120.0;

        let Some((width, height)) = self.backend.output(id).and_then(|output| output.surface_size())
        else {
            return Ok(());
        };
        self.backend.begin(id)?;
        self.backend.renderer_mut().clear(width, height, [level, 0.2, 1.0 - level, 1.0]);
        self.backend.end(id)
    }
}

fn main() -> Result<()> {
    init_minimal_logging();

    let mut args = std::env::args_os().skip(1);
    let config = match args.next() {
        Some(path) => BackendConfig::load(Path::new(&path))?,
        None => BackendConfig::default(),
    };
    let frame_limit = match args.next() {
        Some(frames) => frames
            .to_string_lossy()
            .parse()
            .context("Frame count must be a positive integer")?,
        None => DEFAULT_FRAMES,
    };

    let card = DrmCard::open(&config.device)
        .with_context(|| format!("Failed to open {}", config.device.display()))?;
    let drm_fd = card.as_fd().try_clone_to_owned()?;
    let platform = GbmEglPlatform::load()?;

    let (sender, events) = channel::channel();
    let mut backend = DrmBackend::initialize(card, platform, sender)?;
    backend.set_flip_drain_timeout(config.flip_drain_timeout());

    let mut event_loop: EventLoop<'static, Probe> = EventLoop::try_new()?;
    let handle = event_loop.handle();

    handle
        .insert_source(
            Generic::new(drm_fd, Interest::READ, Mode::Level),
            |_, _, probe| {
                if let Err(err) = probe.backend.dispatch_completion() {
                    warn!("Failed to dispatch page-flip events: {}", err);
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| err.error)?;

    let scan_interval = config.scan_interval();
    handle
        .insert_source(Timer::immediate(), move |_, _, probe| {
            if let Err(err) = probe.backend.scan() {
                warn!("Connector scan failed: {}", err);
            }
            TimeoutAction::ToDuration(scan_interval)
        })
        .map_err(|err| err.error)?;

    handle
        .insert_source(events, |event, _, probe| {
            if let ChannelEvent::Msg(event) = event {
                probe.handle_event(event);
            }
        })
        .map_err(|err| err.error)?;

    let mut probe = Probe {
        backend,
        config,
        frames: HashMap::new(),
        frame_limit,
        signal: event_loop.get_signal(),
    };

    info!(device = %probe.config.device.display(), frame_limit, "Probing outputs");
    event_loop.run(None, &mut probe, |_| {})?;

    probe.backend.teardown_device();
    Ok(())
}
