// novade-drm-backend/src/event.rs
//! Notifications pushed by the backend to whoever drives it.

use std::collections::VecDeque;

use crate::backend::OutputId;

/// Output lifecycle and frame pacing notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputEvent {
    /// A link became active. The output is waiting for a mode-set.
    Added(OutputId),
    /// A link went away or a mode-set failed. The output should be torn down.
    Removed(OutputId),
    /// The last page flip completed; the next frame may be drawn.
    RenderReady(OutputId),
}

impl OutputEvent {
    pub fn output(&self) -> OutputId {
        match *self {
            OutputEvent::Added(id) | OutputEvent::Removed(id) | OutputEvent::RenderReady(id) => id,
        }
    }
}

/// Sink for [`OutputEvent`]s. The backend only ever pushes.
pub trait EventQueue {
    fn push(&mut self, event: OutputEvent);
}

impl EventQueue for VecDeque<OutputEvent> {
    fn push(&mut self, event: OutputEvent) {
        self.push_back(event);
    }
}

impl EventQueue for Vec<OutputEvent> {
    fn push(&mut self, event: OutputEvent) {
        Vec::push(self, event);
    }
}

impl EventQueue for calloop::channel::Sender<OutputEvent> {
    fn push(&mut self, event: OutputEvent) {
        if self.send(event).is_err() {
            tracing::warn!(?event, "Output event receiver is gone, dropping event");
        }
    }
}

impl<Q: EventQueue + ?Sized> EventQueue for &mut Q {
    fn push(&mut self, event: OutputEvent) {
        (**self).push(event);
    }
}
