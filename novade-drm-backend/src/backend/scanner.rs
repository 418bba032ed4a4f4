// novade-drm-backend/src/backend/scanner.rs
use tracing::{debug, info};

use super::{DrmBackend, Output, OutputId, OutputState};
use crate::errors::Result;
use crate::event::{EventQueue, OutputEvent};
use crate::kms::KmsDevice;
use crate::renderers::GpuPlatform;

impl<K, P, Q> DrmBackend<K, P, Q>
where
    K: KmsDevice + 'static,
    P: GpuPlatform,
    Q: EventQueue,
{
    /// Re-enumerates connectors and reconciles the output records.
    ///
    /// Emits [`OutputEvent::Added`] for links that came up and
    /// [`OutputEvent::Removed`] for connected outputs whose link went down.
    /// Records are matched to connectors by handle. A connector that cannot be
    /// read is left as is until the next scan, and records whose connector is
    /// no longer reported keep their slot untouched.
    pub fn scan(&mut self) -> Result<()> {
        let resources = self.kms.resource_handles()?;

        for (slot, output) in self.outputs.iter().enumerate() {
            if !resources.connectors.contains(&output.connector) {
                debug!(
                    output = %OutputId::new(slot),
                    connector = output.connector.0,
                    "Connector no longer reported by the device, keeping its slot"
                );
            }
        }

        for &handle in &resources.connectors {
            let slot = match self.outputs.iter().position(|output| output.connector == handle) {
                Some(slot) => slot,
                None => {
                    debug!(slot = self.outputs.len(), connector = handle.0, "New connector slot");
                    self.outputs.push(Output::new(handle));
                    self.outputs.len() - 1
                }
            };
            let id = OutputId::new(slot);
            let info = match self.kms.connector_info(handle) {
                Ok(info) => info,
                Err(err) => {
                    debug!(output = %id, connector = handle.0, "Skipping unreadable connector: {}", err);
                    continue;
                }
            };

            let output = &mut self.outputs[slot];
            if output.state == OutputState::Invalid {
                output.state = OutputState::Disconnected;
                output.name = info.name();
                debug!(output = %id, name = %output.name, "Discovered connector");
            }

            match (output.state, info.is_connected()) {
                (OutputState::Disconnected, true) => {
                    output.state = OutputState::NeedsModeset;
                    output.modes = info.modes;
                    info!(output = %id, name = %output.name, "Output connected");
                    self.events.push(OutputEvent::Added(id));
                }
                (OutputState::Connected, false) => {
                    output.state = OutputState::Disconnected;
                    info!(output = %id, name = %output.name, "Output disconnected");
                    self.events.push(OutputEvent::Removed(id));
                }
                _ => {}
            }
        }

        Ok(())
    }
}
