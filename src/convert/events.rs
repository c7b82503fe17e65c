//! Progress events emitted while a conversion runs.
//!
//! The pipeline never prints; it reports to an [`EventSink`] supplied by the
//! caller. [`TracingSink`] forwards to `tracing`, [`CollectingSink`] keeps
//! every event in memory.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::format::SourceFormat;
use crate::model::SceneKind;

use super::state::ConversionState;

/// Something worth reporting about a running job.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A hop of the route started.
    HopStarted {
        hop: usize,
        from: SourceFormat,
        to: SourceFormat,
        output: PathBuf,
    },
    StageEntered { hop: usize, state: ConversionState },
    SceneSelected {
        index: usize,
        name: String,
        kind: SceneKind,
    },
    /// Pyramid level `level` (1 = first downsampled level) was built.
    PyramidLevelBuilt { level: usize, shape: [usize; 5] },
    BytesWritten { path: PathBuf, bytes: u64 },
    Warning(String),
}

/// Receiver of [`ProgressEvent`]s.
///
/// Shared by every job of a [`Converter`](super::Converter), so
/// implementations must be thread-safe.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::HopStarted {
                hop,
                from,
                to,
                output,
            } => info!("Hop {}: {} -> {} ({})", hop + 1, from, to, output.display()),
            ProgressEvent::StageEntered { hop, state } => {
                info!("Hop {}: {}", hop + 1, state)
            }
            ProgressEvent::SceneSelected { index, name, kind } => {
                info!("Selected scene {} '{}' ({})", index, name, kind.name())
            }
            ProgressEvent::PyramidLevelBuilt { level, shape } => {
                info!("Built pyramid level {}: {:?}", level, shape)
            }
            ProgressEvent::BytesWritten { path, bytes } => {
                info!("Wrote {} bytes to {}", bytes, path.display())
            }
            ProgressEvent::Warning(message) => warn!("{}", message),
        }
    }
}

/// Records every event.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// States entered during hop `hop`, in order.
    pub fn stages(&self, hop: usize) -> Vec<ConversionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::StageEntered { hop: h, state } if h == hop => Some(state),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
