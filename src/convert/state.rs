//! Conversion job states.

use std::fmt;

/// Stage of a single decode-to-encode traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionState {
    Idle,
    Decoding,
    Normalizing,
    SceneSelecting,
    Pyramiding,
    Encoding,
    Verifying,
    Done,
    Failed,
}

impl ConversionState {
    pub const fn name(&self) -> &'static str {
        match self {
            ConversionState::Idle => "idle",
            ConversionState::Decoding => "decoding",
            ConversionState::Normalizing => "normalizing",
            ConversionState::SceneSelecting => "scene-selecting",
            ConversionState::Pyramiding => "pyramiding",
            ConversionState::Encoding => "encoding",
            ConversionState::Verifying => "verifying",
            ConversionState::Done => "done",
            ConversionState::Failed => "failed",
        }
    }

    /// `Done` and `Failed` end a traversal.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, ConversionState::Done | ConversionState::Failed)
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// Every working stage may fail; scene selection only sits between
    /// normalization and pyramid building.
    pub fn can_transition_to(&self, next: ConversionState) -> bool {
        use ConversionState::*;
        match (*self, next) {
            (Idle, Decoding) => true,
            (Decoding, Normalizing) => true,
            (Normalizing, SceneSelecting) | (Normalizing, Pyramiding) => true,
            (SceneSelecting, Pyramiding) => true,
            (Pyramiding, Encoding) => true,
            (Encoding, Verifying) => true,
            (Verifying, Done) => true,
            (from, Failed) => !from.is_terminal() && from != Idle,
            _ => false,
        }
    }
}

impl fmt::Display for ConversionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// States visited by one traversal, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTrace {
    states: Vec<ConversionState>,
}

impl Default for StateTrace {
    fn default() -> Self {
        Self {
            states: vec![ConversionState::Idle],
        }
    }
}

impl StateTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ConversionState {
        self.states
            .last()
            .copied()
            .unwrap_or(ConversionState::Idle)
    }

    /// Move to `next`. Returns false, leaving the trace untouched, when the
    /// transition is not allowed.
    pub fn advance(&mut self, next: ConversionState) -> bool {
        if !self.current().can_transition_to(next) {
            return false;
        }
        self.states.push(next);
        true
    }

    pub fn states(&self) -> &[ConversionState] {
        &self.states
    }

    pub fn visited(&self, state: ConversionState) -> bool {
        self.states.contains(&state)
    }

    pub fn into_states(self) -> Vec<ConversionState> {
        self.states
    }
}
