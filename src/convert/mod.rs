//! Conversion orchestration.
//!
//! - [`state`]: the per-hop state machine
//! - [`route`]: direct adapter pairs and the two-hop fallback
//! - [`events`]: progress events and sinks
//! - [`service`]: the [`Converter`] that runs jobs

pub mod events;
pub mod route;
pub mod service;
pub mod state;

pub use events::{CollectingSink, EventSink, NullSink, ProgressEvent, TracingSink};
pub use route::{intermediate_path, is_direct, plan_route, Route, INTERMEDIATE_EXTENSION};
pub use service::{
    verify_output, ConversionRequest, ConversionResult, ConversionSummary, Converter, HopTrace,
    MIN_DIRECTORY_BYTES,
};
pub use state::{ConversionState, StateTrace};
