//! The conversion service.
//!
//! [`Converter::convert`] runs one job: it resolves formats, plans a route,
//! and drives each hop through the state machine:
//!
//! ```text
//! Idle -> Decoding -> Normalizing -> [SceneSelecting] -> Pyramiding
//!      -> Encoding -> Verifying -> Done
//!                      (any working stage) -> Failed
//! ```
//!
//! A two-hop job writes an intermediate `.univ` container next to the
//! output. The container is removed when the job ends, whether it succeeded,
//! failed or was dropped mid-flight. A failed job never leaves its output
//! behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::container::validate_path;
use crate::error::ConvertError;
use crate::format::{
    default_registry, resolve_format, AdapterRegistry, Compression, DecodeRequest,
    EncodeOptions, SourceFormat,
};
use crate::io::{path_size, remove_path};
use crate::model::{
    build_pyramid, decimate_to_level, normalize, should_build_pyramid, ImagePyramid,
    SceneSelector,
};

use super::events::{EventSink, NullSink, ProgressEvent};
use super::route::{intermediate_path, plan_route, Route};
use super::state::{ConversionState, StateTrace};

/// Smallest aggregate size a directory-based output may have.
pub const MIN_DIRECTORY_BYTES: u64 = 1024;

// =============================================================================
// Request
// =============================================================================

/// One conversion job.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: PathBuf,
    pub output: PathBuf,

    /// Overrides format detection for the input.
    pub source_format: Option<SourceFormat>,

    /// Overrides format detection for the output.
    pub dest_format: Option<SourceFormat>,

    pub options: EncodeOptions,
    pub scene: SceneSelector,

    /// Export resolution level: the image is halved this many times.
    pub resolution_level: u32,
}

impl ConversionRequest {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            source_format: None,
            dest_format: None,
            options: EncodeOptions::default(),
            scene: SceneSelector::Auto,
            resolution_level: 0,
        }
    }

    pub fn from_format(mut self, format: SourceFormat) -> Self {
        self.source_format = Some(format);
        self
    }

    pub fn to_format(mut self, format: SourceFormat) -> Self {
        self.dest_format = Some(format);
        self
    }

    pub fn with_options(mut self, options: EncodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_scene(mut self, scene: SceneSelector) -> Self {
        self.scene = scene;
        self
    }

    pub fn with_resolution_level(mut self, level: u32) -> Self {
        self.resolution_level = level;
        self
    }
}

// =============================================================================
// Result
// =============================================================================

/// States one hop went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopTrace {
    pub from: SourceFormat,
    pub to: SourceFormat,
    pub input: PathBuf,
    pub output: PathBuf,
    pub states: Vec<ConversionState>,
}

impl HopTrace {
    pub fn final_state(&self) -> ConversionState {
        self.states
            .last()
            .copied()
            .unwrap_or(ConversionState::Idle)
    }
}

/// Summary of a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionSummary {
    pub route: Route,
    /// Bytes written to the final output.
    pub bytes_written: u64,
    /// Levels written, base included.
    pub levels: usize,
    /// Shape of the written base level.
    pub shape: [usize; 5],
    /// Scene exported from a multi-series source.
    pub scene_index: Option<usize>,
}

/// Outcome of [`Converter::convert`], with the trace of every hop run.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub input: PathBuf,
    pub output: PathBuf,
    pub hops: Vec<HopTrace>,
    pub outcome: Result<ConversionSummary, ConvertError>,
}

impl ConversionResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&ConvertError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<ConversionSummary, ConvertError> {
        self.outcome
    }
}

// =============================================================================
// Scoped cleanup
// =============================================================================

/// Removes a path when dropped, unless disarmed first.
struct ScopedPath {
    path: PathBuf,
    armed: bool,
}

impl ScopedPath {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarmed(path: PathBuf) -> Self {
        Self { path, armed: false }
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ScopedPath {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match remove_path(&self.path) {
            Ok(()) => debug!("Removed {}", self.path.display()),
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

// =============================================================================
// Converter
// =============================================================================

/// Everything one hop needs.
struct Hop<'a> {
    index: usize,
    from: SourceFormat,
    to: SourceFormat,
    input: &'a Path,
    output: &'a Path,
    scene: SceneSelector,
    resolution_level: u32,
    options: EncodeOptions,
}

/// What a finished hop produced.
struct HopOutput {
    bytes_written: u64,
    levels: usize,
    shape: [usize; 5],
    scene_index: Option<usize>,
}

/// Runs conversion jobs.
///
/// Holds no per-job state: jobs may run concurrently as long as each has
/// its own input and output paths.
#[derive(Clone)]
pub struct Converter {
    registry: AdapterRegistry,
    sink: Arc<dyn EventSink>,
}

impl Default for Converter {
    fn default() -> Self {
        Self::new(default_registry(None))
    }
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("registry", &self.registry)
            .finish()
    }
}

impl Converter {
    /// A converter reporting to nobody.
    pub fn new(registry: AdapterRegistry) -> Self {
        Self {
            registry,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Run `request` to completion.
    pub async fn convert(&self, request: &ConversionRequest) -> ConversionResult {
        let mut hops = Vec::new();
        let outcome = self.run(request, &mut hops).await;
        if let Err(e) = &outcome {
            warn!(
                "Conversion of {} to {} failed: {}",
                request.input.display(),
                request.output.display(),
                e
            );
        }
        ConversionResult {
            input: request.input.clone(),
            output: request.output.clone(),
            hops,
            outcome,
        }
    }

    /// Blocking form of [`convert`](Self::convert) on a private
    /// current-thread runtime. Must not be called from inside a runtime.
    pub fn convert_blocking(&self, request: &ConversionRequest) -> std::io::Result<ConversionResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(runtime.block_on(self.convert(request)))
    }

    /// Resolve the formats and the route of `request` without running it.
    pub async fn plan(&self, request: &ConversionRequest) -> Result<Route, ConvertError> {
        request
            .options
            .validate()
            .map_err(ConvertError::InvalidRequest)?;
        if request.input == request.output {
            return Err(ConvertError::InvalidRequest(format!(
                "input and output are the same path: {}",
                request.input.display()
            )));
        }
        if !tokio::fs::try_exists(&request.input).await.unwrap_or(false) {
            return Err(ConvertError::InvalidRequest(format!(
                "input does not exist: {}",
                request.input.display()
            )));
        }

        let from = resolve_format(&request.input, request.source_format)
            .await
            .ok_or_else(|| {
                ConvertError::InvalidRequest(format!(
                    "cannot determine the format of {}",
                    request.input.display()
                ))
            })?;
        let to = request
            .dest_format
            .or_else(|| SourceFormat::from_path(&request.output))
            .ok_or_else(|| {
                ConvertError::InvalidRequest(format!(
                    "cannot determine the output format of {}",
                    request.output.display()
                ))
            })?;

        let route = plan_route(from, to)?;
        let needed = match route {
            Route::Direct { from, to } => vec![(from, to)],
            Route::ViaContainer { from, to } => {
                vec![(from, SourceFormat::Univ), (SourceFormat::Univ, to)]
            }
        };
        for (from, to) in needed {
            if self.registry.decoder(from).is_none() || self.registry.encoder(to).is_none() {
                return Err(ConvertError::NoDirectRoute {
                    from: from.name(),
                    to: to.name(),
                });
            }
        }
        Ok(route)
    }

    async fn run(
        &self,
        request: &ConversionRequest,
        hops: &mut Vec<HopTrace>,
    ) -> Result<ConversionSummary, ConvertError> {
        let route = self.plan(request).await?;
        debug!(
            "Converting {} -> {} via {:?}",
            request.input.display(),
            request.output.display(),
            route
        );

        let last = match route {
            Route::Direct { from, to } => {
                let hop = Hop {
                    index: 0,
                    from,
                    to,
                    input: &request.input,
                    output: &request.output,
                    scene: request.scene,
                    resolution_level: request.resolution_level,
                    options: request.options.clone(),
                };
                self.run_traced(hop, hops).await?
            }
            Route::ViaContainer { from, to } => {
                let temp = intermediate_path(&request.output).map_err(|e| {
                    ConvertError::InvalidRequest(format!(
                        "cannot create an intermediate container next to {}: {}",
                        request.output.display(),
                        e
                    ))
                })?;
                debug!("Intermediate container: {}", temp.display());

                let first = Hop {
                    index: 0,
                    from,
                    to: SourceFormat::Univ,
                    input: &request.input,
                    output: &temp,
                    scene: request.scene,
                    resolution_level: request.resolution_level,
                    options: intermediate_options(&request.options),
                };
                let staged = self.run_traced(first, hops).await?;

                let second = Hop {
                    index: 1,
                    from: SourceFormat::Univ,
                    to,
                    input: &temp,
                    output: &request.output,
                    scene: SceneSelector::Auto,
                    resolution_level: 0,
                    options: request.options.clone(),
                };
                let mut last = self.run_traced(second, hops).await?;
                last.scene_index = staged.scene_index;
                last
            }
        };

        Ok(ConversionSummary {
            route,
            bytes_written: last.bytes_written,
            levels: last.levels,
            shape: last.shape,
            scene_index: last.scene_index,
        })
    }

    async fn run_traced(
        &self,
        hop: Hop<'_>,
        hops: &mut Vec<HopTrace>,
    ) -> Result<HopOutput, ConvertError> {
        self.sink.emit(ProgressEvent::HopStarted {
            hop: hop.index,
            from: hop.from,
            to: hop.to,
            output: hop.output.to_path_buf(),
        });

        let mut trace = StateTrace::new();
        let result = self.run_hop(&hop, &mut trace).await;
        if result.is_err() {
            self.enter(hop.index, &mut trace, ConversionState::Failed);
        }
        hops.push(HopTrace {
            from: hop.from,
            to: hop.to,
            input: hop.input.to_path_buf(),
            output: hop.output.to_path_buf(),
            states: trace.into_states(),
        });
        result
    }

    fn enter(&self, hop: usize, trace: &mut StateTrace, state: ConversionState) {
        if !trace.advance(state) {
            warn!("Ignoring transition {} -> {}", trace.current(), state);
            return;
        }
        self.sink.emit(ProgressEvent::StageEntered { hop, state });
    }

    async fn run_hop(&self, hop: &Hop<'_>, trace: &mut StateTrace) -> Result<HopOutput, ConvertError> {
        let no_route = || ConvertError::NoDirectRoute {
            from: hop.from.name(),
            to: hop.to.name(),
        };
        let decoder = self.registry.decoder(hop.from).ok_or_else(no_route)?;
        let encoder = self.registry.encoder(hop.to).ok_or_else(no_route)?;

        self.enter(hop.index, trace, ConversionState::Decoding);
        let decoded = decoder
            .decode(hop.input, &DecodeRequest::scene(hop.scene))
            .await
            .map_err(|source| ConvertError::Decode {
                format: hop.from.name(),
                source,
            })?;
        for warning in &decoded.warnings {
            self.sink.emit(ProgressEvent::Warning(warning.clone()));
        }

        self.enter(hop.index, trace, ConversionState::Normalizing);
        let multi_series = decoded.is_multi_series();
        let mut metadata = decoded.metadata;
        let normalized = normalize(decoded.raw, std::mem::take(&mut metadata.channel_names))?;
        metadata.channel_names = normalized.channel_names;
        let mut base = normalized.tensor;

        if multi_series {
            self.enter(hop.index, trace, ConversionState::SceneSelecting);
            let chosen = metadata
                .scene_index
                .and_then(|index| decoded.scenes.iter().find(|s| s.index == index));
            match chosen {
                Some(scene) => self.sink.emit(ProgressEvent::SceneSelected {
                    index: scene.index,
                    name: scene.name.clone(),
                    kind: scene.kind,
                }),
                None => self.sink.emit(ProgressEvent::Warning(format!(
                    "{} did not report which of its {} scenes was decoded",
                    hop.input.display(),
                    decoded.scenes.len()
                ))),
            }
        }

        if hop.resolution_level > 0 {
            base = decimate_to_level(base, hop.resolution_level)?;
            let factor = f64::from(1u32 << hop.resolution_level.min(31));
            metadata.physical_size = metadata.physical_size.scaled_xy(factor);
            metadata.resolution_level += hop.resolution_level;
            debug!(
                "Exporting resolution level {}: {:?}",
                hop.resolution_level,
                base.shape()
            );
        }

        self.enter(hop.index, trace, ConversionState::Pyramiding);
        let shape = base.shape();
        let pyramid = if hop.options.include_pyramid && should_build_pyramid(shape) {
            build_pyramid(base, |level| {
                self.sink.emit(ProgressEvent::PyramidLevelBuilt {
                    level: level.level,
                    shape: level.tensor.shape(),
                })
            })
        } else {
            debug!("Skipping pyramid for {:?}", shape);
            ImagePyramid::base_only(base)
        };

        self.enter(hop.index, trace, ConversionState::Encoding);
        metadata.conversion_date = Utc::now();
        let mut output = ScopedPath::disarmed(hop.output.to_path_buf());
        if let Err(e) = remove_path(hop.output) {
            return Err(ConvertError::InvalidRequest(format!(
                "cannot replace existing output {}: {}",
                hop.output.display(),
                e
            )));
        }
        output.arm();
        let bytes_written = encoder
            .encode_with_history(
                &pyramid,
                &metadata,
                hop.output,
                &hop.options,
                decoded.history.as_ref(),
            )
            .await
            .map_err(|source| ConvertError::Encode {
                format: hop.to.name(),
                source,
            })?;
        self.sink.emit(ProgressEvent::BytesWritten {
            path: hop.output.to_path_buf(),
            bytes: bytes_written,
        });

        self.enter(hop.index, trace, ConversionState::Verifying);
        verify_output(hop.output, hop.to).await?;

        output.disarm();
        self.enter(hop.index, trace, ConversionState::Done);
        Ok(HopOutput {
            bytes_written,
            levels: pyramid.level_count(),
            shape,
            scene_index: metadata.scene_index,
        })
    }
}

/// Options for the intermediate container: base level only, fast codec.
fn intermediate_options(options: &EncodeOptions) -> EncodeOptions {
    EncodeOptions {
        include_pyramid: false,
        compression: Compression::FastGeneral,
        ..options.clone()
    }
}

/// Post-write sanity check of `path`.
///
/// The output must exist and be non-empty; a directory store must add up
/// to more than [`MIN_DIRECTORY_BYTES`]; a container must open cleanly.
pub async fn verify_output(path: &Path, format: SourceFormat) -> Result<(), ConvertError> {
    let size = path_size(path).await.map_err(|e| {
        ConvertError::Verification(format!("{} was not written: {}", path.display(), e))
    })?;
    if size == 0 {
        return Err(ConvertError::Verification(format!(
            "{} is empty",
            path.display()
        )));
    }
    if format.is_directory() && size <= MIN_DIRECTORY_BYTES {
        return Err(ConvertError::Verification(format!(
            "{} holds only {} bytes",
            path.display(),
            size
        )));
    }
    if format == SourceFormat::Univ {
        let report = validate_path(path, false).await;
        let first = report.errors().next().map(|issue| issue.message.clone());
        if let Some(message) = first {
            return Err(ConvertError::Verification(format!(
                "{}: {}",
                path.display(),
                message
            )));
        }
    }
    Ok(())
}
