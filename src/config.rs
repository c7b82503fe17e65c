//! Command-line configuration for univ-convert.
//!
//! Every option can also be set through an environment variable with the
//! `UNIV_` prefix:
//!
//! - `UNIV_FROM` / `UNIV_TO` - format hints (`univ`, `ome-tiff`, `ome-zarr`, `vsi`)
//! - `UNIV_NO_PYRAMID` - skip pyramid generation
//! - `UNIV_COMPRESSION` - chunk compression (default: lossless-general)
//! - `UNIV_COMPRESSION_LEVEL` - lossless effort, 1-9 (default: 4)
//! - `UNIV_TILE_SIZE` - tile edge for tiling encoders (default: 512)
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use univ_convert::config::{Cli, Command};
//!
//! let cli = Cli::parse();
//! if let Command::Convert(config) = cli.command {
//!     let request = config.to_request()?;
//! }
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::convert::ConversionRequest;
use crate::format::{
    Compression, EncodeOptions, SourceFormat, DEFAULT_COMPRESSION_LEVEL, DEFAULT_TILE_SIZE,
};
use crate::model::SceneSelector;

// =============================================================================
// CLI
// =============================================================================

/// univ-convert - whole-slide image converter.
///
/// Converts between the univ container, OME-TIFF, OME-Zarr and Olympus VSI,
/// validates containers and lists the scenes of multi-series slides.
#[derive(Parser, Debug, Clone)]
#[command(name = "univ-convert")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Convert an image between formats.
    Convert(ConvertConfig),

    /// Check a univ container against its schema.
    Validate(ValidateConfig),

    /// List the scenes and resolutions of a source.
    Inspect(InspectConfig),
}

fn parse_format(value: &str) -> Result<SourceFormat, String> {
    value.parse()
}

// =============================================================================
// Convert
// =============================================================================

/// Compression names accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionArg {
    None,
    #[default]
    #[value(alias = "gzip", alias = "zlib")]
    LosslessGeneral,
    #[value(alias = "lz4", alias = "lzf")]
    FastGeneral,
    #[value(alias = "jpeg")]
    TiledLossy,
    #[value(alias = "shuffle-lz4", alias = "shuffle-gzip")]
    CombinableFilters,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => Compression::None,
            CompressionArg::LosslessGeneral => Compression::LosslessGeneral,
            CompressionArg::FastGeneral => Compression::FastGeneral,
            CompressionArg::TiledLossy => Compression::TiledLossy,
            CompressionArg::CombinableFilters => Compression::CombinableFilters,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConvertConfig {
    /// Source file or directory.
    pub input: PathBuf,

    /// Destination file or directory.
    pub output: PathBuf,

    /// Source format. Derived from the input when omitted.
    #[arg(long, env = "UNIV_FROM", value_parser = parse_format)]
    pub from: Option<SourceFormat>,

    /// Destination format. Derived from the output extension when omitted.
    #[arg(long, env = "UNIV_TO", value_parser = parse_format)]
    pub to: Option<SourceFormat>,

    /// Write the base level only.
    #[arg(long, default_value_t = false, env = "UNIV_NO_PYRAMID")]
    pub no_pyramid: bool,

    /// Chunk compression.
    #[arg(long, value_enum, default_value_t = CompressionArg::default(), env = "UNIV_COMPRESSION")]
    pub compression: CompressionArg,

    /// Lossless compression effort (1-9).
    #[arg(long, default_value_t = DEFAULT_COMPRESSION_LEVEL, env = "UNIV_COMPRESSION_LEVEL")]
    pub level: u32,

    /// Tile edge for tiling encoders.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "UNIV_TILE_SIZE")]
    pub tile_size: usize,

    /// Scene to export from a multi-series source. The main scene is
    /// picked automatically when omitted.
    #[arg(long)]
    pub scene: Option<usize>,

    /// Export a downsampled resolution level (each level halves the image).
    #[arg(long, default_value_t = 0)]
    pub resolution_level: u32,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl ConvertConfig {
    pub fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            include_pyramid: !self.no_pyramid,
            compression: self.compression.into(),
            compression_level: self.level,
            tile_size: self.tile_size,
        }
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.encode_options().validate()?;
        if self.input == self.output {
            return Err("input and output must differ".to_string());
        }
        if self.resolution_level > 16 {
            return Err(format!(
                "resolution level must be at most 16, got {}",
                self.resolution_level
            ));
        }
        Ok(())
    }

    /// Build the conversion request described by this configuration.
    pub fn to_request(&self) -> Result<ConversionRequest, String> {
        self.validate()?;
        let mut request = ConversionRequest::new(&self.input, &self.output)
            .with_options(self.encode_options())
            .with_resolution_level(self.resolution_level);
        request.source_format = self.from;
        request.dest_format = self.to;
        if let Some(index) = self.scene {
            request = request.with_scene(SceneSelector::Index(index));
        }
        Ok(request)
    }
}

// =============================================================================
// Validate
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ValidateConfig {
    /// Container to check.
    pub path: PathBuf,

    /// Also re-read every sample dataset and verify its checksum.
    #[arg(long, default_value_t = false)]
    pub strict: bool,

    /// Print the report as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

// =============================================================================
// Inspect
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    /// Source to list.
    pub path: PathBuf,

    /// Source format. Derived from the path when omitted.
    #[arg(long, env = "UNIV_FROM", value_parser = parse_format)]
    pub from: Option<SourceFormat>,

    /// Print the listing as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

// =============================================================================
// Tests
// =============================================================================
