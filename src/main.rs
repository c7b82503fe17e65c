//! univ-convert - whole-slide image converter.
//!
//! Thin shell over the library: parses the command line, installs the
//! tracing subscriber and reports outcomes.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use univ_convert::{
    config::{Cli, Command, ConvertConfig, InspectConfig, ValidateConfig},
    container::validate_path,
    convert::{Converter, TracingSink},
    format::{default_registry, resolve_format},
    model::{available_resolutions, select_main_scene},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Convert(config) => run_convert(config).await,
        Command::Validate(config) => run_validate(config).await,
        Command::Inspect(config) => run_inspect(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "univ_convert=debug"
    } else {
        "univ_convert=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Convert Command
// =============================================================================

async fn run_convert(config: ConvertConfig) -> ExitCode {
    init_logging(config.verbose);

    let request = match config.to_request() {
        Ok(request) => request,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // VSI input needs a slide decoder backend, which this binary does not link.
    let converter = Converter::new(default_registry(None)).with_sink(Arc::new(TracingSink));
    let result = converter.convert(&request).await;

    for (i, hop) in result.hops.iter().enumerate() {
        info!(
            "Hop {}: {} -> {} ended {}",
            i + 1,
            hop.from,
            hop.to,
            hop.final_state()
        );
    }

    match result.into_result() {
        Ok(summary) => {
            info!(
                "Converted {} -> {}: {:?}, {} level(s), {} bytes",
                request.input.display(),
                request.output.display(),
                summary.shape,
                summary.levels,
                summary.bytes_written
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Conversion failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Validate Command
// =============================================================================

async fn run_validate(config: ValidateConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    let report = validate_path(&config.path, config.strict).await;

    if config.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("Validating {}", report.path);
        if report.strict {
            println!("(strict: checksums verified)");
        }
        for issue in &report.issues {
            println!("  [{:?}] {:?}: {}", issue.severity, issue.kind, issue.message);
        }
        if report.is_valid() {
            println!("✓ valid");
        } else {
            println!("✗ {} error(s)", report.errors().count());
        }
    }

    if report.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// =============================================================================
// Inspect Command
// =============================================================================

async fn run_inspect(config: InspectConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    let Some(format) = resolve_format(&config.path, config.from).await else {
        eprintln!("Error: cannot determine the format of {}", config.path.display());
        return ExitCode::FAILURE;
    };
    let registry = default_registry(None);
    let Some(adapter) = registry.decoder(format) else {
        eprintln!("Error: no decoder for {}", format);
        return ExitCode::FAILURE;
    };
    let scenes = match adapter.list_scenes(&config.path).await {
        Ok(scenes) => scenes,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let main_scene = select_main_scene(&scenes);
    let resolutions = main_scene
        .and_then(|index| scenes.iter().find(|s| s.index == index))
        .map(|s| available_resolutions(s.width, s.height))
        .unwrap_or_default();

    if config.json {
        let json = serde_json::json!({
            "path": config.path.display().to_string(),
            "format": format.name(),
            "main_scene": main_scene,
            "scenes": scenes.iter().map(|s| serde_json::json!({
                "index": s.index,
                "name": s.name,
                "width": s.width,
                "height": s.height,
                "kind": s.kind.name(),
            })).collect::<Vec<_>>(),
            "resolutions": resolutions.iter().map(|r| serde_json::json!({
                "level": r.level,
                "width": r.width,
                "height": r.height,
                "megapixels": r.megapixels,
                "downsample": r.downsample,
            })).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&json) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    println!("{} ({})", config.path.display(), format.display_name());
    println!("Scenes:");
    for scene in &scenes {
        let marker = if Some(scene.index) == main_scene { "*" } else { " " };
        println!(
            " {} {:>3}  {:<32} {:>8} x {:<8} {}",
            marker,
            scene.index,
            scene.name,
            scene.width,
            scene.height,
            scene.kind.name()
        );
    }
    if !resolutions.is_empty() {
        println!("Resolutions of the main scene:");
        for r in &resolutions {
            println!(
                "  level {:>2}: {} x {} ({:.1} MP, 1/{})",
                r.level, r.width, r.height, r.megapixels, r.downsample
            );
        }
    }

    ExitCode::SUCCESS
}
