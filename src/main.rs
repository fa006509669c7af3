use std::backtrace::Backtrace;
use std::panic;
use std::path::PathBuf;

use clap::Parser;
use log::{error, info, LevelFilter};

use prism_engine::EngineConfig;

// mimalloc is noticeably faster than the system allocator for the per-frame
// surface and texel churn.
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "prism_engine")]
#[command(about = "Deferred renderer with eye-adapting bloom and tonemapping")]
struct Args {
    /// JSON engine configuration. Missing sections use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Render this many frames on the CPU backend instead of opening a window.
    #[arg(long, value_name = "FRAMES")]
    headless: Option<u64>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() -> anyhow::Result<()> {
    setup_diagnostics();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if args.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    match args.headless {
        Some(frames) => {
            info!("Starting Prism Engine (headless, {frames} frames)...");
            let report = prism_engine::run_headless(&config, frames)?;
            println!(
                "{} frames, {} surfaces allocated, adapted luminance {:.4}",
                report.frames, report.stats.surfaces_allocated, report.luminance
            );
        }
        None => {
            info!("Starting Prism Engine (native)...");
            if let Err(err) = prism_engine::run_native(config) {
                error!("Engine terminated: {err}");
                return Err(err.into());
            }
        }
    }
    Ok(())
}

/// Logger with millisecond timestamps (`RUST_LOG` overrides the level) and a
/// panic hook that logs the reason, location and backtrace.
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::capture();

        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let location = panic_info
            .location()
            .map_or("unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));

        error!("=== ENGINE CRASH ===\nReason: {}\nLocation: {}\n\n{}", msg, location, backtrace);
    }));
}
