//! Fan speed control daemon (fscd)
//!
//! Closed-loop BMC fan control: every sample interval the daemon reads the
//! configured sensors, evaluates each zone and commands its fans.
//!
//! # Failure Model
//! - **Startup**: any configuration problem stops the daemon before the loop starts
//! - **Per tick**: sensor and fan errors degrade to transitional or boost output
//! - **Panics**: caught at the top of the loop, fans forced to boost, process exits
//! - **Signals**: SIGTERM/SIGINT/SIGQUIT force boost before exiting; SIGQUIT also
//!   disarms the hardware watchdog

mod driver;
mod signals;
mod watchdog;

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fsc_core::constants::paths;
use fsc_core::{CommandCallouts, FscConfig, SensorIo, SystemIo};

use crate::driver::{Driver, TickStatus};
use crate::signals::{hold, Shutdown, Signals};
use crate::watchdog::Watchdog;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default log filter when neither `--log-level` nor `FSCD_LOG` is given
const DEFAULT_LOG_LEVEL: &str = "warn";

// ============================================================================
// CLI
// ============================================================================

struct Options {
    config: PathBuf,
    log_level: Option<String>,
    verbose: bool,
}

fn print_help() {
    eprintln!("fscd {} - fan speed control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    fscd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH      Configuration file (default {})", paths::CONFIG_FILE);
    eprintln!("    -l, --log-level LEVEL  Log filter (trace, debug, info, warn, error)");
    eprintln!("        --verbose          Log every zone evaluation trace");
    eprintln!("    -v, --version          Print version");
    eprintln!("    -h, --help             Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    FSCD_LOG               Log filter when --log-level is not given");
}

/// `None` means the process should exit successfully (help/version)
fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    let mut options = Options {
        config: PathBuf::from(paths::CONFIG_FILE),
        log_level: None,
        verbose: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("fscd {}", VERSION);
                return Ok(None);
            }
            "--verbose" => options.verbose = true,
            "-c" | "--config" => {
                i += 1;
                let path = args.get(i).ok_or("--config requires a path argument")?;
                options.config = PathBuf::from(path);
            }
            "-l" | "--log-level" => {
                i += 1;
                let level = args.get(i).ok_or("--log-level requires a level argument")?;
                options.log_level = Some(level.clone());
            }
            arg => return Err(format!("Unknown argument: {}", arg)),
        }
        i += 1;
    }

    Ok(Some(options))
}

// ============================================================================
// Process setup
// ============================================================================

/// journald when the journal socket exists, stdout otherwise
fn init_logging(level: &str) -> bool {
    use tracing_subscriber::prelude::*;

    if std::path::Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald) => {
                tracing_subscriber::registry()
                    .with(journald)
                    .with(tracing_subscriber::EnvFilter::new(level))
                    .init();
                return true;
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stdout", e),
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(level)
        .init();
    false
}

/// Records are read by other tools, so keep them world readable
fn set_umask() {
    // SAFETY: umask only replaces the process file creation mask.
    unsafe { libc::umask(0o022) };
    debug!("Umask set to 0022");
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        // The control loop catches the unwind and forces fail-safe output
        eprintln!("PANIC at {}: {}", location, panic_info);
    }));
}

fn build_driver(options: &Options) -> anyhow::Result<Driver> {
    let config = FscConfig::load(&options.config)
        .with_context(|| format!("loading configuration from {}", options.config.display()))?;

    let io: Arc<dyn SensorIo> = Arc::new(SystemIo);
    let callouts = CommandCallouts::new(io.clone(), config.callouts.clone());
    let watchdog = if config.watchdog {
        match Watchdog::open(&config.watchdog_device, config.watchdog_timeout_s) {
            Ok(watchdog) => Some(watchdog),
            Err(e) => {
                error!("CRITICAL: {}; running without hardware watchdog", e);
                None
            }
        }
    } else {
        None
    };

    let driver = Driver::new(config, io, Box::new(callouts), options.verbose).context("building zones")?;
    Ok(match watchdog {
        Some(watchdog) => driver.with_watchdog(watchdog),
        None => driver,
    })
}

// ============================================================================
// Sampling loop
// ============================================================================

/// Watchdog feed period for waits that span several ticks
fn kick_period(driver: &Driver) -> Duration {
    Duration::from_millis(driver.config().sample_interval_ms)
}

/// Run until a signal or a caught panic; returns the process exit code
async fn run(mut driver: Driver, mut signals: Signals) -> i32 {
    let interval = kick_period(&driver);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval completes immediately
    ticker.tick().await;

    loop {
        driver.kick_watchdog();

        tokio::select! {
            _ = ticker.tick() => {}
            shutdown = signals.recv() => return terminate(driver, shutdown),
        }

        match driver.guarded_tick(Instant::now()) {
            Ok(TickStatus::PowerRestored { settle: Some(settle) }) => {
                info!("Waiting {:?} for fans to spin up", settle);
                let period = kick_period(&driver);
                let interrupted = hold(settle, period, || driver.kick_watchdog(), signals.recv()).await;
                if let Some(shutdown) = interrupted {
                    return terminate(driver, shutdown);
                }
                ticker.reset();
            }
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                error!("CRITICAL: {}, exiting", e);
                driver.shutdown(false);
                return 1;
            }
            Err(e) => warn!("{}", e),
        }
    }
}

fn terminate(mut driver: Driver, shutdown: Shutdown) -> i32 {
    warn!("Killed by signal {}", shutdown.signal);
    driver.shutdown(shutdown.disarm_watchdog);
    0
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    install_panic_hook();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => return Ok(()),
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(2);
        }
    };

    let log_level = options
        .log_level
        .clone()
        .or_else(|| std::env::var("FSCD_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    let journald = init_logging(&log_level);
    set_umask();

    info!("STARTUP: fscd {} starting", VERSION);
    info!("STARTUP: Logging to {} at {}", if journald { "systemd journal" } else { "stdout" }, log_level);

    let mut driver = build_driver(&options)?;
    if let Err(e) = driver.start(Instant::now()) {
        error!("CRITICAL: Startup failed: {}", e);
        driver.shutdown(false);
        return Err(e).context("preparing record directories");
    }

    let mut signals = match Signals::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!("CRITICAL: Could not install signal handlers: {}", e);
            driver.shutdown(false);
            return Err(e).context("installing signal handlers");
        }
    };

    if driver.config().fanpower {
        let warmup = Duration::from_secs(driver.config().fanpower_warmup_s);
        info!("STARTUP: Waiting {:?} for fan power sequencing", warmup);
        let period = kick_period(&driver);
        let interrupted = hold(warmup, period, || driver.kick_watchdog(), signals.recv()).await;
        if let Some(shutdown) = interrupted {
            std::process::exit(terminate(driver, shutdown));
        }
    }

    let code = run(driver, signals).await;
    std::process::exit(code);
}
