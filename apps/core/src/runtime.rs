use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{self, Config, ConfigError};
use crate::engine::{EngineError, EngineSettings, SyncEngine};
use crate::event_source::{DesktopEntryWatcher, EventSource};
use crate::logging;
use crate::package_source::{DesktopEntrySource, PackageSource};
use crate::pin_store::{PinStoreError, SqlitePinStore};
use crate::registry::Subscription;
use crate::transport;
use crate::uninstall::CommandUninstaller;

const USAGE: &str = "usage: roster-core [--config <path>] [--print-config] [--help]

Serves the launcher registry over a JSON line protocol on stdin/stdout.
Registry changes are printed as {\"event\":\"registry_changed\",...} lines.";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("logging setup failed: {0}")]
    Logging(std::io::Error),
    #[error("pin store error: {0}")]
    PinStore(#[from] PinStoreError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("{0}")]
    Usage(String),
    #[error("stdin read failed: {0}")]
    Io(std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    pub config_path: Option<PathBuf>,
    pub print_config: bool,
    pub show_help: bool,
}

pub fn parse_cli_args(args: &[String]) -> Result<CliOptions, RuntimeError> {
    let mut options = CliOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| RuntimeError::Usage("--config needs a path".to_string()))?;
                options.config_path = Some(PathBuf::from(value));
            }
            "--print-config" => options.print_config = true,
            "-h" | "--help" => options.show_help = true,
            other => {
                if let Some(value) = other.strip_prefix("--config=") {
                    options.config_path = Some(PathBuf::from(value));
                } else {
                    return Err(RuntimeError::Usage(format!("unknown argument: {other}\n{USAGE}")));
                }
            }
        }
    }
    Ok(options)
}

pub fn run() -> Result<(), RuntimeError> {
    run_with_options(CliOptions::default())
}

pub fn run_with_options(options: CliOptions) -> Result<(), RuntimeError> {
    if options.show_help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = config::load(options.config_path.as_deref())?;
    config::validate(&config).map_err(RuntimeError::InvalidConfig)?;

    if options.print_config {
        let rendered = toml::to_string_pretty(&config).map_err(ConfigError::from)?;
        print!("{rendered}");
        return Ok(());
    }

    if !config.config_path.exists() {
        config::save(&config)?;
        eprintln!(
            "[roster-core] wrote default config to {}",
            config.config_path.display()
        );
    }

    logging::init(config.log_level_filter()).map_err(RuntimeError::Logging)?;
    log::info!(
        "startup config_path={} pin_store={} application_dirs={}",
        config.config_path.display(),
        config.pin_store_path.display(),
        config.application_dirs.len()
    );

    let source: Arc<dyn PackageSource> = Arc::new(DesktopEntrySource::new(
        config.application_dirs.clone(),
        config.scan_depth,
    ));
    let engine = build_engine(&config, Arc::clone(&source))?;
    engine.start()?;

    let mut watcher = DesktopEntryWatcher::new(source, config.watch_interval());
    if let Err(error) = watcher.register(engine.event_sink()) {
        log::warn!("package watcher not running: {error}");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let printer = spawn_change_printer(engine.observe(), Arc::clone(&stop));

    let served = serve_lines(&engine, std::io::stdin().lock());

    watcher.deregister();
    stop.store(true, Ordering::SeqCst);
    if let Some(printer) = printer {
        let _ = printer.join();
    }
    engine.shutdown();
    log::info!("shutdown complete");
    served
}

pub fn build_engine(
    config: &Config,
    source: Arc<dyn PackageSource>,
) -> Result<SyncEngine, RuntimeError> {
    let pins = SqlitePinStore::open_file(&config.pin_store_path, &config.preference_space)?;
    let mut engine = SyncEngine::new(
        source,
        Arc::new(pins),
        EngineSettings::from_config(config),
    )?;
    if let Some(command) = config.uninstall_command.clone() {
        engine = engine.with_uninstaller(Arc::new(CommandUninstaller::new(command)));
    }
    Ok(engine)
}

/// Answers one JSON request per non-empty input line until EOF.
pub fn serve_lines<R: BufRead>(engine: &SyncEngine, input: R) -> Result<(), RuntimeError> {
    for line in input.lines() {
        let line = line.map_err(RuntimeError::Io)?;
        let payload = line.trim();
        if payload.is_empty() {
            continue;
        }
        println!("{}", transport::handle_json(engine, payload));
    }
    Ok(())
}

fn spawn_change_printer(
    subscription: Subscription,
    stop: Arc<AtomicBool>,
) -> Option<std::thread::JoinHandle<()>> {
    let spawned = std::thread::Builder::new()
        .name("roster-notify".to_string())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let Some(snapshot) = subscription.recv_timeout(Duration::from_millis(200)) else {
                    continue;
                };
                let line = serde_json::json!({
                    "event": "registry_changed",
                    "version": snapshot.version(),
                    "initialized": snapshot.is_initialized(),
                    "records": snapshot.len(),
                });
                println!("{line}");
            }
            subscription.unsubscribe();
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(error) => {
            log::warn!("change notifications disabled: {error}");
            None
        }
    }
}
