//! facekit worker: keeps face clusters up to date.
//!
//! Each cycle clusters new markers, matches stale ones, merges same-subject
//! clusters and audits the result.
//!
//! ## Usage
//!
//! ```bash
//! facekit-worker                        # Run every 300 seconds
//! facekit-worker --once                 # Run one cycle and exit
//! facekit-worker --once --index ~/Pictures
//! facekit-worker --once --reset --force
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use facekit::config::Config;
use facekit::db::{FaceStore, SqliteStore};
use facekit::faces::cluster::KindFilter;
use facekit::faces::crop::ImageCropper;
use facekit::faces::events::LogSink;
use facekit::faces::net::EmbeddingModel;
use facekit::faces::{reset, EngineRegistry, FaceProcessor};
use facekit::logging;
use facekit::tasks::{run_faces_background, run_maintenance, BackgroundTaskManager, MaintenanceOptions, TaskType};

struct WorkerArgs {
    /// Seconds between cycles.
    interval: u64,
    once: bool,
    config_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    force: bool,
    fix: bool,
    reset: bool,
    index: Option<PathBuf>,
}

impl Default for WorkerArgs {
    fn default() -> Self {
        Self {
            interval: 300,
            once: false,
            config_path: None,
            log_dir: None,
            force: false,
            fix: false,
            reset: false,
            index: None,
        }
    }
}

fn main() -> Result<()> {
    let args = parse_args();

    logging::init(args.log_dir.clone())?;
    info!("facekit worker starting");

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let store: Arc<dyn FaceStore> = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("Failed to open database {}", config.db_path.display()))?,
    );
    info!(path = %config.db_path.display(), "Database opened");

    if args.reset {
        let result = reset(store.as_ref())?;
        info!(removed = result.removed, unlinked = result.unlinked, "Reset done");
    }

    if let Some(dir) = &args.index {
        index_directory(store.as_ref(), &config, dir)?;
    }

    let opts = MaintenanceOptions {
        faces: config.faces.clone(),
        filter: KindFilter::from_config(config.faces.kind_filter.as_deref())?,
        force: args.force,
        fix: args.fix,
    };

    if args.once {
        let result = run_maintenance(store.as_ref(), &opts, &LogSink, &AtomicBool::new(false), None)?;
        info!("{}", result.summary());
    } else {
        info!(interval = args.interval, "Running in worker mode");
        run_loop(store, opts, args.interval);
    }

    info!("facekit worker stopped");
    Ok(())
}

fn index_directory(store: &dyn FaceStore, config: &Config, dir: &Path) -> Result<()> {
    let registry = EngineRegistry::new();
    let engine = registry.configure(&config.engine)?;
    let model = EmbeddingModel::new(&config.embedding);
    let crops = ImageCropper::new(config.faces.crop_cache.clone());

    info!(dir = %dir.display(), engine = engine.name(), "Indexing faces");

    let result = FaceProcessor::new(&config.faces).index_directory(
        store,
        engine.as_ref(),
        &model,
        &crops,
        dir,
        &config.scanner.image_extensions,
        &AtomicBool::new(false),
        None,
    );

    registry.reset();

    let result = result?;
    info!(
        files = result.files,
        markers = result.markers,
        failed = result.failed,
        "Indexing done"
    );
    Ok(())
}

fn run_loop(store: Arc<dyn FaceStore>, opts: MaintenanceOptions, interval: u64) {
    let mut manager = BackgroundTaskManager::new();

    loop {
        let cycle_store = store.clone();
        let cycle_opts = opts.clone();
        let spawned = manager.spawn(TaskType::Maintenance, move |tx, cancel| {
            run_faces_background(cycle_store, cycle_opts, tx, cancel)
        });

        if spawned.is_none() {
            warn!("Previous cycle still running, skipping");
        }

        while manager.has_running_tasks() {
            for done in manager.poll_updates() {
                if done.success {
                    info!(task = done.task_type.display_name(), "{}", done.message);
                } else {
                    error!(task = done.task_type.display_name(), "{}", done.message);
                }
            }
            thread::sleep(Duration::from_millis(500));
        }

        thread::sleep(Duration::from_secs(interval));
    }
}

fn parse_args() -> WorkerArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = WorkerArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => parsed.once = true,
            "--force" | "-f" => parsed.force = true,
            "--fix" => parsed.fix = true,
            "--reset" => parsed.reset = true,
            "--interval" | "-i" => {
                if let Some(value) = args.get(i + 1) {
                    if let Ok(interval) = value.parse() {
                        parsed.interval = interval;
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if let Some(value) = args.get(i + 1) {
                    parsed.config_path = Some(PathBuf::from(value));
                    i += 1;
                }
            }
            "--log-dir" => {
                if let Some(value) = args.get(i + 1) {
                    parsed.log_dir = Some(PathBuf::from(value));
                    i += 1;
                }
            }
            "--index" => {
                if let Some(value) = args.get(i + 1) {
                    parsed.index = Some(PathBuf::from(value));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"facekit-worker - face cluster maintenance

USAGE:
    facekit-worker [OPTIONS]

OPTIONS:
    -1, --once            Run one cycle and exit
    -i, --interval SECS   Seconds between cycles (default: 300)
    -c, --config PATH     Config file (default: ~/.config/facekit/config.toml)
        --log-dir PATH    Log directory when journald is unavailable
    -f, --force           Re-match every marker
        --fix             Repair what the audit finds
        --reset           Remove automatically created clusters first
        --index DIR       Detect and embed faces below DIR first
    -h, --help            Print help

ENVIRONMENT:
    FACEKIT_LOG           Log filter (e.g. facekit=debug)"#
    );
}
