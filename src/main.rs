use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use gpu_boost::amdgpu::{self, CyanSkillfish};
use gpu_boost::config::{BoostConfig, DaemonConfig, DeviceKind, LoadSourceKind};
use gpu_boost::constants::*;
use gpu_boost::control::ControlServer;
use gpu_boost::controller::BoostController;
use gpu_boost::devfreq::SysfsDevfreq;
use gpu_boost::device::{Floor, TargetDevice};
use gpu_boost::input::{EvdevInput, InputDelivery, NoInput};
use gpu_boost::load_sampler::{BusyPercentSource, GrbmLoadSource, LoadSampler, LoadSource};
use gpu_boost::workqueue::WorkQueue;

/// Raise the GPU clock floor for a short while on touch input or
/// sustained load.
#[derive(Debug, Parser)]
struct Opts {
    /// Configuration file. Defaults to ~/.config/gpu-boost/config.toml, then
    /// /etc/gpu-boost/config.toml.
    config: Option<PathBuf>,

    /// Enable verbose output. Specify twice for trace.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn config_path(opts: &Opts) -> Option<PathBuf> {
    if let Some(path) = &opts.config {
        return Some(path.clone());
    }
    let user = dirs::config_dir().map(|d| d.join("gpu-boost").join("config.toml"));
    [user, Some(PathBuf::from(DEFAULT_CONFIG_PATH))]
        .into_iter()
        .flatten()
        .find(|p| p.exists())
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn open_target(config: &DaemonConfig) -> Result<TargetDevice> {
    match config.device_kind {
        DeviceKind::Devfreq => {
            let path = config
                .device_path
                .as_deref()
                .context("device.path is not set")?;
            let devfreq = SysfsDevfreq::open(path)
                .with_context(|| format!("failed to open devfreq node {}", path.display()))?;
            info!(
                "{}: {} frequency steps, {}..{}",
                devfreq.name(),
                devfreq.frequencies().len(),
                devfreq.frequencies().first().unwrap_or(&0),
                devfreq.frequencies().last().unwrap_or(&0),
            );
            Ok(TargetDevice::new(devfreq.name(), devfreq))
        }
        DeviceKind::Amdgpu => {
            let dev_handle = amdgpu::open_device().context("failed to open the GPU")?;
            let gpu = CyanSkillfish::new(&dev_handle, config.safe_points.clone())
                .context("failed to set up pp_od_clk_voltage")?;
            Ok(TargetDevice::new("cyan-skillfish", gpu))
        }
    }
}

fn open_load_source(config: &DaemonConfig) -> Result<Box<dyn LoadSource>> {
    match config.load_source {
        LoadSourceKind::Grbm => {
            let dev_handle = amdgpu::open_device().context("failed to open the GPU")?;
            Ok(Box::new(GrbmLoadSource::new(dev_handle)))
        }
        LoadSourceKind::BusyPercent => {
            let path = config
                .busy_path
                .as_deref()
                .context("sampling.path is not set")?;
            Ok(Box::new(BusyPercentSource::new(path)))
        }
    }
}

fn reload(path: &Path, boost_config: &BoostConfig) {
    match DaemonConfig::load(Some(path)) {
        Ok(config) if config.boost != boost_config.settings() => {
            boost_config.apply(&config.boost);
            info!("reloaded {}: {:?}", path.display(), config.boost);
        }
        Ok(_) => {}
        Err(e) => warn!("failed to reload {}: {e}", path.display()),
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let path = config_path(&opts);
    let config = DaemonConfig::load(path.as_deref()).with_context(|| match &path {
        Some(path) => format!("failed to load {}", path.display()),
        None => "invalid built-in configuration".to_string(),
    })?;
    match &path {
        Some(path) => info!("using {}", path.display()),
        None => info!("no configuration file found, using defaults"),
    }

    let boost_config = Arc::new(BoostConfig::new(&config.boost));
    if !boost_config.is_configured() {
        warn!("boost frequency or duration is 0, boosting stays off until both are set");
    }
    let device = Arc::new(open_target(&config)?);
    let input: Arc<dyn InputDelivery> = if config.input_enabled {
        Arc::new(EvdevInput::new(INPUT_DIR))
    } else {
        Arc::new(NoInput)
    };
    let queue = Arc::new(WorkQueue::new("gpu-boost-wq").context("failed to spawn work queue")?);
    let controller = Arc::new(BoostController::new(boost_config.clone(), queue, input));
    controller.start(device.clone());

    let running = Arc::new(AtomicBool::new(true));
    ctrlc::set_handler({
        let running = running.clone();
        move || running.store(false, Ordering::Relaxed)
    })
    .context("Error setting Ctrl-C handler")?;

    let sampler = match open_load_source(&config) {
        Ok(source) => {
            let sampler = LoadSampler::new(
                source,
                Duration::from_micros(config.sample_interval),
                config.window_samples,
            );
            let (controller, running) = (controller.clone(), running.clone());
            Some(
                std::thread::Builder::new()
                    .name("gpu-boost-load".to_string())
                    .spawn(move || sampler.run(&controller, &running))?,
            )
        }
        Err(e) => {
            warn!("load sampling unavailable: {e:#}");
            None
        }
    };

    let server = ControlServer::new(&config.control_fifo, &config.status_path);
    // blocks on the FIFO, so it is not joined on exit
    std::thread::Builder::new()
        .name("gpu-boost-control".to_string())
        .spawn({
            let (controller, device, running) = (controller.clone(), device.clone(), running.clone());
            move || {
                if let Err(e) = server.serve(&controller, &device, &running) {
                    error!("control interface stopped: {e}");
                }
            }
        })?;

    let mut last_modified = path.as_deref().and_then(modified);
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(CONFIG_POLL_INTERVAL_MS));
        let Some(path) = path.as_deref() else {
            continue;
        };
        let current = modified(path);
        if current != last_modified {
            last_modified = current;
            reload(path, &boost_config);
        }
    }

    info!("shutting down");
    if let Some(sampler) = sampler {
        if sampler.join().is_err() {
            error!("load sampler panicked");
        }
    }
    controller.stop();
    let floor = device.apply_floor(Floor::Lowest);
    device
        .lock()
        .flush()
        .with_context(|| format!("failed to restore clock floor {floor}"))?;
    Ok(())
}
