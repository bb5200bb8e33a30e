use std::io::{Error as IoError, ErrorKind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use libdrm_amdgpu_sys::AMDGPU::DeviceHandle;
use log::{debug, warn};

use crate::controller::BoostController;

// cyan_skillfish.gfx1013.mmGRBM_STATUS
const GRBM_STATUS_REG: u32 = 0x2004;
// cyan_skillfish.gfx1013.mmGRBM_STATUS.GUI_ACTIVE (bit 31)
const GUI_ACTIVE_BIT_MASK: u32 = 1 << 31;

/// Busy time out of total time, in whatever unit the source counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSample {
    pub busy: u64,
    pub total: u64,
}

pub trait LoadSource: Send {
    fn sample(&mut self) -> Result<LoadSample, IoError>;
}

impl<S: LoadSource + ?Sized> LoadSource for Box<S> {
    fn sample(&mut self) -> Result<LoadSample, IoError> {
        (**self).sample()
    }
}

/// One register read per sample: busy or idle.
pub struct GrbmLoadSource {
    dev_handle: DeviceHandle,
}

impl GrbmLoadSource {
    pub fn new(dev_handle: DeviceHandle) -> Self {
        Self { dev_handle }
    }
}

impl LoadSource for GrbmLoadSource {
    fn sample(&mut self) -> Result<LoadSample, IoError> {
        let status = self
            .dev_handle
            .read_mm_registers(GRBM_STATUS_REG)
            .map_err(IoError::from_raw_os_error)?;
        Ok(LoadSample {
            busy: u64::from(status & GUI_ACTIVE_BIT_MASK != 0),
            total: 1,
        })
    }
}

/// amdgpu's `gpu_busy_percent` sysfs attribute.
pub struct BusyPercentSource {
    path: PathBuf,
}

impl BusyPercentSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LoadSource for BusyPercentSource {
    fn sample(&mut self) -> Result<LoadSample, IoError> {
        let percent: u64 = std::fs::read_to_string(&self.path)?
            .trim()
            .parse()
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        Ok(LoadSample {
            busy: percent.min(100),
            total: 100,
        })
    }
}

/// Sums samples until the window is full, then hands the total out.
pub struct LoadWindow {
    sum: LoadSample,
    count: u32,
    capacity: u32,
}

impl LoadWindow {
    pub fn new(capacity: u32) -> Self {
        Self {
            sum: LoadSample::default(),
            count: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn add_sample(&mut self, sample: LoadSample) -> Option<LoadSample> {
        self.sum.busy = self.sum.busy.saturating_add(sample.busy);
        self.sum.total = self.sum.total.saturating_add(sample.total);
        self.count += 1;
        if self.count < self.capacity {
            return None;
        }
        self.count = 0;
        Some(std::mem::take(&mut self.sum))
    }
}

/// Rate limit for repeated errors
struct LogThrottle {
    last_log: Option<Instant>,
    min_interval: Duration,
}

impl LogThrottle {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_log: None,
            min_interval,
        }
    }

    fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last_log {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_log = Some(now);
                true
            }
        }
    }
}

/// Periodic load sampling feeding [`BoostController::notify_load_sample`].
pub struct LoadSampler<S> {
    source: S,
    window: LoadWindow,
    interval: Duration,
    boosts: u64,
}

impl<S: LoadSource> LoadSampler<S> {
    pub fn new(source: S, interval: Duration, window_samples: u32) -> Self {
        Self {
            source,
            window: LoadWindow::new(window_samples),
            interval,
            boosts: 0,
        }
    }

    /// Take one sample. Returns whether a full window triggered a boost.
    pub fn tick(&mut self, controller: &BoostController) -> Result<bool, IoError> {
        let sample = self.source.sample()?;
        let Some(window) = self.window.add_sample(sample) else {
            return Ok(false);
        };
        let boosted = controller.notify_load_sample(window.busy, window.total);
        if boosted {
            self.boosts += 1;
        }
        Ok(boosted)
    }

    /// Load boosts requested so far
    pub fn boosts(&self) -> u64 {
        self.boosts
    }

    pub fn run(mut self, controller: &BoostController, running: &AtomicBool) {
        let mut throttle = LogThrottle::new(Duration::from_secs(60));
        debug!("load sampling every {:?}", self.interval);

        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.tick(controller) {
                if throttle.should_log() {
                    warn!("failed to sample GPU load: {e}");
                }
            }
            std::thread::sleep(self.interval);
        }
        debug!("load sampler stopped after {} boosts", self.boosts);
    }
}
