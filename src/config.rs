use std::collections::BTreeMap;
use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use log::warn;
use serde::Serialize;
use thiserror::Error;
use toml::Table;

use crate::constants::*;

/// Which trigger source is honoured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoostMode {
    #[default]
    Disabled = 0,
    InputTriggered = 1,
    LoadTriggered = 2,
}

impl BoostMode {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Disabled),
            1 => Some(Self::InputTriggered),
            2 => Some(Self::LoadTriggered),
            _ => None,
        }
    }
}

impl FromStr for BoostMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" | "disabled" => Ok(Self::Disabled),
            "1" | "input" | "input-triggered" => Ok(Self::InputTriggered),
            "2" | "load" | "load-triggered" => Ok(Self::LoadTriggered),
            other => Err(format!("unknown boost mode '{other}'")),
        }
    }
}

impl fmt::Display for BoostMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::InputTriggered => "input",
            Self::LoadTriggered => "load",
        })
    }
}

/// Rejected write to a boost parameter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("unknown parameter '{0}'")]
    Unknown(String),
    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: &'static str, value: String },
}

pub const PARAM_NAMES: [&str; 4] = ["boost_mode", "load_threshold", "boost_freq", "boost_duration"];

/// Boost parameters, read on every trigger so writes apply to the next event.
#[derive(Debug, Default)]
pub struct BoostConfig {
    mode: AtomicU8,
    load_threshold: AtomicU32,
    boost_freq: AtomicU64,
    // ms
    boost_duration: AtomicU64,
}

impl BoostConfig {
    pub fn new(settings: &BoostSettings) -> Self {
        let config = Self::default();
        config.apply(settings);
        config
    }

    pub fn apply(&self, settings: &BoostSettings) {
        self.set_mode(settings.mode);
        self.set_load_threshold(settings.load_threshold);
        self.set_boost_freq(settings.boost_freq);
        self.set_boost_duration_ms(settings.boost_duration_ms);
    }

    pub fn mode(&self) -> BoostMode {
        BoostMode::from_u8(self.mode.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn set_mode(&self, mode: BoostMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn load_threshold(&self) -> u32 {
        self.load_threshold.load(Ordering::Relaxed)
    }

    pub fn set_load_threshold(&self, percent: u32) {
        self.load_threshold.store(percent, Ordering::Relaxed);
    }

    pub fn boost_freq(&self) -> u64 {
        self.boost_freq.load(Ordering::Relaxed)
    }

    pub fn set_boost_freq(&self, freq: u64) {
        self.boost_freq.store(freq, Ordering::Relaxed);
    }

    pub fn boost_duration(&self) -> Duration {
        Duration::from_millis(self.boost_duration.load(Ordering::Relaxed))
    }

    pub fn set_boost_duration_ms(&self, ms: u64) {
        self.boost_duration.store(ms, Ordering::Relaxed);
    }

    /// A boost needs both a frequency and a duration.
    pub fn is_configured(&self) -> bool {
        self.boost_freq() != 0 && !self.boost_duration().is_zero()
    }

    pub fn settings(&self) -> BoostSettings {
        BoostSettings {
            mode: self.mode(),
            load_threshold: self.load_threshold(),
            boost_freq: self.boost_freq(),
            boost_duration_ms: self.boost_duration.load(Ordering::Relaxed),
        }
    }

    /// Write a parameter by name. Nothing changes on error.
    pub fn set_param(&self, name: &str, value: &str) -> Result<(), ParamError> {
        let invalid = |name| ParamError::InvalidValue {
            name,
            value: value.to_string(),
        };
        match name {
            "boost_mode" => self.set_mode(value.parse().map_err(|_| invalid("boost_mode"))?),
            "load_threshold" => self.set_load_threshold(
                value
                    .trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|percent| *percent <= 100)
                    .ok_or_else(|| invalid("load_threshold"))?,
            ),
            "boost_freq" => {
                self.set_boost_freq(value.trim().parse().map_err(|_| invalid("boost_freq"))?)
            }
            "boost_duration" => self.set_boost_duration_ms(
                value
                    .trim()
                    .parse()
                    .map_err(|_| invalid("boost_duration"))?,
            ),
            other => return Err(ParamError::Unknown(other.to_string())),
        }
        Ok(())
    }

    pub fn get_param(&self, name: &str) -> Option<String> {
        Some(match name {
            "boost_mode" => (self.mode() as u8).to_string(),
            "load_threshold" => self.load_threshold().to_string(),
            "boost_freq" => self.boost_freq().to_string(),
            "boost_duration" => self.boost_duration().as_millis().to_string(),
            _ => return None,
        })
    }
}

/// Plain copy of the boost parameters. All zero means boosting is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoostSettings {
    pub mode: BoostMode,
    // percent
    pub load_threshold: u32,
    // device units: Hz for devfreq, MHz for amdgpu
    pub boost_freq: u64,
    pub boost_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Devfreq,
    Amdgpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSourceKind {
    Grbm,
    BusyPercent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub boost: BoostSettings,
    pub device_kind: DeviceKind,
    /// devfreq sysfs node, or the sysfs dir holding gpu_busy_percent
    pub device_path: Option<PathBuf>,
    // us
    pub sample_interval: u64,
    pub window_samples: u32,
    pub load_source: LoadSourceKind,
    /// gpu_busy_percent attribute for the busy-percent source
    pub busy_path: Option<PathBuf>,
    pub input_enabled: bool,
    pub control_fifo: PathBuf,
    pub status_path: PathBuf,
    // MHz, mV
    pub safe_points: BTreeMap<u64, u16>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            boost: BoostSettings::default(),
            device_kind: DeviceKind::Amdgpu,
            device_path: None,
            sample_interval: DEFAULT_SAMPLE_INTERVAL_US,
            window_samples: DEFAULT_WINDOW_SAMPLES,
            load_source: LoadSourceKind::Grbm,
            busy_path: None,
            input_enabled: true,
            control_fifo: PathBuf::from(DEFAULT_CONTROL_FIFO),
            status_path: PathBuf::from(DEFAULT_STATUS_PATH),
            safe_points: default_safe_points(),
        }
    }
}

fn default_safe_points() -> BTreeMap<u64, u16> {
    BTreeMap::from([(350, 700), (2000, 1000)])
}

fn section<'a>(config: &'a Table, name: &str) -> Option<&'a Table> {
    config.get(name).and_then(|t| t.as_table())
}

fn unsigned(table: Option<&Table>, key: &str) -> Result<u64, &'static str> {
    table
        .and_then(|t| t.get(key))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
        .and_then(|v| u64::try_from(v).map_err(|_| "must not be negative"))
}

fn string<'a>(table: Option<&'a Table>, key: &str) -> Result<&'a str, &'static str> {
    table
        .and_then(|t| t.get(key))
        .ok_or("is missing")
        .and_then(|v| v.as_str().ok_or("must be a string"))
}

impl DaemonConfig {
    /// Read `path`, or fall back to defaults when there is no file.
    pub fn load(path: Option<&Path>) -> Result<Self, IoError> {
        let text = match path {
            Some(path) => std::fs::read_to_string(path)?,
            None => String::new(),
        };
        text.parse::<Table>()
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            .and_then(|table| Self::from_table(&table))
    }

    pub fn from_table(config: &Table) -> Result<Self, IoError> {
        let defaults = Self::default();

        let boost = section(config, "boost");
        let mode = boost
            .and_then(|t| t.get("mode"))
            .ok_or_else(|| "is missing".to_string())
            .and_then(|v| match v {
                toml::Value::Integer(i) => i.to_string().parse(),
                toml::Value::String(s) => s.parse(),
                _ => Err("must be an integer or a string".to_string()),
            })
            .unwrap_or_else(|s| {
                warn!("boost.mode {s}, replaced with the default of disabled");
                BoostMode::Disabled
            });
        // device units
        let boost_freq = unsigned(boost, "frequency").unwrap_or_else(|s| {
            warn!("boost.frequency {s}, replaced with the default of 0 (no boost)");
            0
        });
        // ms
        let boost_duration_ms = unsigned(boost, "duration-ms").unwrap_or_else(|s| {
            warn!("boost.duration-ms {s}, replaced with the default of 0 (no boost)");
            0
        });
        // percentage (0-100)
        let load_threshold = unsigned(boost, "load-threshold")
            .and_then(|v| (v <= 100).then_some(v as u32).ok_or("must be between 0 and 100"))
            .unwrap_or_else(|s| {
                warn!("boost.load-threshold {s}, replaced with the default of 0 (disabled)");
                0
            });

        let device = section(config, "device");
        let device_kind = match string(device, "kind") {
            Ok("devfreq") => DeviceKind::Devfreq,
            Ok("amdgpu") => DeviceKind::Amdgpu,
            Ok(other) => {
                return Err(IoError::new(
                    ErrorKind::InvalidInput,
                    format!("device.kind must be \"devfreq\" or \"amdgpu\", not \"{other}\""),
                ));
            }
            Err(_) => defaults.device_kind,
        };
        let device_path = string(device, "path").ok().map(PathBuf::from);
        if device_kind == DeviceKind::Devfreq && device_path.is_none() {
            Err(IoError::new(
                ErrorKind::InvalidInput,
                "device.path must point to a devfreq node when device.kind = \"devfreq\"",
            ))?;
        }

        let sampling = section(config, "sampling");
        // us
        let sample_interval = unsigned(sampling, "interval-us")
            .and_then(|v| (v > 0).then_some(v).ok_or("must be positive"))
            .unwrap_or_else(|s| {
                warn!(
                    "sampling.interval-us {s}, replaced with the default value of {} us",
                    DEFAULT_SAMPLE_INTERVAL_US
                );
                DEFAULT_SAMPLE_INTERVAL_US
            });
        // samples
        let window_samples = unsigned(sampling, "window-samples")
            .and_then(|v| (v > 0).then_some(v).ok_or("must be positive"))
            .and_then(|v| u32::try_from(v).map_err(|_| "is too large"))
            .unwrap_or_else(|s| {
                warn!(
                    "sampling.window-samples {s}, replaced with the default of {} samples",
                    DEFAULT_WINDOW_SAMPLES
                );
                DEFAULT_WINDOW_SAMPLES
            });
        let load_source = match string(sampling, "source") {
            Ok("grbm") => LoadSourceKind::Grbm,
            Ok("busy-percent") => LoadSourceKind::BusyPercent,
            Ok(other) => {
                warn!("sampling.source \"{other}\" is unknown, using grbm");
                LoadSourceKind::Grbm
            }
            Err(_) if device_kind == DeviceKind::Devfreq => LoadSourceKind::BusyPercent,
            Err(_) => LoadSourceKind::Grbm,
        };
        let busy_path = string(sampling, "path")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                device_path
                    .as_ref()
                    .map(|p| p.join("device").join("gpu_busy_percent"))
            });

        let input_enabled = section(config, "input")
            .and_then(|t| t.get("enabled"))
            .map(|v| {
                v.as_bool().unwrap_or_else(|| {
                    warn!("input.enabled must be a boolean, keeping input boost enabled");
                    true
                })
            })
            .unwrap_or(true);

        let control = section(config, "control");
        let control_fifo = string(control, "fifo")
            .map(PathBuf::from)
            .unwrap_or(defaults.control_fifo);
        let status_path = string(control, "status")
            .map(PathBuf::from)
            .unwrap_or(defaults.status_path);

        let safe_points = match config.get("safe-points") {
            Some(array) => parse_safe_points(array)?,
            None => defaults.safe_points,
        };

        Ok(Self {
            boost: BoostSettings {
                mode,
                load_threshold,
                boost_freq,
                boost_duration_ms,
            },
            device_kind,
            device_path,
            sample_interval,
            window_samples,
            load_source,
            busy_path,
            input_enabled,
            control_fifo,
            status_path,
            safe_points,
        })
    }
}

fn parse_safe_points(array: &toml::Value) -> Result<BTreeMap<u64, u16>, IoError> {
    let invalid = |msg: String| IoError::new(ErrorKind::InvalidInput, msg);

    let array = array
        .as_array()
        .ok_or_else(|| invalid("safe-points must be an array".into()))?;
    if array.is_empty() {
        Err(invalid("safe-points must not be empty".into()))?;
    }
    let mut safe_points = BTreeMap::new();
    for (i, t) in array.iter().enumerate() {
        let t = t
            .as_table()
            .ok_or_else(|| invalid(format!("safe-points[{i}] must be a table")))?;
        let field = |name: &str| {
            let value = t
                .get(name)
                .ok_or_else(|| invalid(format!("safe-points[{i}].{name} must exist")))?
                .as_integer()
                .ok_or_else(|| invalid(format!("safe-points[{i}].{name} must be an integer")))?;
            u16::try_from(value).map_err(|_| {
                invalid(format!(
                    "safe-points[{i}].{name} must be between 0 and {} inclusive",
                    u16::MAX
                ))
            })
        };
        // MHz
        let frequency = field("frequency")?;
        // mV
        let voltage = field("voltage")?;

        if safe_points.insert(u64::from(frequency), voltage).is_some() {
            Err(invalid(format!(
                "multiple supposedly safe voltages for {frequency} MHz"
            )))?;
        }
    }
    // voltage must not drop as frequency rises
    let mut highest = (0, 0);
    for (&frequency, &voltage) in &safe_points {
        if voltage < highest.0 {
            Err(invalid(format!(
                "supposedly safe voltage {} mV for {} MHz is higher than \
                {voltage} mV for {frequency} MHz",
                highest.0, highest.1,
            )))?;
        }
        highest = (voltage, frequency);
    }
    Ok(safe_points)
}
