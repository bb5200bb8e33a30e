// Public modules
pub mod amdgpu;
pub mod config;
pub mod control;
pub mod controller;
pub mod devfreq;
pub mod device;
pub mod input;
pub mod load_sampler;
pub mod workqueue;

// Re-export constants commonly used
pub mod constants {
    pub const DEFAULT_CONFIG_PATH: &str = "/etc/gpu-boost/config.toml";
    pub const DEFAULT_CONTROL_FIFO: &str = "/run/gpu-boost/control";
    pub const DEFAULT_STATUS_PATH: &str = "/run/gpu-boost/status.json";
    pub const INPUT_DIR: &str = "/dev/input";

    pub const DEFAULT_SAMPLE_INTERVAL_US: u64 = 2000;
    pub const DEFAULT_WINDOW_SAMPLES: u32 = 50;
    pub const CONFIG_POLL_INTERVAL_MS: u64 = 1000;
}
