use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

/// Frequency control of a GPU. Only reachable through the lock held by
/// [`TargetDevice`].
pub trait FrequencyControl: Send {
    fn max_frequency(&self) -> u64;
    fn lowest_frequency(&self) -> u64;
    /// Current floor
    fn min_frequency(&self) -> u64;
    fn set_min_frequency(&mut self, freq: u64);
    /// Make the hardware follow the current floor.
    fn reevaluate(&mut self) -> io::Result<()>;
    /// Block until the last reevaluation has reached the hardware.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Which floor to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Floor {
    Boost(u64),
    Max,
    Lowest,
}

/// The frequency-control handle of the GPU being boosted.
pub struct TargetDevice {
    name: String,
    control: Mutex<Box<dyn FrequencyControl>>,
    suspended: AtomicBool,
}

impl TargetDevice {
    pub fn new(name: impl Into<String>, control: impl FrequencyControl + 'static) -> Self {
        Self {
            name: name.into(),
            control: Mutex::new(Box::new(control)),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// Device mutation lock
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn FrequencyControl>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn min_frequency(&self) -> u64 {
        self.lock().min_frequency()
    }

    /// Set the floor and ask for a reevaluation under the device lock.
    /// Returns the floor the backend actually kept.
    pub fn apply_floor(&self, floor: Floor) -> u64 {
        let mut control = self.lock();
        let requested = match floor {
            Floor::Boost(freq) => freq,
            Floor::Max => control.max_frequency(),
            Floor::Lowest => control.lowest_frequency(),
        };
        control.set_min_frequency(requested);
        // backends may clamp
        let freq = control.min_frequency();
        if let Err(e) = control.reevaluate() {
            warn!("{}: failed to apply floor {freq}: {e}", self.name);
        } else {
            debug!("{}: floor set to {freq}", self.name);
        }
        freq
    }
}


#[cfg(test)]
mod tests {
    use super::mock::RecordingControl;
    use super::*;

    #[test]
    fn test_floor_resolution() {
        let control = RecordingControl::new(200, 900);
        let device = TargetDevice::new("gpu", control.clone());

        assert_eq!(device.apply_floor(Floor::Max), 900);
        assert_eq!(device.apply_floor(Floor::Boost(500)), 500);
        assert_eq!(device.apply_floor(Floor::Lowest), 200);
        assert_eq!(control.writes(), vec![900, 500, 200]);
        assert_eq!(device.min_frequency(), 200);
    }

    #[test]
    fn test_reevaluation_failure_keeps_bookkeeping() {
        let control = RecordingControl::new(200, 900);
        control.recorded.lock().unwrap().fail = true;
        let device = TargetDevice::new("gpu", control.clone());

        assert_eq!(device.apply_floor(Floor::Boost(500)), 500);
        assert_eq!(control.floor(), 500);
        assert!(control.writes().is_empty());
    }

    struct Clamping {
        floor: u64,
    }

    impl FrequencyControl for Clamping {
        fn max_frequency(&self) -> u64 {
            2000
        }

        fn lowest_frequency(&self) -> u64 {
            350
        }

        fn min_frequency(&self) -> u64 {
            self.floor
        }

        fn set_min_frequency(&mut self, freq: u64) {
            self.floor = freq.clamp(350, 2000);
        }

        fn reevaluate(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_floor_reports_clamped_value() {
        let device = TargetDevice::new("gpu", Clamping { floor: 350 });
        assert_eq!(device.apply_floor(Floor::Boost(3000)), 2000);
        assert_eq!(device.apply_floor(Floor::Boost(100)), 350);
        assert_eq!(device.min_frequency(), 350);
    }

    #[test]
    fn test_suspend_flag() {
        let device = TargetDevice::new("gpu", RecordingControl::new(200, 900));
        assert!(!device.is_suspended());
        device.set_suspended(true);
        assert!(device.is_suspended());
    }
}
