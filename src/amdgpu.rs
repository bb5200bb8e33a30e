use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, Write};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, PoisonError};

use libdrm_amdgpu_sys::{AMDGPU::DeviceHandle, PCI::BUS_INFO};
use log::{error, warn};

use crate::device::FrequencyControl;

fn location() -> BUS_INFO {
    BUS_INFO {
        domain: 0,
        bus: 1,
        dev: 0,
        func: 0,
    }
}

/// Open the Cyan Skillfish GPU at its fixed PCI location.
pub fn open_device() -> Result<DeviceHandle, IoError> {
    let location = location();
    let sysfs_path = location.get_sysfs_path();
    let vendor = std::fs::read_to_string(sysfs_path.join("vendor"))?;
    let device = std::fs::read_to_string(sysfs_path.join("device"))?;
    if !((vendor == "0x1002\n") && (device == "0x13fe\n")) {
        Err(IoError::other(
            "Cyan Skillfish GPU not found at expected PCI bus location",
        ))?;
    }
    let render_path = location
        .get_drm_render_path()
        .map_err(|e| IoError::other(format!("no DRM render node: {e:?}")))?;
    let card = File::open(render_path)?;
    let (dev_handle, _, _) =
        DeviceHandle::init(card.as_raw_fd()).map_err(IoError::from_raw_os_error)?;
    Ok(dev_handle)
}

/// Lowest safe voltage for `freq`
pub fn voltage_for(safe_points: &BTreeMap<u64, u16>, freq: u64) -> Result<u16, IoError> {
    safe_points
        .range(freq..)
        .next()
        .map(|(_, vol)| *vol)
        .ok_or(IoError::other(
            "tried to set a frequency beyond max safe point",
        ))
}

struct PpOdWriter {
    file: File,
    // MHz, mV
    safe_points: BTreeMap<u64, u16>,
}

impl PpOdWriter {
    fn write(&mut self, freq: u64) -> Result<(), IoError> {
        let vol = voltage_for(&self.safe_points, freq)?;
        self.file
            .write_all(format!("vc 0 {freq} {vol}").as_bytes())?;
        self.file.write_all("c".as_bytes())
    }
}

/// Clock floor of a Cyan Skillfish GPU, in MHz.
///
/// The floor is pinned through `pp_od_clk_voltage`. Writes happen on a
/// separate thread fed by a watch channel, so only the latest floor reaches
/// the hardware when several arrive in a row.
pub struct CyanSkillfish {
    lowest: u64,
    max: u64,
    floor: u64,
    send: watch::WatchSender<u64>,
    writer: Arc<Mutex<PpOdWriter>>,
}

impl CyanSkillfish {
    pub fn new(
        dev_handle: &DeviceHandle,
        safe_points: BTreeMap<u64, u16>,
    ) -> Result<Self, IoError> {
        let info = dev_handle
            .device_info()
            .map_err(IoError::from_raw_os_error)?;
        // given in kHz, we need MHz
        let min_engine_clock = info.min_engine_clock / 1000;
        let max_engine_clock = info.max_engine_clock / 1000;

        let (Some(&first), Some(&last)) = (safe_points.keys().next(), safe_points.keys().last())
        else {
            return Err(IoError::other("no safe points"));
        };
        let mut lowest = first;
        if lowest < min_engine_clock {
            warn!("GPU minimum frequency higher than lowest safe frequency, clamping");
            lowest = min_engine_clock;
        }
        let mut max = last;
        if max > max_engine_clock {
            warn!("GPU maximum frequency lower than highest safe frequency, clamping");
            max = max_engine_clock;
        }
        let max = max.max(lowest);

        let file = OpenOptions::new().write(true).open(
            dev_handle
                .get_sysfs_path()
                .map_err(IoError::from_raw_os_error)?
                .join("pp_od_clk_voltage"),
        )?;
        let writer = Arc::new(Mutex::new(PpOdWriter { file, safe_points }));
        let (send, mut recv) = watch::channel(lowest);

        std::thread::Builder::new()
            .name("gpu-boost-pp-od".to_string())
            .spawn({
                let writer = writer.clone();
                move || loop {
                    let freq = recv.wait();
                    let result = writer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .write(freq);
                    if let Err(e) = result {
                        error!("failed to set GPU clock to {freq} MHz: {e}");
                    }
                }
            })?;

        Ok(Self {
            lowest,
            max,
            floor: lowest,
            send,
            writer,
        })
    }
}

impl FrequencyControl for CyanSkillfish {
    fn max_frequency(&self) -> u64 {
        self.max
    }

    fn lowest_frequency(&self) -> u64 {
        self.lowest
    }

    fn min_frequency(&self) -> u64 {
        self.floor
    }

    fn set_min_frequency(&mut self, freq: u64) {
        self.floor = freq.clamp(self.lowest, self.max);
    }

    fn reevaluate(&mut self) -> Result<(), IoError> {
        self.send.send(self.floor);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IoError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(self.floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_lookup_rounds_up() {
        let safe_points = BTreeMap::from([(350, 700), (1200, 850), (2000, 1000)]);

        assert_eq!(voltage_for(&safe_points, 350).unwrap(), 700);
        assert_eq!(voltage_for(&safe_points, 500).unwrap(), 850);
        assert_eq!(voltage_for(&safe_points, 2000).unwrap(), 1000);
        assert!(voltage_for(&safe_points, 2050).is_err());
    }
}
