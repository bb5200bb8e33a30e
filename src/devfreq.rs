use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};

use crate::device::FrequencyControl;

fn read_value(path: &Path) -> Result<u64, IoError> {
    std::fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("{}: {e}", path.display())))
}

/// A devfreq node in sysfs, e.g. `/sys/class/devfreq/<gpu>`. Frequencies are
/// in Hz as the kernel reports them.
#[derive(Debug)]
pub struct SysfsDevfreq {
    dir: PathBuf,
    // ascending
    frequencies: Vec<u64>,
    max: u64,
    floor: u64,
}

impl SysfsDevfreq {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, IoError> {
        let dir = dir.into();
        let available = std::fs::read_to_string(dir.join("available_frequencies"))?;
        let mut frequencies = available
            .split_whitespace()
            .map(|f| f.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        frequencies.sort_unstable();
        frequencies.dedup();
        let lowest = *frequencies.first().ok_or(IoError::new(
            ErrorKind::InvalidData,
            "devfreq node lists no available frequencies",
        ))?;

        let max = read_value(&dir.join("max_freq"))
            .ok()
            .or_else(|| frequencies.last().copied())
            .unwrap_or(lowest);
        let floor = read_value(&dir.join("min_freq")).unwrap_or(lowest);

        Ok(Self {
            dir,
            frequencies,
            max,
            floor,
        })
    }

    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }

    pub fn frequencies(&self) -> &[u64] {
        &self.frequencies
    }
}

impl FrequencyControl for SysfsDevfreq {
    fn max_frequency(&self) -> u64 {
        self.max
    }

    fn lowest_frequency(&self) -> u64 {
        self.frequencies[0]
    }

    fn min_frequency(&self) -> u64 {
        self.floor
    }

    fn set_min_frequency(&mut self, freq: u64) {
        self.floor = freq;
    }

    fn reevaluate(&mut self) -> Result<(), IoError> {
        // devfreq re-runs its governor when min_freq is written
        std::fs::write(self.dir.join("min_freq"), format!("{}\n", self.floor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(available: &str, max: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("available_frequencies"), available).unwrap();
        std::fs::write(dir.path().join("min_freq"), "257000000\n").unwrap();
        if let Some(max) = max {
            std::fs::write(dir.path().join("max_freq"), max).unwrap();
        }
        dir
    }

    #[test]
    fn test_open_reads_frequency_table() {
        let dir = node("710000000 585000000 257000000 414000000\n", Some("585000000\n"));
        let devfreq = SysfsDevfreq::open(dir.path()).unwrap();

        assert_eq!(
            devfreq.frequencies(),
            &[257000000, 414000000, 585000000, 710000000]
        );
        assert_eq!(devfreq.lowest_frequency(), 257000000);
        assert_eq!(devfreq.max_frequency(), 585000000);
        assert_eq!(devfreq.min_frequency(), 257000000);
    }

    #[test]
    fn test_max_falls_back_to_table() {
        let dir = node("257000000 710000000", None);
        let devfreq = SysfsDevfreq::open(dir.path()).unwrap();
        assert_eq!(devfreq.max_frequency(), 710000000);
    }

    #[test]
    fn test_reevaluate_writes_min_freq() {
        let dir = node("257000000 710000000", None);
        let mut devfreq = SysfsDevfreq::open(dir.path()).unwrap();

        devfreq.set_min_frequency(710000000);
        devfreq.reevaluate().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("min_freq")).unwrap(),
            "710000000\n"
        );
    }

    #[test]
    fn test_empty_table_is_rejected() {
        let dir = node("\n", None);
        let err = SysfsDevfreq::open(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
