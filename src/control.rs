use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Error as IoError, ErrorKind, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use nix::sys::stat::Mode;

use crate::controller::{BoostController, BoostStatus};
use crate::device::TargetDevice;

/// One line on the control FIFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Kick,
    KickMax,
    Suspend,
    Resume,
    Set { name: String, value: String },
    Status,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["kick"] => Ok(Self::Kick),
            ["kick-max"] => Ok(Self::KickMax),
            ["suspend"] => Ok(Self::Suspend),
            ["resume"] => Ok(Self::Resume),
            ["status"] => Ok(Self::Status),
            ["set", name, value] => Ok(Self::Set {
                name: name.to_string(),
                value: value.to_string(),
            }),
            ["set", ..] => Err("usage: set <name> <value>".to_string()),
            [] => Err("empty command".to_string()),
            [other, ..] => Err(format!("unknown command '{other}'")),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kick => f.write_str("kick"),
            Self::KickMax => f.write_str("kick-max"),
            Self::Suspend => f.write_str("suspend"),
            Self::Resume => f.write_str("resume"),
            Self::Set { name, value } => write!(f, "set {name} {value}"),
            Self::Status => f.write_str("status"),
        }
    }
}

/// Operator commands read from a named pipe.
pub struct ControlServer {
    fifo: PathBuf,
    status_path: PathBuf,
}

impl ControlServer {
    pub fn new(fifo: impl Into<PathBuf>, status_path: impl Into<PathBuf>) -> Self {
        Self {
            fifo: fifo.into(),
            status_path: status_path.into(),
        }
    }

    pub fn execute(
        &self,
        command: &Command,
        controller: &BoostController,
        device: &TargetDevice,
    ) -> Result<(), IoError> {
        match command {
            Command::Kick => {
                controller.request_boost();
            }
            Command::KickMax => {
                controller.request_boost_to_max();
            }
            Command::Suspend => device.set_suspended(true),
            Command::Resume => device.set_suspended(false),
            Command::Set { name, value } => {
                controller
                    .config()
                    .set_param(name, value)
                    .map_err(|e| IoError::new(ErrorKind::InvalidInput, e))?;
                info!("{name} set to {value}");
            }
            Command::Status => self.write_status(&controller.status())?,
        }
        Ok(())
    }

    /// Replace the status file with a JSON snapshot.
    pub fn write_status(&self, status: &BoostStatus) -> Result<(), IoError> {
        if let Some(parent) = self.status_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // write through a temporary file so readers never see half a snapshot
        let temp_path = self.status_path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        serde_json::to_writer_pretty(&mut file, status)?;
        file.write_all(b"\n")?;
        file.flush()?;
        fs::rename(&temp_path, &self.status_path)
    }

    fn create_fifo(&self) -> Result<(), IoError> {
        if self.fifo.exists() {
            // only a FIFO blocks until a writer shows up
            if !fs::metadata(&self.fifo)?.file_type().is_fifo() {
                return Err(IoError::new(
                    ErrorKind::InvalidInput,
                    format!("{} exists and is not a FIFO", self.fifo.display()),
                ));
            }
            return Ok(());
        }
        if let Some(parent) = self.fifo.parent() {
            fs::create_dir_all(parent)?;
        }
        nix::unistd::mkfifo(&self.fifo, Mode::S_IRUSR | Mode::S_IWUSR)?;
        Ok(())
    }

    /// Read commands until `running` is cleared. The flag is checked each
    /// time a writer closes the pipe.
    pub fn serve(
        &self,
        controller: &BoostController,
        device: &TargetDevice,
        running: &AtomicBool,
    ) -> Result<(), IoError> {
        self.create_fifo()?;
        info!("listening for commands on {}", self.fifo.display());

        while running.load(Ordering::Relaxed) {
            // blocks until a writer shows up
            let reader = BufReader::new(File::open(&self.fifo)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                self.handle_line(&line, controller, device);
            }
        }
        Ok(())
    }

    fn handle_line(&self, line: &str, controller: &BoostController, device: &TargetDevice) {
        match line.parse::<Command>() {
            Ok(command) => {
                debug!("control: {command}");
                if let Err(e) = self.execute(&command, controller, device) {
                    warn!("control command '{command}' failed: {e}");
                }
            }
            Err(e) => warn!("control: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoostConfig, BoostMode, BoostSettings};
    use crate::device::mock::RecordingControl;
    use crate::input::NoInput;
    use crate::workqueue::VirtualQueue;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct Rig {
        queue: Arc<VirtualQueue>,
        control: RecordingControl,
        device: Arc<TargetDevice>,
        controller: BoostController,
    }

    fn rig() -> Rig {
        let queue = Arc::new(VirtualQueue::new());
        let control = RecordingControl::new(100, 900);
        let device = Arc::new(TargetDevice::new("gpu", control.clone()));
        let controller = BoostController::new(
            Arc::new(BoostConfig::new(&BoostSettings {
                mode: BoostMode::InputTriggered,
                load_threshold: 0,
                boost_freq: 500,
                boost_duration_ms: 100,
            })),
            queue.clone(),
            Arc::new(NoInput),
        );
        controller.start(device.clone());
        Rig {
            queue,
            control,
            device,
            controller,
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("kick".parse::<Command>(), Ok(Command::Kick));
        assert_eq!("  kick-max \n".parse::<Command>(), Ok(Command::KickMax));
        assert_eq!(
            "set boost_freq 600".parse::<Command>(),
            Ok(Command::Set {
                name: "boost_freq".into(),
                value: "600".into()
            })
        );
        assert!("set boost_freq".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
        assert!("reboot".parse::<Command>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        let command = Command::Set {
            name: "boost_mode".into(),
            value: "2".into(),
        };
        assert_eq!(command.to_string().parse::<Command>(), Ok(command));
    }

    #[test]
    fn test_kick_max_and_suspend() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let server = ControlServer::new(dir.path().join("ctl"), dir.path().join("status.json"));

        server
            .execute(&Command::Suspend, &rig.controller, &rig.device)
            .unwrap();
        server
            .execute(&Command::KickMax, &rig.controller, &rig.device)
            .unwrap();
        rig.queue.run_pending();
        assert!(rig.control.writes().is_empty());

        server
            .execute(&Command::Resume, &rig.controller, &rig.device)
            .unwrap();
        server
            .execute(&Command::KickMax, &rig.controller, &rig.device)
            .unwrap();
        rig.queue.run_pending();
        assert_eq!(rig.control.floor(), 900);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let server = ControlServer::new(dir.path().join("ctl"), dir.path().join("status.json"));

        let set = |name: &str, value: &str| {
            server.execute(
                &Command::Set {
                    name: name.into(),
                    value: value.into(),
                },
                &rig.controller,
                &rig.device,
            )
        };
        set("boost_freq", "650").unwrap();
        assert_eq!(
            set("boost_freq", "lots").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(rig.controller.config().boost_freq(), 650);
    }

    #[test]
    fn test_status_snapshot_is_json() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("run").join("status.json");
        let server = ControlServer::new(dir.path().join("ctl"), &status_path);

        rig.controller.request_boost();
        rig.queue.run_pending();
        server
            .execute(&Command::Status, &rig.controller, &rig.device)
            .unwrap();

        let status: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&status_path).unwrap()).unwrap();
        assert_eq!(status["mode"], "input-triggered");
        assert_eq!(status["active"], true);
        assert_eq!(status["min_frequency"], 500);
    }

    #[test]
    fn test_serve_refuses_regular_file() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("ctl");
        let status_path = dir.path().join("status.json");
        fs::write(&fifo, "status\n").unwrap();
        let server = ControlServer::new(&fifo, &status_path);

        let running = AtomicBool::new(true);
        let err = server
            .serve(&rig.controller, &rig.device, &running)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        // the stale command was never executed
        assert!(!status_path.exists());
    }

    #[test]
    fn test_serve_reads_fifo() {
        let rig = Arc::new(rig());
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("ctl");
        let status_path = dir.path().join("status.json");
        let server = Arc::new(ControlServer::new(&fifo, &status_path));
        let running = Arc::new(AtomicBool::new(true));

        let serving = std::thread::spawn({
            let (rig, server, running) = (rig.clone(), server.clone(), running.clone());
            move || server.serve(&rig.controller, &rig.device, &running)
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !fifo.exists() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        fs::write(&fifo, "set boost_freq 650\nbogus\nstatus\n").unwrap();
        while !status_path.exists() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(rig.controller.config().boost_freq(), 650);

        running.store(false, Ordering::Relaxed);
        fs::write(&fifo, "kick\n").unwrap();
        serving.join().unwrap().unwrap();
        assert!(rig.controller.session_state().active);
    }
}
