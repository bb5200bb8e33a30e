use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nix::fcntl::OFlag;

use gpu_boost::config::PARAM_NAMES;
use gpu_boost::constants::{DEFAULT_CONTROL_FIFO, DEFAULT_STATUS_PATH};
use gpu_boost::control::Command;

/// Send a command to a running gpu-boost daemon.
#[derive(Debug, Parser)]
struct Opts {
    /// Control FIFO of the daemon
    #[clap(long, default_value = DEFAULT_CONTROL_FIFO)]
    fifo: PathBuf,

    /// Status file written by the daemon
    #[clap(long, default_value = DEFAULT_STATUS_PATH)]
    status: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Boost to the configured frequency
    Kick,
    /// Boost to the highest frequency of the device
    KickMax,
    /// Stop writing clock floors until resumed
    Suspend,
    Resume,
    /// Change a boost parameter (boost_mode, load_threshold, boost_freq, boost_duration)
    Set { name: String, value: String },
    /// Print the daemon state as JSON
    Status,
}

impl From<Cmd> for Command {
    fn from(cmd: Cmd) -> Self {
        match cmd {
            Cmd::Kick => Command::Kick,
            Cmd::KickMax => Command::KickMax,
            Cmd::Suspend => Command::Suspend,
            Cmd::Resume => Command::Resume,
            Cmd::Set { name, value } => Command::Set { name, value },
            Cmd::Status => Command::Status,
        }
    }
}

fn send(fifo: &Path, command: &Command) -> Result<()> {
    // without a reader a non-blocking open fails with ENXIO instead of hanging
    let mut pipe = OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(fifo)
        .with_context(|| format!("cannot open {} (is gpu-boost running?)", fifo.display()))?;
    writeln!(pipe, "{command}").context("failed to send command")
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let command = Command::from(opts.command);

    if let Command::Set { name, .. } = &command {
        if !PARAM_NAMES.contains(&name.as_str()) {
            bail!(
                "unknown parameter '{name}', expected one of: {}",
                PARAM_NAMES.join(", ")
            );
        }
    }

    let before = modified(&opts.status);
    send(&opts.fifo, &command)?;
    if command != Command::Status {
        return Ok(());
    }

    let deadline = Instant::now() + Duration::from_secs(1);
    while modified(&opts.status) == before {
        if Instant::now() > deadline {
            bail!("daemon did not update {}", opts.status.display());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let status = std::fs::read_to_string(&opts.status)
        .with_context(|| format!("failed to read {}", opts.status.display()))?;
    print!("{status}");
    Ok(())
}
