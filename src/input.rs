use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use evdev::{AbsoluteAxisType, EventType, Key};
use log::{debug, info, warn};

use crate::controller::InputHandle;

/// Kind of input device whose activity triggers a boost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputClass {
    /// Multi-touch screen
    Touchscreen,
    Touchpad,
    /// Anything reporting key events
    Keypad,
}

pub const BOOST_INPUT_CLASSES: &[InputClass] = &[
    InputClass::Touchscreen,
    InputClass::Touchpad,
    InputClass::Keypad,
];

/// What a device reports, as far as matching is concerned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub abs_events: bool,
    pub key_events: bool,
    pub mt_position: bool,
    pub abs_xy: bool,
    pub btn_touch: bool,
}

impl InputClass {
    pub fn matches(self, caps: &Capabilities) -> bool {
        match self {
            Self::Touchscreen => caps.abs_events && caps.mt_position,
            Self::Touchpad => caps.btn_touch && caps.abs_xy,
            Self::Keypad => caps.key_events,
        }
    }
}

/// First class of `filter` matching `caps`
pub fn classify(filter: &[InputClass], caps: &Capabilities) -> Option<InputClass> {
    filter.iter().copied().find(|class| class.matches(caps))
}

/// Delivers input activity to the boost controller.
pub trait InputDelivery: Send + Sync {
    /// Start reporting activity of devices matching `filter` to `handle`.
    /// Returns the number of devices attached.
    fn register(&self, filter: &[InputClass], handle: InputHandle) -> io::Result<usize>;

    fn unregister(&self);
}

/// No input boosting
pub struct NoInput;

impl InputDelivery for NoInput {
    fn register(&self, _filter: &[InputClass], _handle: InputHandle) -> io::Result<usize> {
        Ok(0)
    }

    fn unregister(&self) {}
}

/// evdev devices under an input directory, one reader thread each.
pub struct EvdevInput {
    dir: PathBuf,
    // cleared on unregister, reader threads exit on their next event
    attached: Mutex<Option<Arc<AtomicBool>>>,
}

impl EvdevInput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            attached: Mutex::new(None),
        }
    }

    /// Install a fresh attachment flag, detaching readers of an earlier
    /// registration.
    fn attach(&self) -> Arc<AtomicBool> {
        let attached = Arc::new(AtomicBool::new(true));
        let previous = self
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(attached.clone());
        if let Some(previous) = previous {
            previous.store(false, Ordering::Release);
        }
        attached
    }

    fn spawn_readers(
        &self,
        filter: &[InputClass],
        handle: &InputHandle,
        attached: &Arc<AtomicBool>,
    ) -> io::Result<usize> {
        let mut count = 0;

        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            let is_event_node = path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| name.starts_with("event"));
            if !is_event_node {
                continue;
            }
            let dev = match evdev::Device::open(&path) {
                Ok(dev) => dev,
                Err(e) => {
                    debug!("{}: skipped: {e}", path.display());
                    continue;
                }
            };
            let Some(class) = classify(filter, &capabilities(&dev)) else {
                continue;
            };

            info!(
                "boosting on {:?} input: {} ({})",
                class,
                dev.name().unwrap_or("unknown"),
                path.display()
            );
            let handle = handle.clone();
            let attached = attached.clone();
            thread::Builder::new()
                .name("gpu-boost-input".to_string())
                .spawn(move || read_events(dev, &path, handle, &attached))?;
            count += 1;
        }
        Ok(count)
    }
}

fn capabilities(dev: &evdev::Device) -> Capabilities {
    let events = dev.supported_events();
    let axes = dev.supported_absolute_axes();
    let has_axis = |axis| axes.is_some_and(|a| a.contains(axis));

    Capabilities {
        abs_events: events.contains(EventType::ABSOLUTE),
        key_events: events.contains(EventType::KEY),
        mt_position: has_axis(AbsoluteAxisType::ABS_MT_POSITION_X)
            && has_axis(AbsoluteAxisType::ABS_MT_POSITION_Y),
        abs_xy: has_axis(AbsoluteAxisType::ABS_X) && has_axis(AbsoluteAxisType::ABS_Y),
        btn_touch: dev
            .supported_keys()
            .is_some_and(|keys| keys.contains(Key::BTN_TOUCH)),
    }
}

fn read_events(mut dev: evdev::Device, path: &Path, handle: InputHandle, attached: &AtomicBool) {
    while attached.load(Ordering::Acquire) {
        let activity = match dev.fetch_events() {
            Ok(mut events) => events.any(|ev| {
                matches!(
                    ev.event_type(),
                    EventType::KEY | EventType::ABSOLUTE | EventType::RELATIVE
                )
            }),
            Err(e) => {
                warn!("{}: stopped reading input: {e}", path.display());
                return;
            }
        };
        if activity && attached.load(Ordering::Acquire) && !handle.event() {
            return;
        }
    }
    debug!("{}: input handle closed", path.display());
}

impl InputDelivery for EvdevInput {
    fn register(&self, filter: &[InputClass], handle: InputHandle) -> io::Result<usize> {
        let attached = self.attach();
        self.spawn_readers(filter, &handle, &attached)
            .inspect_err(|_| self.unregister())
    }

    fn unregister(&self) {
        let attached = self
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(attached) = attached {
            attached.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multitouch_screen_matches() {
        let caps = Capabilities {
            abs_events: true,
            mt_position: true,
            ..Capabilities::default()
        };
        assert_eq!(
            classify(BOOST_INPUT_CLASSES, &caps),
            Some(InputClass::Touchscreen)
        );
    }

    #[test]
    fn test_touchpad_needs_btn_touch_and_xy() {
        let mut caps = Capabilities {
            abs_events: true,
            abs_xy: true,
            ..Capabilities::default()
        };
        assert_eq!(classify(BOOST_INPUT_CLASSES, &caps), None);

        caps.btn_touch = true;
        assert_eq!(
            classify(BOOST_INPUT_CLASSES, &caps),
            Some(InputClass::Touchpad)
        );
    }

    #[test]
    fn test_keys_match_keypad() {
        let caps = Capabilities {
            key_events: true,
            ..Capabilities::default()
        };
        assert_eq!(
            classify(BOOST_INPUT_CLASSES, &caps),
            Some(InputClass::Keypad)
        );
        assert_eq!(classify(&[InputClass::Touchscreen], &caps), None);
    }

    #[test]
    fn test_failed_register_detaches_readers() {
        let dir = tempfile::tempdir().unwrap();
        let input = EvdevInput::new(dir.path().join("missing"));
        let earlier = input.attach();

        assert!(input.register(BOOST_INPUT_CLASSES, dead_handle()).is_err());
        assert!(!earlier.load(Ordering::Acquire));
        assert!(input.attached.lock().unwrap().is_none());
    }

    #[test]
    fn test_register_replaces_previous_readers() {
        let dir = tempfile::tempdir().unwrap();
        let input = EvdevInput::new(dir.path());

        assert_eq!(input.register(BOOST_INPUT_CLASSES, dead_handle()).unwrap(), 0);
        let first = input.attached.lock().unwrap().clone().unwrap();
        assert_eq!(input.register(BOOST_INPUT_CLASSES, dead_handle()).unwrap(), 0);
        let second = input.attached.lock().unwrap().clone().unwrap();
        assert!(!first.load(Ordering::Acquire));
        assert!(second.load(Ordering::Acquire));

        input.unregister();
        assert!(!second.load(Ordering::Acquire));
    }

    #[test]
    fn test_missing_input_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = EvdevInput::new(dir.path().join("missing"));
        assert!(input.register(BOOST_INPUT_CLASSES, dead_handle()).is_err());
    }

    #[test]
    fn test_non_event_nodes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mice"), b"").unwrap();
        std::fs::write(dir.path().join("event0"), b"").unwrap();

        let input = EvdevInput::new(dir.path());
        assert_eq!(input.register(BOOST_INPUT_CLASSES, dead_handle()).unwrap(), 0);
        input.unregister();
    }

    fn dead_handle() -> InputHandle {
        use crate::config::BoostConfig;
        use crate::controller::BoostController;
        use crate::workqueue::VirtualQueue;

        // capture the handle the controller registers, then drop the controller
        struct Capture(Mutex<Option<InputHandle>>);
        impl InputDelivery for Capture {
            fn register(&self, _: &[InputClass], handle: InputHandle) -> io::Result<usize> {
                *self.0.lock().unwrap() = Some(handle);
                Ok(0)
            }
            fn unregister(&self) {}
        }

        let capture = Arc::new(Capture(Mutex::new(None)));
        let controller = BoostController::new(
            Arc::new(BoostConfig::default()),
            Arc::new(VirtualQueue::new()),
            capture.clone(),
        );
        let device = crate::device::mock::RecordingControl::new(1, 2);
        controller.start(Arc::new(crate::device::TargetDevice::new("gpu", device)));
        capture.0.lock().unwrap().take().unwrap()
    }
}
