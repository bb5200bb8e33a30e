use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::config::{BoostConfig, BoostMode};
use crate::device::{Floor, TargetDevice};
use crate::input::{BOOST_INPUT_CLASSES, InputDelivery};
use crate::workqueue::{Priority, Scheduler, WorkItem};

/// What a trigger did to the boost session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostOutcome {
    /// Suspended, unconfigured or no device bound
    Ignored,
    /// A reboost was already queued
    Coalesced,
    /// The running boost gets a fresh expiry
    Reboosting,
    /// A new boost was queued
    Boosting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionState {
    pub active: bool,
    pub reboost_pending: bool,
}

/// Snapshot reported to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoostStatus {
    pub mode: BoostMode,
    pub active: bool,
    pub reboost_pending: bool,
    pub bound: bool,
    pub suspended: bool,
    pub min_frequency: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Boost,
    Max,
}

#[derive(Default)]
struct Session {
    state: SessionState,
    device: Option<Arc<TargetDevice>>,
}

struct Works {
    boost: WorkItem,
    boost_max: WorkItem,
    unboost: WorkItem,
    reboost: WorkItem,
}

impl Works {
    fn new(inner: &Weak<Inner>) -> Self {
        let work = |name, body: fn(&Inner)| {
            let inner = inner.clone();
            WorkItem::new(name, move || {
                if let Some(inner) = inner.upgrade() {
                    body(&inner)
                }
            })
        };
        Self {
            boost: work("gpu_boost", |inner| inner.boost_worker(Target::Boost)),
            boost_max: work("gpu_boost_max", |inner| inner.boost_worker(Target::Max)),
            unboost: work("gpu_unboost", Inner::unboost_worker),
            reboost: work("gpu_reboost", Inner::reboost_worker),
        }
    }

    fn all(&self) -> [&WorkItem; 4] {
        [&self.boost, &self.reboost, &self.unboost, &self.boost_max]
    }
}

struct Inner {
    config: Arc<BoostConfig>,
    scheduler: Arc<dyn Scheduler>,
    input: Arc<dyn InputDelivery>,
    session: Mutex<Session>,
    works: Works,
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bound_device(&self) -> Option<Arc<TargetDevice>> {
        self.lock_session().device.clone()
    }

    /// The gating shared by every trigger. Only flags are touched and work
    /// is queued here, the device is never mutated on the caller's thread.
    fn request(&self, target: Target) -> BoostOutcome {
        let mut session = self.lock_session();
        let Some(device) = session.device.as_ref() else {
            return BoostOutcome::Ignored;
        };
        if device.is_suspended() || !self.config.is_configured() {
            return BoostOutcome::Ignored;
        }

        if session.state.reboost_pending {
            return BoostOutcome::Coalesced;
        }

        if session.state.active {
            session.state.reboost_pending = true;
            self.scheduler
                .schedule(&self.works.reboost, Priority::Normal);
            trace!("boost active, reboost queued");
            return BoostOutcome::Reboosting;
        }

        session.state.active = true;
        let work = match target {
            Target::Boost => &self.works.boost,
            Target::Max => &self.works.boost_max,
        };
        self.scheduler.schedule(work, Priority::High);
        trace!("{} queued", work.name());
        BoostOutcome::Boosting
    }

    /// Arm the expiry unless the controller was stopped meanwhile.
    fn arm_expiry(&self) {
        let session = self.lock_session();
        if session.device.is_some() {
            self.scheduler
                .schedule_after(&self.works.unboost, self.config.boost_duration());
        }
    }

    fn boost_worker(&self, target: Target) {
        let Some(device) = self.bound_device() else {
            return;
        };
        let floor = match target {
            Target::Boost => Floor::Boost(self.config.boost_freq()),
            Target::Max => Floor::Max,
        };
        let freq = device.apply_floor(floor);
        debug!(
            "boosted {} to {freq} for {:?}",
            device.name(),
            self.config.boost_duration()
        );
        self.arm_expiry();
    }

    fn unboost_worker(&self) {
        if let Some(device) = self.bound_device() {
            let freq = device.apply_floor(Floor::Lowest);
            debug!("boost on {} expired, floor back to {freq}", device.name());
        }
        self.lock_session().state.active = false;
    }

    fn reboost_worker(&self) {
        // A timer that already fired wins, the session settles to idle.
        if self.scheduler.cancel_and_wait(&self.works.unboost) {
            self.arm_expiry();
            debug!("boost extended by {:?}", self.config.boost_duration());
        }
        self.lock_session().state.reboost_pending = false;
    }
}

/// Debounced frequency boost for a single GPU.
///
/// Every trigger goes through the same gate: an idle session starts a boost,
/// a boosting session slides its expiry forward, and triggers arriving
/// while that reboost is still queued are dropped. Floors are only ever
/// written from the scheduler's background context.
pub struct BoostController {
    inner: Arc<Inner>,
}

impl BoostController {
    pub fn new(
        config: Arc<BoostConfig>,
        scheduler: Arc<dyn Scheduler>,
        input: Arc<dyn InputDelivery>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            config,
            scheduler,
            input,
            session: Mutex::new(Session::default()),
            works: Works::new(weak),
        });
        Self { inner }
    }

    pub fn config(&self) -> &Arc<BoostConfig> {
        &self.inner.config
    }

    /// Bind `device` and start listening for input.
    ///
    /// Must be paired with [`BoostController::stop`]. A second start
    /// without a stop is a caller bug and is ignored.
    pub fn start(&self, device: Arc<TargetDevice>) {
        {
            let mut session = self.inner.lock_session();
            if session.device.is_some() {
                error!("boost controller already started, ignoring start");
                return;
            }
            *session = Session {
                state: SessionState::default(),
                device: Some(device.clone()),
            };
        }
        info!("boosting {}", device.name());

        let handle = InputHandle {
            inner: Arc::downgrade(&self.inner),
        };
        match self.inner.input.register(BOOST_INPUT_CLASSES, handle) {
            Ok(devices) => debug!("input handler attached to {devices} devices"),
            Err(e) => error!("failed to register input handler: {e}"),
        }
    }

    /// Unbind the device. Once this returns no floor is written anymore,
    /// pending and running work included.
    pub fn stop(&self) {
        let device = std::mem::take(&mut *self.inner.lock_session()).device;
        let Some(device) = device else {
            return;
        };

        self.inner.input.unregister();
        for work in self.inner.works.all() {
            self.inner.scheduler.cancel_and_wait(work);
        }
        // a worker racing the reset may have cleared flags after it
        self.inner.lock_session().state = SessionState::default();
        info!("stopped boosting {}", device.name());
    }

    /// Boost to the configured frequency.
    pub fn request_boost(&self) -> BoostOutcome {
        self.inner.request(Target::Boost)
    }

    /// Boost to the device's maximum frequency.
    pub fn request_boost_to_max(&self) -> BoostOutcome {
        self.inner.request(Target::Max)
    }

    /// Feed one load sample. Returns true when the sample crossed the load
    /// threshold and a boost was requested.
    pub fn notify_load_sample(&self, busy_time: u64, total_time: u64) -> bool {
        if total_time == 0 {
            return false;
        }
        let config = &self.inner.config;
        let threshold = u64::from(config.load_threshold());
        if config.mode() != BoostMode::LoadTriggered || threshold == 0 {
            return false;
        }
        if busy_time.saturating_mul(100) / total_time < threshold {
            return false;
        }

        self.inner.request(Target::Boost);
        true
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.lock_session().state
    }

    pub fn is_bound(&self) -> bool {
        self.inner.lock_session().device.is_some()
    }

    pub fn status(&self) -> BoostStatus {
        let (state, device) = {
            let session = self.inner.lock_session();
            (session.state, session.device.clone())
        };
        BoostStatus {
            mode: self.inner.config.mode(),
            active: state.active,
            reboost_pending: state.reboost_pending,
            bound: device.is_some(),
            suspended: device.as_ref().is_some_and(|d| d.is_suspended()),
            min_frequency: device.map(|d| d.min_frequency()),
        }
    }
}

impl Drop for BoostController {
    fn drop(&mut self) {
        if self.is_bound() {
            warn!("boost controller dropped while started");
            self.stop();
        }
    }
}

/// Input activity sink handed to the input delivery at start.
#[derive(Clone)]
pub struct InputHandle {
    inner: Weak<Inner>,
}

impl InputHandle {
    /// Report activity on a matching device. Returns false once the
    /// controller is gone.
    pub fn event(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        if inner.config.mode() == BoostMode::InputTriggered {
            inner.request(Target::Boost);
        }
        true
    }
}
