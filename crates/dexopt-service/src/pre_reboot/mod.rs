//! Pre-reboot dexopt job
//!
//! When an OTA or a Mainline update is staged, [`PreRebootJob`] schedules a background job
//! that dexopts every package against the new system image, so that the first boot after
//! the update finds its artifacts ready. At most one run exists at a time. Every state
//! transition happens under one monitor (`state` + `monitor`), and callers that replace or
//! stop a run block until the previous run has actually exited.
//!
//! Scheduler notifications are handled on a serialized executor so their callers are never
//! blocked; runs execute on a second, dedicated thread.

pub mod driver;

use dexopt_core::jobs::{JobFinishedNotifier, JobInfo, JobParameters, JobScheduler};
use dexopt_core::{
    log_artd_error, ArtdRefCache, CancellationSignal, ChrootSetup, DeviceConfig,
    SerializedExecutor, SystemProperties, UpdateEngine,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::config::{BatchConfig, PreRebootConfig};
use crate::dexopter::DexoptContext;
pub use crate::error::PreRebootError;

pub use driver::{PreRebootDriver, PreRebootResult};

/// Enables the job, unless a device config flag says otherwise
pub const ENABLE_PROPERTY: &str = "dalvik.vm.enable_pr_dexopt";
/// Persistent marker: a run has started since the last reboot, so staged files may exist
pub const HAS_STARTED_PROPERTY: &str = "dalvik.vm.pre-reboot.has-started";
/// Legacy switch for asynchronous OTA dexopt when update_engine cannot map snapshots
pub const ASYNC_FOR_OTA_PROPERTY: &str = "dalvik.vm.pr_dexopt_async_for_ota";
/// Disables every background dexopt job
pub const DISABLE_BG_DEXOPT_PROPERTY: &str = "pm.dexopt.disable_bg_dexopt";

const DEVICE_CONFIG_NAMESPACE: &str = "runtime";
const UPDATE_ENGINE_PARTITION: &str = "system";

/// Outcome of scheduling the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    /// The job scheduler accepted the job
    Success,
    /// Pre-reboot dexopt is disabled by a system property or device config
    DisabledBySysprop,
    /// The job scheduler refused the job
    JobSchedulerFailure,
}

/// Completion handle of one run
#[derive(Clone, Default)]
pub struct JobHandle {
    inner: Arc<HandleInner>,
}

#[derive(Default)]
struct HandleInner {
    done: Mutex<bool>,
    cond: Condvar,
}

impl JobHandle {
    fn new() -> Self {
        Self::default()
    }

    fn complete(&self) {
        *self.inner.done.lock() = true;
        self.inner.cond.notify_all();
    }

    /// Whether the run has exited
    pub fn is_done(&self) -> bool {
        *self.inner.done.lock()
    }

    /// Block until the run has exited
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cond.wait(&mut done);
        }
    }

    /// Block until the run has exited or `timeout` passed. Returns whether it exited.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.done.lock();
        while !*done {
            if self.inner.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    /// Whether both handles refer to the same run
    pub fn same_job(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Platform services the job talks to
#[derive(Clone)]
pub struct PreRebootServices {
    /// The platform job scheduler
    pub scheduler: Arc<dyn JobScheduler>,
    /// update_engine
    pub update_engine: Arc<dyn UpdateEngine>,
    /// Mounts the new system image
    pub chroot: Arc<dyn ChrootSetup>,
    /// Server-side feature flags
    pub device_config: Arc<dyn DeviceConfig>,
}

/// The handle and the signal of a run exist together or not at all.
struct RunningJob {
    handle: JobHandle,
    cancellation: CancellationSignal,
}

type OnFinished = Box<dyn FnOnce(&mut JobState) + Send>;

#[derive(Default)]
struct JobState {
    running: Option<RunningJob>,
    is_update_engine_ready: bool,
    is_running_job_known_by_scheduler: bool,
    ota_slot: Option<String>,
    map_snapshots_for_ota: bool,
}

impl JobState {
    fn is_running(&self, handle: &JobHandle) -> bool {
        self.running
            .as_ref()
            .map_or(false, |running| running.handle.same_job(handle))
    }
}

/// State machine of the pre-reboot dexopt job
pub struct PreRebootJob {
    weak_self: Weak<PreRebootJob>,
    state: Mutex<JobState>,
    monitor: Condvar,
    notifications: SerializedExecutor,
    worker: SerializedExecutor,
    services: PreRebootServices,
    props: Arc<dyn SystemProperties>,
    artd: Arc<ArtdRefCache>,
    config: PreRebootConfig,
    driver: PreRebootDriver,
}

impl PreRebootJob {
    /// Create the job. If a previous run was interrupted by a restart, its chroot is cleaned
    /// up in the background; other operations wait for that to finish.
    pub fn new(
        ctx: &DexoptContext,
        batch: BatchConfig,
        config: PreRebootConfig,
        services: PreRebootServices,
    ) -> io::Result<Arc<Self>> {
        let notifications = SerializedExecutor::new("pre-reboot-job")?;
        let worker = SerializedExecutor::new("pre-reboot-dexopt")?;
        let driver = PreRebootDriver::new(ctx, batch, services.chroot.clone());

        let job = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            state: Mutex::new(JobState::default()),
            monitor: Condvar::new(),
            notifications,
            worker,
            services,
            props: ctx.props.clone(),
            artd: ctx.artd.clone(),
            config,
            driver,
        });

        if job.has_started() {
            job.clean_up_chroot_for_startup();
        }
        Ok(job)
    }

    /// The driver runs are delegated to
    pub fn driver(&self) -> &PreRebootDriver {
        &self.driver
    }

    /// The scheduler started the job. Returns `true`: the job keeps running until the
    /// notifier is told it finished.
    pub fn on_start_job(&self, notifier: Arc<dyn JobFinishedNotifier>, params: JobParameters) -> bool {
        let weak = self.weak_self.clone();
        self.notifications.execute(move || {
            if let Some(job) = weak.upgrade() {
                job.on_start_job_impl(notifier, params);
            }
        });
        true
    }

    /// Synchronous form of [`on_start_job`](Self::on_start_job)
    pub fn on_start_job_impl(&self, notifier: Arc<dyn JobFinishedNotifier>, params: JobParameters) {
        let mut state = self.state.lock();
        let is_current = self
            .services
            .scheduler
            .pending_job(self.config.job_id)
            .map_or(false, |pending| pending.ticket == params.ticket);
        if !is_current {
            // Only reachable through a race with a newer schedule request.
            if state.is_running_job_known_by_scheduler {
                log::error!("Expired job started while a known job is running");
            }
            log::info!("Ignoring expired Pre-reboot Dexopt Job");
            return;
        }

        state.is_running_job_known_by_scheduler = true;
        let on_finished: OnFinished = Box::new(move |state: &mut JobState| {
            if !state.is_running_job_known_by_scheduler {
                log::error!("Job finished but the scheduler does not know about it");
            }
            state.is_running_job_known_by_scheduler = false;
            // A stopped job is rescheduled according to the return value of `on_stop_job`,
            // so this call never asks for a reschedule.
            notifier.job_finished(&params, false);
        });
        let is_update_engine_ready = false;
        if let Err(err) = self.start_locked(&mut state, Some(on_finished), is_update_engine_ready) {
            log::error!("Fatal error: {}", err);
        }
    }

    /// The scheduler wants the job stopped. Returns `true`: retry with the default policy.
    pub fn on_stop_job(&self, params: JobParameters) -> bool {
        let weak = self.weak_self.clone();
        self.notifications.execute(move || {
            if let Some(job) = weak.upgrade() {
                job.on_stop_job_impl(&params);
            }
        });
        true
    }

    /// Synchronous form of [`on_stop_job`](Self::on_stop_job)
    pub fn on_stop_job_impl(&self, _params: &JobParameters) {
        let mut state = self.state.lock();
        if !state.is_running_job_known_by_scheduler {
            return;
        }
        if let Some(handle) = state.running.as_ref().map(|running| running.handle.clone()) {
            self.cancel_given_locked(&mut state, &handle);
        }
    }

    /// An update is ready. `ota_slot` is `"_a"` or `"_b"` for an OTA update and `None`
    /// for a Mainline update. Handled in the background.
    pub fn on_update_ready(&self, ota_slot: Option<&str>) {
        let weak = self.weak_self.clone();
        let ota_slot = ota_slot.map(str::to_string);
        self.notifications.execute(move || {
            if let Some(job) = weak.upgrade() {
                if let Err(err) = job.on_update_ready_impl(ota_slot.as_deref()) {
                    log::error!("Failed to handle update: {}", err);
                }
            }
        });
    }

    /// Synchronous form of [`on_update_ready`](Self::on_update_ready)
    pub fn on_update_ready_impl(&self, ota_slot: Option<&str>) -> Result<ScheduleStatus, PreRebootError> {
        let mut state = self.state.lock();
        self.cancel_any_locked(&mut state);
        self.reset_locked();
        Self::update_ota_slot_locked(&mut state, ota_slot)?;
        // Without the update_engine API, snapshot devices are mapped by the chroot setup.
        state.map_snapshots_for_ota = !self.config.update_engine_api;
        Ok(self.schedule_locked())
    }

    /// Like [`on_update_ready_impl`](Self::on_update_ready_impl) but starts a run right
    /// away instead of going through the scheduler. Returns `None` when disabled.
    pub fn on_update_ready_start_now(
        &self,
        ota_slot: Option<&str>,
        is_update_engine_ready: bool,
    ) -> Result<Option<JobHandle>, PreRebootError> {
        let mut state = self.state.lock();
        self.cancel_any_locked(&mut state);
        self.reset_locked();
        Self::update_ota_slot_locked(&mut state, ota_slot)?;
        state.map_snapshots_for_ota = !is_update_engine_ready && !self.config.update_engine_api;
        if !self.is_enabled() {
            return Ok(None);
        }
        self.start_locked(&mut state, None, is_update_engine_ready)
            .map(Some)
    }

    /// Cancel everything, then set up and tear down the chroot as a self check
    pub fn test(&self) -> Result<(), PreRebootError> {
        let mut state = self.state.lock();
        self.cancel_any_locked(&mut state);
        self.driver.test()
    }

    /// Cancel `handle` if it is running and wait for it to exit. Another run may be running
    /// when this returns.
    pub fn cancel_given(&self, handle: &JobHandle) {
        let mut state = self.state.lock();
        self.cancel_given_locked(&mut state, handle);
    }

    /// Unschedule the pending job, cancel the running one, and wait until nothing runs
    pub fn cancel_any(&self) {
        let mut state = self.state.lock();
        self.cancel_any_locked(&mut state);
    }

    /// Block until no run is in progress
    pub fn wait_for_running_job(&self) {
        let mut state = self.state.lock();
        while state.running.is_some() {
            self.monitor.wait(&mut state);
        }
    }

    /// Whether a run is in progress
    pub fn has_running_job(&self) -> bool {
        self.state.lock().running.is_some()
    }

    /// update_engine has mapped the snapshot devices. Returns the waiting run, if any.
    pub fn notify_update_engine_ready(&self) -> Option<JobHandle> {
        let mut state = self.state.lock();
        let Some(handle) = state.running.as_ref().map(|running| running.handle.clone()) else {
            log::error!("No waiting job found");
            return None;
        };
        log::info!("update_engine finished mapping snapshots");
        state.is_update_engine_ready = true;
        self.monitor.notify_all();
        Some(handle)
    }

    /// Whether OTA dexopt runs in the background instead of during update_engine
    /// postinstall
    pub fn is_async_for_ota(&self) -> bool {
        self.config.update_engine_api || self.props.get_bool(ASYNC_FOR_OTA_PROPERTY, false)
    }

    /// Whether a run has started since the last reboot, whatever its outcome. Survives
    /// service restarts.
    pub fn has_started(&self) -> bool {
        self.props.get_bool(HAS_STARTED_PROPERTY, false)
    }

    /// Wait until queued notifications have been handled
    pub fn flush(&self) {
        self.notifications.flush();
    }

    fn mark_has_started(&self, value: bool) {
        if let Err(err) = self
            .props
            .set(HAS_STARTED_PROPERTY, if value { "true" } else { "false" })
        {
            log::error!("Failed to set {}: {}", HAS_STARTED_PROPERTY, err);
        }
    }

    fn is_enabled(&self) -> bool {
        let sysprop_enable = self.props.get_bool(ENABLE_PROPERTY, false);
        let device_config = self.services.device_config.as_ref();
        let device_config_enable =
            device_config.get_bool(DEVICE_CONFIG_NAMESPACE, "enable_pr_dexopt", false);
        let device_config_force_disable =
            device_config.get_bool(DEVICE_CONFIG_NAMESPACE, "force_disable_pr_dexopt", false);
        if (!sysprop_enable && !device_config_enable) || device_config_force_disable {
            log::info!(
                "Pre-reboot Dexopt Job is not enabled (sysprop:{}={}, \
                 device_config:enable_pr_dexopt={}, device_config:force_disable_pr_dexopt={})",
                ENABLE_PROPERTY,
                sysprop_enable,
                device_config_enable,
                device_config_force_disable
            );
            return false;
        }
        if self.props.get_bool(DISABLE_BG_DEXOPT_PROPERTY, false) {
            log::info!(
                "Pre-reboot Dexopt Job is disabled by system property '{}'",
                DISABLE_BG_DEXOPT_PROPERTY
            );
            return false;
        }
        true
    }

    fn schedule_locked(&self) -> ScheduleStatus {
        if !self.is_enabled() {
            return ScheduleStatus::DisabledBySysprop;
        }

        let info = JobInfo {
            id: self.config.job_id,
            ticket: format!("{:032x}", rand::random::<u128>()),
            requires_device_idle: true,
            requires_charging: true,
            requires_battery_not_low: true,
            // Leaves update_engine time to finish.
            min_latency: self.config.min_latency(),
        };
        if self.services.scheduler.schedule(&info) {
            log::info!("Pre-reboot Dexopt Job scheduled");
            ScheduleStatus::Success
        } else {
            log::info!("Failed to schedule Pre-reboot Dexopt Job");
            ScheduleStatus::JobSchedulerFailure
        }
    }

    fn unschedule_locked(&self) {
        self.services.scheduler.cancel(self.config.job_id);
    }

    fn reset_locked(&self) {
        if !self.has_started() {
            return;
        }
        let _pin = self.artd.pin();
        if let Err(err) = self
            .artd
            .artd()
            .and_then(|artd| artd.clean_up_pre_reboot_staged_files())
        {
            if err.is_communication() {
                log_artd_error(&err);
            } else {
                log::error!("Failed to clean up obsolete Pre-reboot staged files: {}", err);
            }
        }
        self.mark_has_started(false);
    }

    fn update_ota_slot_locked(state: &mut JobState, value: Option<&str>) -> Result<(), PreRebootError> {
        if !matches!(value, None | Some("_a") | Some("_b")) {
            return Err(PreRebootError::IllegalState(format!(
                "Invalid OTA slot '{}'",
                value.unwrap_or_default()
            )));
        }
        if let (Some(current), Some(value)) = (state.ota_slot.as_deref(), value) {
            if current != value {
                return Err(PreRebootError::IllegalState(format!(
                    "OTA slot changed from '{}' to '{}'",
                    current, value
                )));
            }
        }
        // An OTA update wins over a Mainline update; the latter is discarded on reboot.
        if state.ota_slot.is_none() {
            state.ota_slot = value.map(str::to_string);
        }
        Ok(())
    }

    fn start_locked(
        &self,
        state: &mut MutexGuard<'_, JobState>,
        on_finished: Option<OnFinished>,
        is_update_engine_ready: bool,
    ) -> Result<JobHandle, PreRebootError> {
        if state.running.is_some() {
            return Err(PreRebootError::IllegalState(
                "A Pre-reboot Dexopt Job is already running".to_string(),
            ));
        }
        let job = self
            .weak_self
            .upgrade()
            .ok_or_else(|| PreRebootError::IllegalState("Job is shutting down".to_string()))?;

        let handle = JobHandle::new();
        let cancellation = CancellationSignal::new();
        state.running = Some(RunningJob {
            handle: handle.clone(),
            cancellation: cancellation.clone(),
        });
        state.is_update_engine_ready = is_update_engine_ready;
        let ota_slot = state.ota_slot.clone();
        let map_snapshots_for_ota = state.map_snapshots_for_ota;

        let run_handle = handle.clone();
        let accepted = self.worker.execute(move || {
            job.run(
                ota_slot.as_deref(),
                map_snapshots_for_ota,
                is_update_engine_ready,
                &cancellation,
            );
            job.finish(&run_handle, on_finished);
        });
        if !accepted {
            state.running = None;
            state.is_update_engine_ready = false;
            return Err(PreRebootError::IllegalState(
                "Pre-reboot dexopt worker is gone".to_string(),
            ));
        }
        self.monitor.notify_all();
        Ok(handle)
    }

    fn run(
        &self,
        ota_slot: Option<&str>,
        map_snapshots_for_ota: bool,
        is_update_engine_ready: bool,
        cancellation: &CancellationSignal,
    ) {
        self.mark_has_started(true);
        if ota_slot.is_some() && !is_update_engine_ready && !map_snapshots_for_ota {
            match self.trigger_update_engine_postinstall_and_wait(cancellation) {
                Ok(()) if cancellation.is_canceled() => return,
                Ok(()) => {}
                Err(err) => {
                    log::error!("update_engine error: {}", err);
                    return;
                }
            }
        }
        let result = self.driver.run(ota_slot, map_snapshots_for_ota, cancellation);
        log::info!(
            "Pre-reboot Dexopt Job ended (success={}, system_requirement_check_failed={})",
            result.success,
            result.system_requirement_check_failed
        );
    }

    fn finish(&self, handle: &JobHandle, on_finished: Option<OnFinished>) {
        let mut state = self.state.lock();
        if let Some(on_finished) = on_finished {
            on_finished(&mut state);
        }
        state.running = None;
        state.is_update_engine_ready = false;
        handle.complete();
        self.monitor.notify_all();
    }

    /// update_engine maps the snapshot devices and runs the postinstall script, which calls
    /// [`notify_update_engine_ready`](Self::notify_update_engine_ready).
    fn trigger_update_engine_postinstall_and_wait(
        &self,
        cancellation: &CancellationSignal,
    ) -> Result<(), PreRebootError> {
        if !self.config.update_engine_api {
            return Err(PreRebootError::UpdateEngine(
                "update_engine API is not available".to_string(),
            ));
        }
        log::info!("Waiting for update_engine to map snapshots...");
        self.services
            .update_engine
            .trigger_postinstall(UPDATE_ENGINE_PARTITION)
            .map_err(|err| {
                PreRebootError::UpdateEngine(format!("Failed to trigger postinstall: {}", err.message()))
            })?;

        let deadline = Instant::now() + self.config.update_engine_timeout();
        let mut state = self.state.lock();
        loop {
            if state.is_update_engine_ready || cancellation.is_canceled() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PreRebootError::UpdateEngine(
                    "Timed out while waiting for update_engine".to_string(),
                ));
            }
            self.monitor.wait_until(&mut state, deadline);
        }
    }

    fn cancel_running_locked(&self, state: &JobState) {
        if let Some(running) = &state.running {
            if !running.cancellation.is_canceled() {
                running.cancellation.cancel();
                // Wakes up a run waiting for update_engine.
                self.monitor.notify_all();
                log::info!("Job cancelled");
            }
        }
    }

    fn cancel_given_locked(&self, state: &mut MutexGuard<'_, JobState>, handle: &JobHandle) {
        while state.is_running(handle) {
            self.cancel_running_locked(state);
            self.monitor.wait(state);
        }
    }

    fn cancel_any_locked(&self, state: &mut MutexGuard<'_, JobState>) {
        self.unschedule_locked();
        while state.running.is_some() {
            self.cancel_running_locked(state);
            self.monitor.wait(state);
        }
    }

    /// Occupies the running slot so that other operations wait for the cleanup. The
    /// signal is a placeholder and never observed.
    fn clean_up_chroot_for_startup(&self) {
        let Some(job) = self.weak_self.upgrade() else {
            return;
        };
        let mut state = self.state.lock();
        let handle = JobHandle::new();
        state.running = Some(RunningJob {
            handle: handle.clone(),
            cancellation: CancellationSignal::new(),
        });
        let run_handle = handle.clone();
        if !self.worker.execute(move || {
            job.driver.maybe_clean_up_chroot();
            job.finish(&run_handle, None);
        }) {
            state.running = None;
        }
        self.monitor.notify_all();
    }
}
