//! Job scheduler, update_engine, and chroot setup collaborators used by pre-reboot dexopt.
//!
//! Like artd, these are remote system services, so their calls report failures as
//! [`ArtdError`](crate::error::ArtdError).

use std::path::Path;
use std::time::Duration;

use crate::error::ArtdResult;

/// Directory the new system image is mounted under for pre-reboot dexopt
pub const CHROOT_DIR: &str = "/mnt/pre_reboot_dexopt/chroot";

/// Constraints and payload of a scheduled job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Stable job id
    pub id: i32,
    /// Opaque token identifying this particular schedule request
    pub ticket: String,
    /// Run only while the device is idle
    pub requires_device_idle: bool,
    /// Run only while charging
    pub requires_charging: bool,
    /// Run only when the battery is not low
    pub requires_battery_not_low: bool,
    /// Earliest start, relative to scheduling
    pub min_latency: Duration,
}

/// Parameters the scheduler passes when starting a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobParameters {
    /// Job id
    pub job_id: i32,
    /// Ticket the job was scheduled with
    pub ticket: String,
}

/// The platform job scheduler
pub trait JobScheduler: Send + Sync {
    /// Schedule or replace a job. Returns `false` if the scheduler refused it.
    fn schedule(&self, info: &JobInfo) -> bool;

    /// Remove a pending job
    fn cancel(&self, job_id: i32);

    /// The pending job with `job_id`, if any
    fn pending_job(&self, job_id: i32) -> Option<JobInfo>;
}

/// Callback used to tell the scheduler that a started job is done
pub trait JobFinishedNotifier: Send + Sync {
    /// Report completion
    fn job_finished(&self, params: &JobParameters, wants_reschedule: bool);
}

/// update_engine, which maps snapshot devices during OTA postinstall
pub trait UpdateEngine: Send + Sync {
    /// Run postinstall for `partition`
    fn trigger_postinstall(&self, partition: &str) -> ArtdResult<()>;
}

/// Service that mounts the new system image into [`CHROOT_DIR`]
pub trait ChrootSetup: Send + Sync {
    /// Mount the image. `map_snapshots` maps OTA snapshot devices without update_engine.
    fn set_up(&self, ota_slot: Option<&str>, map_snapshots: bool) -> ArtdResult<()>;

    /// Finish setup after the requirement check passed
    fn init(&self) -> ArtdResult<()>;

    /// Unmount everything. `allow_concurrent` tolerates another teardown in progress.
    fn tear_down(&self, allow_concurrent: bool) -> ArtdResult<()>;

    /// Whether a chroot is present, possibly left over by a crashed run
    fn chroot_exists(&self) -> bool {
        Path::new(CHROOT_DIR).exists()
    }
}
