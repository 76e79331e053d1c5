//! Clock, storage, scheduler, update_engine and chroot fakes

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dexopt_core::{
    ArtdError, ArtdResult, ChrootSetup, Clock, JobFinishedNotifier, JobInfo, JobParameters,
    JobScheduler, StorageManager, UpdateEngine,
};

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Start at `now_ms`
    pub fn new(now_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(now_ms),
        })
    }

    /// Jump to `now_ms`
    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward by `delta_ms`
    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Storage with a fixed amount of free space per volume
#[derive(Debug)]
pub struct FakeStorage {
    /// Free bytes per volume uuid; `None` is internal storage
    pub allocatable: Mutex<FxHashMap<Option<String>, i64>>,
    /// When set, every query fails
    pub fail: AtomicBool,
}

impl FakeStorage {
    /// Internal storage with `bytes` free
    pub fn with_internal(bytes: i64) -> Arc<Self> {
        let mut allocatable = FxHashMap::default();
        allocatable.insert(None, bytes);
        Arc::new(Self {
            allocatable: Mutex::new(allocatable),
            fail: AtomicBool::new(false),
        })
    }

    /// Change the free space of internal storage
    pub fn set_internal(&self, bytes: i64) {
        self.allocatable.lock().insert(None, bytes);
    }
}

impl StorageManager for FakeStorage {
    fn allocatable_bytes(&self, storage_uuid: Option<&str>) -> io::Result<i64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "storage query failed"));
        }
        Ok(self
            .allocatable
            .lock()
            .get(&storage_uuid.map(str::to_string))
            .copied()
            .unwrap_or(i64::MAX))
    }
}

/// Job scheduler that keeps pending jobs in memory
#[derive(Debug)]
pub struct FakeJobScheduler {
    /// Pending jobs by id
    pub pending: Mutex<FxHashMap<i32, JobInfo>>,
    /// Every accepted schedule request
    pub scheduled: Mutex<Vec<JobInfo>>,
    /// Ids passed to `cancel`
    pub cancelled: Mutex<Vec<i32>>,
    /// Whether `schedule` succeeds
    pub accept: AtomicBool,
}

impl FakeJobScheduler {
    /// A scheduler that accepts everything
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(FxHashMap::default()),
            scheduled: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
        })
    }

    /// Parameters the scheduler would pass when starting pending job `job_id`
    pub fn start_params(&self, job_id: i32) -> Option<JobParameters> {
        self.pending.lock().get(&job_id).map(|info| JobParameters {
            job_id,
            ticket: info.ticket.clone(),
        })
    }
}

impl JobScheduler for FakeJobScheduler {
    fn schedule(&self, info: &JobInfo) -> bool {
        if !self.accept.load(Ordering::SeqCst) {
            return false;
        }
        self.pending.lock().insert(info.id, info.clone());
        self.scheduled.lock().push(info.clone());
        true
    }

    fn cancel(&self, job_id: i32) {
        self.pending.lock().remove(&job_id);
        self.cancelled.lock().push(job_id);
    }

    fn pending_job(&self, job_id: i32) -> Option<JobInfo> {
        self.pending.lock().get(&job_id).cloned()
    }
}

/// Records `job_finished` calls
#[derive(Debug, Default)]
pub struct RecordingJobFinished {
    /// (params, wants_reschedule)
    pub calls: Mutex<Vec<(JobParameters, bool)>>,
}

impl JobFinishedNotifier for RecordingJobFinished {
    fn job_finished(&self, params: &JobParameters, wants_reschedule: bool) {
        self.calls.lock().push((params.clone(), wants_reschedule));
    }
}

type PostinstallHook = Arc<dyn Fn() + Send + Sync>;

/// update_engine fake; runs an optional hook when postinstall is triggered
#[derive(Default)]
pub struct FakeUpdateEngine {
    /// Partitions postinstall was triggered for
    pub triggered: Mutex<Vec<String>>,
    /// Called after recording the trigger
    pub on_trigger: Mutex<Option<PostinstallHook>>,
    /// When set, `trigger_postinstall` fails with this error
    pub error: Mutex<Option<ArtdError>>,
}

impl UpdateEngine for FakeUpdateEngine {
    fn trigger_postinstall(&self, partition: &str) -> ArtdResult<()> {
        self.triggered.lock().push(partition.to_string());
        if let Some(err) = self.error.lock().clone() {
            return Err(err);
        }
        let hook = self.on_trigger.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }
}

/// Chroot setup fake that records the sequence of calls
#[derive(Debug, Default)]
pub struct FakeChrootSetup {
    /// Calls in order, e.g. `set_up(_a, false)`, `init`, `tear_down(false)`
    pub calls: Mutex<Vec<String>>,
    /// When set, `set_up` fails with this error
    pub set_up_error: Mutex<Option<ArtdError>>,
    /// What `chroot_exists` reports
    pub exists: AtomicBool,
}

impl ChrootSetup for FakeChrootSetup {
    fn set_up(&self, ota_slot: Option<&str>, map_snapshots: bool) -> ArtdResult<()> {
        self.calls.lock().push(format!(
            "set_up({}, {})",
            ota_slot.unwrap_or("null"),
            map_snapshots
        ));
        if let Some(err) = self.set_up_error.lock().clone() {
            return Err(err);
        }
        self.exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn init(&self) -> ArtdResult<()> {
        self.calls.lock().push("init".to_string());
        Ok(())
    }

    fn tear_down(&self, allow_concurrent: bool) -> ArtdResult<()> {
        self.calls
            .lock()
            .push(format!("tear_down({})", allow_concurrent));
        self.exists.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn chroot_exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }
}
