//! Hooks through which the embedding system customizes dexopt

use dexopt_core::{CancellationSignal, PackageSnapshot};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::dexopter::result::DexoptOutcome;
use crate::error::{DexoptError, DexoptResult};
use crate::params::BatchDexoptParams;

/// `(package_name, original_filter, reason) -> new_filter`
pub type AdjustCompilerFilterCallback = Arc<dyn Fn(&str, &str, &str) -> String + Send + Sync>;

/// Called before a batch run with the default package list. May rewrite the params in place,
/// but not their reason.
pub type BatchDexoptStartCallback = Arc<
    dyn Fn(&PackageSnapshot, &str, &[String], &mut BatchDexoptParams, &CancellationSignal)
        + Send
        + Sync,
>;

/// Called after every dexopt operation
pub type DexoptDoneCallback = Arc<dyn Fn(&DexoptOutcome) + Send + Sync>;

struct DoneEntry {
    only_include_updates: bool,
    callback: DexoptDoneCallback,
}

/// Registered callbacks
#[derive(Default)]
pub struct Callbacks {
    adjust_compiler_filter: RwLock<Option<AdjustCompilerFilterCallback>>,
    batch_dexopt_start: RwLock<Option<BatchDexoptStartCallback>>,
    dexopt_done: RwLock<Vec<DoneEntry>>,
}

impl Callbacks {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the compiler filter adjustment callback
    pub fn set_adjust_compiler_filter_callback(&self, callback: AdjustCompilerFilterCallback) {
        *self.adjust_compiler_filter.write() = Some(callback);
    }

    /// Remove the compiler filter adjustment callback
    pub fn clear_adjust_compiler_filter_callback(&self) {
        *self.adjust_compiler_filter.write() = None;
    }

    pub(crate) fn adjust_compiler_filter(&self) -> Option<AdjustCompilerFilterCallback> {
        self.adjust_compiler_filter.read().clone()
    }

    /// Replace the batch start callback
    pub fn set_batch_dexopt_start_callback(&self, callback: BatchDexoptStartCallback) {
        *self.batch_dexopt_start.write() = Some(callback);
    }

    /// Remove the batch start callback
    pub fn clear_batch_dexopt_start_callback(&self) {
        *self.batch_dexopt_start.write() = None;
    }

    pub(crate) fn batch_dexopt_start(&self) -> Option<BatchDexoptStartCallback> {
        self.batch_dexopt_start.read().clone()
    }

    /// Add a done callback. With `only_include_updates`, it only sees packages whose
    /// artifacts changed and is not called when there are none.
    pub fn add_dexopt_done_callback(
        &self,
        only_include_updates: bool,
        callback: DexoptDoneCallback,
    ) -> DexoptResult<()> {
        let mut entries = self.dexopt_done.write();
        if entries
            .iter()
            .any(|entry| Arc::ptr_eq(&entry.callback, &callback))
        {
            return Err(DexoptError::IllegalState(
                "Dexopt done callback already added".to_string(),
            ));
        }
        entries.push(DoneEntry {
            only_include_updates,
            callback,
        });
        Ok(())
    }

    /// Remove a done callback; unknown callbacks are ignored
    pub fn remove_dexopt_done_callback(&self, callback: &DexoptDoneCallback) {
        self.dexopt_done
            .write()
            .retain(|entry| !Arc::ptr_eq(&entry.callback, callback));
    }

    pub(crate) fn notify_dexopt_done(&self, result: &DexoptOutcome) {
        let entries: Vec<(bool, DexoptDoneCallback)> = self
            .dexopt_done
            .read()
            .iter()
            .map(|entry| (entry.only_include_updates, entry.callback.clone()))
            .collect();
        for (only_include_updates, callback) in entries {
            if only_include_updates {
                let updates = result.only_updates();
                if !updates.package_dexopt_results.is_empty() {
                    callback(&updates);
                }
            } else {
                callback(result);
            }
        }
    }
}
