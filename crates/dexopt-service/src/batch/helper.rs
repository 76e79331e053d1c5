//! Runs dexopt over a list of packages on a bounded worker pool

use crossbeam::channel;
use dexopt_core::{CancellationSignal, PackageSnapshot, PackageState};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;

use crate::dexopter::result::{DexoptOutcome, DexoptStatus, PackageDexoptResult};
use crate::dexopter::{
    DexoptContext, Dexopter, PrimaryDexInfoProvider, SecondaryDexInfoProvider, Session,
};
use crate::error::{DexoptError, DexoptResult};
use crate::params::{DexoptFlags, DexoptParams};
use crate::utils;

/// Progress of a batch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationProgress {
    /// Packages finished so far
    pub current: usize,
    /// Packages in the operation
    pub total: usize,
}

impl OperationProgress {
    /// Percentage done, rounded down
    pub fn percentage(&self) -> usize {
        if self.total == 0 {
            100
        } else {
            self.current * 100 / self.total
        }
    }
}

/// Receives [`OperationProgress`] updates on the calling thread
pub type ProgressCallback = Arc<dyn Fn(OperationProgress) + Send + Sync>;

/// Dexopts packages one by one on `concurrency` threads. Each package is processed under
/// the read side of `cleanup_lock`.
pub(crate) struct DexoptHelper<'a> {
    ctx: &'a DexoptContext,
    cleanup_lock: &'a RwLock<()>,
}

impl<'a> DexoptHelper<'a> {
    pub(crate) fn new(ctx: &'a DexoptContext, cleanup_lock: &'a RwLock<()>) -> Self {
        Self { ctx, cleanup_lock }
    }

    /// Dexopt `package_names` with `params`. The caller holds an artd pin.
    pub(crate) fn dexopt(
        &self,
        snapshot: &PackageSnapshot,
        package_names: &[String],
        params: &DexoptParams,
        cancellation: &CancellationSignal,
        concurrency: usize,
        progress: Option<&ProgressCallback>,
    ) -> DexoptResult<DexoptOutcome> {
        let packages = self.package_states(snapshot, package_names, params)?;
        let total = packages.len();
        let report = |current: usize| {
            if let Some(callback) = progress {
                callback(OperationProgress { current, total });
            }
        };
        report(0);

        let results = self.run_pool(&packages, params, cancellation, concurrency, &report)?;

        let outcome = DexoptOutcome {
            requested_compiler_filter: params.compiler_filter().to_string(),
            reason: params.reason().to_string(),
            package_dexopt_results: results,
        };
        self.ctx.callbacks.notify_dexopt_done(&outcome);
        Ok(outcome)
    }

    fn package_states(
        &self,
        snapshot: &PackageSnapshot,
        package_names: &[String],
        params: &DexoptParams,
    ) -> DexoptResult<Vec<Arc<PackageState>>> {
        let mut seen = FxHashSet::default();
        let mut states = Vec::with_capacity(package_names.len());
        for name in package_names {
            let state = utils::package_state_or_err(snapshot, name)?;
            if seen.insert(state.package_name.clone()) {
                states.push(state);
            }
        }

        if !params
            .flags()
            .contains(DexoptFlags::SHOULD_INCLUDE_DEPENDENCIES)
        {
            return Ok(states);
        }

        // Dependencies are appended after the packages that need them.
        let mut index = 0;
        while index < states.len() {
            let current = states[index].clone();
            index += 1;
            let mut pending: Vec<_> = current.shared_library_dependencies.iter().collect();
            while let Some(library) = pending.pop() {
                pending.extend(library.dependencies.iter());
                if library.is_native || seen.contains(&library.package_name) {
                    continue;
                }
                if let Some(state) = snapshot.get(&library.package_name) {
                    seen.insert(library.package_name.clone());
                    states.push(state.clone());
                }
            }
        }
        Ok(states)
    }

    fn run_pool(
        &self,
        packages: &[Arc<PackageState>],
        params: &DexoptParams,
        cancellation: &CancellationSignal,
        concurrency: usize,
        report: &dyn Fn(usize),
    ) -> DexoptResult<Vec<PackageDexoptResult>> {
        let worker_count = concurrency
            .clamp(1, num_cpus::get().max(1))
            .min(packages.len().max(1));

        // A signal holds one listener, so every worker gets its own child signal.
        let children: Vec<CancellationSignal> =
            (0..worker_count).map(|_| CancellationSignal::new()).collect();
        let forwarded = children.clone();
        cancellation.set_on_cancel_listener(move || {
            for child in &forwarded {
                child.cancel();
            }
        });

        let (task_tx, task_rx) = channel::unbounded::<usize>();
        for index in 0..packages.len() {
            // The receiver outlives this loop.
            let _ = task_tx.send(index);
        }
        drop(task_tx);

        let mut slots: Vec<Option<PackageDexoptResult>> = vec![None; packages.len()];
        let scoped = crossbeam::thread::scope(|scope| -> DexoptResult<()> {
            let (result_tx, result_rx) =
                channel::unbounded::<(usize, DexoptResult<PackageDexoptResult>)>();
            for (worker, child) in children.iter().enumerate() {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                scope
                    .builder()
                    .name(format!("dexopt-{}", worker))
                    .spawn(move |_| {
                        while let Ok(index) = task_rx.recv() {
                            let result = self.dexopt_package(&packages[index], params, child);
                            if result_tx.send((index, result)).is_err() {
                                break;
                            }
                        }
                    })
                    .map_err(|err| {
                        DexoptError::IllegalState(format!("Failed to spawn dexopt thread: {}", err))
                    })?;
            }
            drop(result_tx);

            let mut first_error = None;
            for (done, (index, result)) in result_rx.iter().enumerate() {
                match result {
                    Ok(result) => slots[index] = Some(result),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
                report(done + 1);
            }
            first_error.map_or(Ok(()), Err)
        });
        cancellation.clear_on_cancel_listener();

        match scoped {
            Ok(result) => result?,
            Err(_) => {
                return Err(DexoptError::IllegalState(
                    "A dexopt thread panicked".to_string(),
                ))
            }
        }

        slots
            .into_iter()
            .zip(packages)
            .map(|(slot, pkg)| {
                slot.ok_or_else(|| {
                    DexoptError::IllegalState(format!(
                        "No dexopt result for package '{}'",
                        pkg.package_name
                    ))
                })
            })
            .collect()
    }

    fn dexopt_package(
        &self,
        pkg: &PackageState,
        params: &DexoptParams,
        cancellation: &CancellationSignal,
    ) -> DexoptResult<PackageDexoptResult> {
        let mut result = PackageDexoptResult {
            package_name: pkg.package_name.clone(),
            dex_container_file_dexopt_results: Vec::new(),
            package_level_status: None,
        };

        if cancellation.is_canceled() {
            result.package_level_status = Some(DexoptStatus::Cancelled);
            return Ok(result);
        }
        if !utils::can_dexopt_package(pkg, self.ctx.packages.as_ref()) {
            result.package_level_status = Some(DexoptStatus::Skipped);
            return Ok(result);
        }

        let _cleanup_guard = self.cleanup_lock.read();
        match self.run_dexopters(pkg, params, cancellation, &mut result) {
            Ok(()) => {}
            Err(DexoptError::Artd(err)) => {
                self.ctx.artd.notify_error(&err);
                log::error!("Failed to dexopt package '{}': {}", pkg.package_name, err);
                result.package_level_status = Some(DexoptStatus::Failed);
            }
            Err(err) => return Err(err),
        }
        Ok(result)
    }

    fn run_dexopters(
        &self,
        pkg: &PackageState,
        params: &DexoptParams,
        cancellation: &CancellationSignal,
        result: &mut PackageDexoptResult,
    ) -> DexoptResult<()> {
        let flags = params.flags();
        if flags.contains(DexoptFlags::FOR_PRIMARY_DEX) {
            let session = Session::new(self.ctx, self.ctx.artd.artd()?, pkg, params, cancellation)?;
            result
                .dex_container_file_dexopt_results
                .extend(Dexopter::new(session, PrimaryDexInfoProvider).dexopt()?);
            if cancellation.is_canceled() {
                return Ok(());
            }
        }
        if flags.contains(DexoptFlags::FOR_SECONDARY_DEX) {
            let session = Session::new(self.ctx, self.ctx.artd.artd()?, pkg, params, cancellation)?;
            result
                .dex_container_file_dexopt_results
                .extend(Dexopter::new(session, SecondaryDexInfoProvider).dexopt()?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        assert_eq!(OperationProgress { current: 0, total: 0 }.percentage(), 100);
        assert_eq!(OperationProgress { current: 1, total: 3 }.percentage(), 33);
        assert_eq!(OperationProgress { current: 3, total: 3 }.percentage(), 100);
    }
}
