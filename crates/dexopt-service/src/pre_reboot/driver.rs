//! One pre-reboot dexopt run: mount the new image, check it, dexopt into the staging area

use dexopt_core::jobs::CHROOT_DIR;
use dexopt_core::{log_artd_error, CancellationSignal, ChrootSetup, PackageRepository};
use std::sync::Arc;

use crate::batch::ArtManager;
use crate::config::BatchConfig;
use crate::dexopter::DexoptContext;
use crate::error::PreRebootError;
use crate::reason;

/// Outcome of [`PreRebootDriver::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreRebootResult {
    /// Whether the run completed; a cancelled run also counts as successful
    pub success: bool,
    /// Whether the new image failed the system requirement check
    pub system_requirement_check_failed: bool,
}

/// Drives a single pre-reboot dexopt run
pub struct PreRebootDriver {
    manager: Arc<ArtManager>,
    packages: Arc<dyn PackageRepository>,
    chroot: Arc<dyn ChrootSetup>,
}

impl PreRebootDriver {
    /// Create a driver. Its outputs go to the staging area.
    pub fn new(ctx: &DexoptContext, batch: BatchConfig, chroot: Arc<dyn ChrootSetup>) -> Self {
        Self {
            manager: ArtManager::new(ctx.for_pre_reboot(), batch),
            packages: ctx.packages.clone(),
            chroot,
        }
    }

    /// The manager that writes to the staging area
    pub fn manager(&self) -> &Arc<ArtManager> {
        &self.manager
    }

    /// Run to completion or cancellation. The chroot is always torn down.
    pub fn run(
        &self,
        ota_slot: Option<&str>,
        map_snapshots_for_ota: bool,
        cancellation: &CancellationSignal,
    ) -> PreRebootResult {
        let result = self.run_in_chroot(ota_slot, map_snapshots_for_ota, cancellation);
        if let Err(err) = self.tear_down() {
            log::error!("{}", err);
        }

        match result {
            Ok(()) => PreRebootResult {
                success: true,
                system_requirement_check_failed: false,
            },
            Err(err) => {
                let system_requirement_check_failed =
                    matches!(err, PreRebootError::SystemRequirement(_));
                match &err {
                    PreRebootError::Artd(artd_err) if artd_err.is_communication() => {
                        log_artd_error(artd_err)
                    }
                    PreRebootError::Artd(artd_err) => {
                        log::error!("Failed to set up chroot: {}", artd_err)
                    }
                    PreRebootError::SystemRequirement(_) => {
                        log::error!("System requirement check failed: {}", err)
                    }
                    _ => log::error!("Failed to run Pre-reboot Dexopt: {}", err),
                }
                PreRebootResult {
                    success: false,
                    system_requirement_check_failed,
                }
            }
        }
    }

    fn run_in_chroot(
        &self,
        ota_slot: Option<&str>,
        map_snapshots_for_ota: bool,
        cancellation: &CancellationSignal,
    ) -> Result<(), PreRebootError> {
        let snapshot = self.packages.unfiltered_snapshot();
        // The batch start callback belongs to the running system, so it is consulted
        // before anything from the new image is mounted.
        let batch = self.manager.batch_params(
            &snapshot,
            reason::PRE_REBOOT_DEXOPT,
            cancellation,
        )?;
        if cancellation.is_canceled() {
            return Ok(());
        }

        self.set_up(ota_slot, map_snapshots_for_ota)?;
        self.manager.run_batch(
            &snapshot,
            reason::PRE_REBOOT_DEXOPT,
            &batch,
            cancellation,
            None,
        )?;
        Ok(())
    }

    /// Set up and tear down the chroot without dexopting anything
    pub fn test(&self) -> Result<(), PreRebootError> {
        let set_up = self.set_up(None, false);
        let tear_down = self.tear_down();
        set_up?;
        tear_down
    }

    /// Tear down a chroot left over by a run that did not end normally
    pub fn maybe_clean_up_chroot(&self) {
        if !self.chroot.chroot_exists() {
            return;
        }
        if let Err(err) = self.chroot.tear_down(true) {
            if err.is_communication() {
                log_artd_error(&err);
            } else {
                log::error!("Failed to clean up leftover chroot: {}", err);
            }
        }
    }

    fn set_up(&self, ota_slot: Option<&str>, map_snapshots_for_ota: bool) -> Result<(), PreRebootError> {
        self.chroot.set_up(ota_slot, map_snapshots_for_ota)?;

        let artd_cache = &self.manager.context().artd;
        let _pin = artd_cache.pin();
        if !artd_cache.artd()?.check_pre_reboot_system_requirements(CHROOT_DIR)? {
            return Err(PreRebootError::SystemRequirement(
                "See logs for details".to_string(),
            ));
        }

        self.chroot.init()?;
        Ok(())
    }

    fn tear_down(&self) -> Result<(), PreRebootError> {
        self.chroot
            .tear_down(false)
            .map_err(|err| PreRebootError::Chroot(format!("Failed to tear down chroot: {}", err)))
    }
}
