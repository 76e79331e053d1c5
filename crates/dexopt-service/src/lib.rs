//! Dexopt Service
//!
//! Decides what application code to compile ahead of time, when, and with which compiler
//! filter, and keeps track of the files that result.
//!
//! This crate provides:
//! - [`DexUseStore`]: a persisted registry of which packages load which dex files
//! - [`Dexopter`]: per-package dexopt, shared by primary and secondary dex files
//! - [`ArtManager`]: batch dexopt passes, cleanup, profile snapshots and status dumps
//! - [`PreRebootJob`]: dexopt against a staged update before rebooting into it
//!
//! # Usage
//!
//! ```rust,ignore
//! use dexopt_service::{ArtManager, DexoptContext, reason};
//!
//! let manager = ArtManager::new(ctx, config.batch.clone());
//! let snapshot = packages.unfiltered_snapshot();
//! let results = manager.dexopt_packages(&snapshot, reason::BG_DEXOPT, &signal, None)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod batch;
pub mod callbacks;
pub mod compiler_filter;
pub mod config;
pub mod dex_use;
pub mod dexopter;
pub mod error;
pub mod params;
pub mod pre_reboot;
pub mod reason;
pub mod utils;

pub use batch::{
    ArtManager, BatchDexoptPass, DeleteResult, DexContainerFileDexoptStatus, OperationProgress,
    PackageDexoptStatus, ProgressCallback,
};
pub use callbacks::Callbacks;
pub use config::{ConfigError, ServiceConfig};
pub use dex_use::{DexContainerFileUseInfo, DexLoader, DexUseStore, SecondaryDexInfo};
pub use dexopter::result::{
    DexContainerFileDexoptResult, DexoptOutcome, DexoptStatus, PackageDexoptResult,
};
pub use dexopter::{DexoptContext, Dexopter, PrimaryDexInfoProvider, SecondaryDexInfoProvider};
pub use error::{DexUseError, DexoptError, DexoptResult, PreRebootError};
pub use params::{BatchDexoptParams, DexoptFlags, DexoptParams};
pub use pre_reboot::{JobHandle, PreRebootJob, PreRebootResult, PreRebootServices, ScheduleStatus};
