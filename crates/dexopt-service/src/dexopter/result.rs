//! Results of dexopt operations

use bitflags::bitflags;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

use crate::compiler_filter;

/// Outcome of one unit of dexopt work. Aggregates take the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DexoptStatus {
    /// Nothing needed to be done, or the work was not applicable
    Skipped = 10,
    /// Compiled successfully
    Performed = 20,
    /// Compilation or a prerequisite failed
    Failed = 30,
    /// Interrupted by a cancellation request
    Cancelled = 40,
}

impl DexoptStatus {
    /// Lower-case name used in dumps
    pub fn as_str(self) -> &'static str {
        match self {
            DexoptStatus::Skipped => "SKIPPED",
            DexoptStatus::Performed => "PERFORMED",
            DexoptStatus::Failed => "FAILED",
            DexoptStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for DexoptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Details that refine [`DexoptStatus`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExtendedStatusFlags: u32 {
        /// Skipped because storage is low
        const SKIPPED_STORAGE_LOW = 1 << 0;
        /// Skipped because the dex container file has no dex code
        const SKIPPED_NO_DEX_CODE = 1 << 1;
        /// Skipped because staged pre-reboot artifacts already exist
        const SKIPPED_PRE_REBOOT_ALREADY_EXIST = 1 << 2;
        /// An external profile was rejected
        const BAD_EXTERNAL_PROFILE = 1 << 3;
    }
}

static DEX2OAT_SUFFIX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\[status=(-?\d+),exit_code=(-?\d+),signal=(-?\d+)\]$").ok());

/// How the compiler process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Dex2OatResult {
    /// 0: not run, 1: exited, 2: signaled, 3: cancelled, -1: unknown
    pub status: i32,
    /// Exit code, when exited
    pub exit_code: i32,
    /// Signal number, when signaled
    pub signal: i32,
}

impl Dex2OatResult {
    /// The compiler was never invoked
    pub fn not_run() -> Self {
        Self {
            status: 0,
            exit_code: -1,
            signal: 0,
        }
    }

    /// The compile finished with exit code 0
    pub fn exited_successfully() -> Self {
        Self {
            status: 1,
            exit_code: 0,
            signal: 0,
        }
    }

    /// The compile was cancelled
    pub fn cancelled() -> Self {
        Self {
            status: 3,
            exit_code: -1,
            signal: 0,
        }
    }

    /// Parse the `[status=..,exit_code=..,signal=..]` suffix artd appends to compile errors
    pub fn parse(message: &str) -> Option<Self> {
        let captures = DEX2OAT_SUFFIX.as_ref()?.captures(message)?;
        let field = |index: usize| captures.get(index)?.as_str().parse::<i32>().ok();
        Some(Self {
            status: field(1)?,
            exit_code: field(2)?,
            signal: field(3)?,
        })
    }
}

/// Result of dexopting one dex container file for one ABI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DexContainerFileDexoptResult {
    /// Absolute path of the dex container file
    pub dex_container_file: String,
    /// Whether `abi` is the primary ABI of the app
    pub is_primary_abi: bool,
    /// ABI name
    pub abi: String,
    /// Filter actually used after adjustments
    pub actual_compiler_filter: String,
    /// Outcome
    pub status: DexoptStatus,
    /// Wall time of the compile
    pub dex2oat_wall_time_ms: i64,
    /// CPU time of the compile
    pub dex2oat_cpu_time_ms: i64,
    /// Size of the new artifacts
    pub size_bytes: i64,
    /// Size of the artifacts they replaced
    pub size_before_bytes: i64,
    /// Status details
    #[serde(skip)]
    pub extended_status_flags: ExtendedStatusFlags,
    /// Why external profiles were rejected
    pub external_profile_errors: Vec<String>,
    /// How the compiler process ended
    pub dex2oat_result: Dex2OatResult,
}

impl fmt::Display for DexContainerFileDexoptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DexContainerFileDexoptResult{{dexContainerFile={}, primaryAbi={}, abi={}, \
             actualCompilerFilter={}, status={}, dex2oatWallTimeMillis={}, \
             dex2oatCpuTimeMillis={}, sizeBytes={}, sizeBeforeBytes={}, \
             extendedStatusFlags={:?}, externalProfileErrors={:?}}}",
            self.dex_container_file,
            self.is_primary_abi,
            self.abi,
            self.actual_compiler_filter,
            self.status,
            self.dex2oat_wall_time_ms,
            self.dex2oat_cpu_time_ms,
            self.size_bytes,
            self.size_before_bytes,
            self.extended_status_flags,
            self.external_profile_errors
        )
    }
}

/// Result of dexopting one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageDexoptResult {
    /// Package name
    pub package_name: String,
    /// Per (file, ABI) results, in processing order
    pub dex_container_file_dexopt_results: Vec<DexContainerFileDexoptResult>,
    /// Set when the package failed or was cancelled as a whole
    pub package_level_status: Option<DexoptStatus>,
}

impl PackageDexoptResult {
    /// Aggregate status of the package
    pub fn status(&self) -> DexoptStatus {
        self.dex_container_file_dexopt_results
            .iter()
            .map(|result| result.status)
            .chain(self.package_level_status)
            .max()
            .unwrap_or(DexoptStatus::Skipped)
    }

    /// Whether any compile produced new artifacts
    pub fn has_updated_artifacts(&self) -> bool {
        self.dex_container_file_dexopt_results
            .iter()
            .any(|result| result.status == DexoptStatus::Performed)
    }

    /// Whether any file was compiled with a profile-guided filter but skipped
    pub(crate) fn skipped_with_profile_guided_filter(&self) -> bool {
        self.dex_container_file_dexopt_results.iter().any(|result| {
            result.status == DexoptStatus::Skipped
                && compiler_filter::is_profile_guided(&result.actual_compiler_filter)
        })
    }
}

/// Result of a dexopt operation over one or more packages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DexoptOutcome {
    /// Filter requested by the caller, before adjustments
    pub requested_compiler_filter: String,
    /// Compilation reason
    pub reason: String,
    /// Per-package results, in request order
    pub package_dexopt_results: Vec<PackageDexoptResult>,
}

impl DexoptOutcome {
    /// Aggregate status over all packages
    pub fn final_status(&self) -> DexoptStatus {
        self.package_dexopt_results
            .iter()
            .map(PackageDexoptResult::status)
            .max()
            .unwrap_or(DexoptStatus::Skipped)
    }

    /// Copy with only the packages whose artifacts changed
    pub fn only_updates(&self) -> DexoptOutcome {
        DexoptOutcome {
            requested_compiler_filter: self.requested_compiler_filter.clone(),
            reason: self.reason.clone(),
            package_dexopt_results: self
                .package_dexopt_results
                .iter()
                .filter(|result| result.has_updated_artifacts())
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_result(status: DexoptStatus, filter: &str) -> DexContainerFileDexoptResult {
        DexContainerFileDexoptResult {
            dex_container_file: "/data/app/foo/base.apk".to_string(),
            is_primary_abi: true,
            abi: "arm64-v8a".to_string(),
            actual_compiler_filter: filter.to_string(),
            status,
            dex2oat_wall_time_ms: 0,
            dex2oat_cpu_time_ms: 0,
            size_bytes: 0,
            size_before_bytes: 0,
            extended_status_flags: ExtendedStatusFlags::empty(),
            external_profile_errors: Vec::new(),
            dex2oat_result: Dex2OatResult::not_run(),
        }
    }

    #[test]
    fn test_status_order() {
        assert!(DexoptStatus::Skipped < DexoptStatus::Performed);
        assert!(DexoptStatus::Performed < DexoptStatus::Failed);
        assert!(DexoptStatus::Failed < DexoptStatus::Cancelled);
    }

    #[test]
    fn test_parse_dex2oat_suffix() {
        assert_eq!(
            Dex2OatResult::parse("Failed to run dex2oat [status=1,exit_code=-1,signal=9]"),
            Some(Dex2OatResult {
                status: 1,
                exit_code: -1,
                signal: 9
            })
        );
        assert_eq!(Dex2OatResult::parse("[status=1,exit_code=2,signal=0] trailing"), None);
        assert_eq!(Dex2OatResult::parse("no suffix"), None);
    }

    #[test]
    fn test_package_status_aggregation() {
        let mut result = PackageDexoptResult {
            package_name: "foo".to_string(),
            dex_container_file_dexopt_results: vec![
                file_result(DexoptStatus::Skipped, "speed-profile"),
                file_result(DexoptStatus::Performed, "verify"),
            ],
            package_level_status: None,
        };
        assert_eq!(result.status(), DexoptStatus::Performed);
        assert!(result.has_updated_artifacts());
        assert!(result.skipped_with_profile_guided_filter());

        result.package_level_status = Some(DexoptStatus::Failed);
        assert_eq!(result.status(), DexoptStatus::Failed);

        let empty = PackageDexoptResult {
            package_name: "bar".to_string(),
            dex_container_file_dexopt_results: Vec::new(),
            package_level_status: None,
        };
        assert_eq!(empty.status(), DexoptStatus::Skipped);
        assert!(!empty.has_updated_artifacts());
    }
}
