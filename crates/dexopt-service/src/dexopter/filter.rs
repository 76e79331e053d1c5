//! Compiler filter adjustment
//!
//! The requested filter first goes through an upgrade phase (System UI override, launcher
//! default, the adjustment callback), which `FORCE_COMPILER_FILTER` skips. The downgrade
//! phase always runs afterwards and never yields a better filter than its input.

use crate::callbacks::AdjustCompilerFilterCallback;
use crate::compiler_filter;
use crate::error::{DexoptError, DexoptResult};

/// Property holding the filter override for System UI
pub const SYSTEM_UI_FILTER_PROPERTY: &str = "dalvik.vm.systemuicompilerfilter";

/// Inputs of the upgrade phase
pub(crate) struct UpgradeInputs<'a> {
    pub package_name: &'a str,
    pub reason: &'a str,
    pub is_system_ui: bool,
    pub is_launcher: bool,
    pub system_ui_filter: String,
    pub callback: Option<AdjustCompilerFilterCallback>,
}

/// Package and request traits that can only lower the filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DowngradeConditions {
    /// The package requests VM safe mode
    pub vm_safe_mode: bool,
    /// The package is debuggable
    pub debuggable: bool,
    /// The dex file has a usable class loader context
    pub has_class_loader_context: bool,
    /// The package only runs its embedded dex code
    pub use_embedded_dex: bool,
    /// The caller asked to ignore profiles
    pub ignore_profile: bool,
}

pub(crate) fn log_adjustment(package_name: &str, old: &str, new: &str, because: &str) -> String {
    if old != new {
        log::info!(
            "Adjusting the compiler filter for '{}' from '{}' to '{}' because {}",
            package_name,
            old,
            new,
            because
        );
    }
    new.to_string()
}

pub(crate) fn upgrade(filter: &str, inputs: &UpgradeInputs<'_>) -> DexoptResult<String> {
    let mut filter = filter.to_string();
    if inputs.is_system_ui {
        let system_ui_filter = inputs.system_ui_filter.as_str();
        if !system_ui_filter.is_empty() {
            if !compiler_filter::is_valid(system_ui_filter) {
                return Err(DexoptError::IllegalState(format!(
                    "Got invalid compiler filter '{}' for System UI",
                    system_ui_filter
                )));
            }
            filter = log_adjustment(
                inputs.package_name,
                &filter,
                system_ui_filter,
                "the package is System UI",
            );
        }
    } else if inputs.is_launcher {
        filter = log_adjustment(
            inputs.package_name,
            &filter,
            "speed-profile",
            "the package is a launcher package",
        );
    }

    if let Some(callback) = &inputs.callback {
        let adjusted = callback(inputs.package_name, &filter, inputs.reason);
        filter = log_adjustment(
            inputs.package_name,
            &filter,
            &adjusted,
            "of AdjustCompilerFilterCallback",
        );
    }
    Ok(filter)
}

/// Apply the downgrade-only steps
pub fn downgrade(package_name: &str, filter: &str, conditions: DowngradeConditions) -> String {
    let mut filter = filter.to_string();

    // The runtime ignores compiled code of debuggable apps, and compiling them tends to run
    // the compiler out of memory.
    if conditions.vm_safe_mode || conditions.debuggable {
        let because = if conditions.vm_safe_mode {
            "the package requests VM safe mode"
        } else {
            "the package is debuggable"
        };
        let safe = compiler_filter::safe_mode_filter(&filter).to_string();
        filter = log_adjustment(package_name, &filter, &safe, because);
    }

    if !conditions.has_class_loader_context && compiler_filter::is_optimized(&filter) {
        filter = log_adjustment(
            package_name,
            &filter,
            "verify",
            "there is no valid class loader context",
        );
    }

    if conditions.use_embedded_dex && compiler_filter::is_optimized(&filter) {
        filter = log_adjustment(
            package_name,
            &filter,
            "verify",
            "the package requests to use embedded dex",
        );
    }

    if conditions.ignore_profile && compiler_filter::is_profile_guided(&filter) {
        filter = log_adjustment(
            package_name,
            &filter,
            "verify",
            "the user requests to ignore the profile",
        );
    }

    filter
}
