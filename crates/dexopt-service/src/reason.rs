//! Compilation reasons and their defaults
//!
//! Every reason maps to a compiler filter (overridable through `pm.dexopt.<reason>`), a
//! priority class and a batch concurrency (`pm.dexopt.<reason>.concurrency`).

use dexopt_core::{PriorityClass, SystemProperties};

use crate::compiler_filter;
use crate::error::{DexoptError, DexoptResult};

/// First boot after a factory reset
pub const FIRST_BOOT: &str = "first-boot";
/// First boot after an OTA
pub const BOOT_AFTER_OTA: &str = "boot-after-ota";
/// First boot after a Mainline update
pub const BOOT_AFTER_MAINLINE_UPDATE: &str = "boot-after-mainline-update";
/// Regular app install
pub const INSTALL: &str = "install";
/// Install with a tight deadline
pub const INSTALL_FAST: &str = "install-fast";
/// Bulk install
pub const INSTALL_BULK: &str = "install-bulk";
/// Bulk install of secondary users' apps
pub const INSTALL_BULK_SECONDARY: &str = "install-bulk-secondary";
/// Bulk install that downgrades
pub const INSTALL_BULK_DOWNGRADED: &str = "install-bulk-downgraded";
/// Bulk install of secondary users' apps that downgrades
pub const INSTALL_BULK_SECONDARY_DOWNGRADED: &str = "install-bulk-secondary-downgraded";
/// Background dexopt job
pub const BG_DEXOPT: &str = "bg-dexopt";
/// Downgrade of inactive apps
pub const INACTIVE: &str = "inactive";
/// Shell command
pub const CMDLINE: &str = "cmdline";
/// Pre-reboot dexopt against a staged update
pub const PRE_REBOOT_DEXOPT: &str = "pre-reboot-dexopt";
/// Pseudo-reason for artifacts that must be shared with other apps
pub const SHARED: &str = "shared";

/// Reasons used at boot
pub const REASONS_FOR_BOOT: [&str; 3] = [FIRST_BOOT, BOOT_AFTER_OTA, BOOT_AFTER_MAINLINE_UPDATE];

/// Reasons used at install time
pub const REASONS_FOR_INSTALL: [&str; 6] = [
    INSTALL,
    INSTALL_FAST,
    INSTALL_BULK,
    INSTALL_BULK_SECONDARY,
    INSTALL_BULK_DOWNGRADED,
    INSTALL_BULK_SECONDARY_DOWNGRADED,
];

/// Reasons that operate on a batch of packages
pub const BATCH_DEXOPT_REASONS: [&str; 6] = [
    FIRST_BOOT,
    BOOT_AFTER_OTA,
    BOOT_AFTER_MAINLINE_UPDATE,
    BG_DEXOPT,
    INACTIVE,
    PRE_REBOOT_DEXOPT,
];

/// Whether `reason` is a boot reason
pub fn is_boot_reason(reason: &str) -> bool {
    REASONS_FOR_BOOT.contains(&reason)
}

/// Whether `reason` is an install reason
pub fn is_install_reason(reason: &str) -> bool {
    REASONS_FOR_INSTALL.contains(&reason)
}

fn default_compiler_filter(reason: &str) -> Option<&'static str> {
    Some(match reason {
        FIRST_BOOT | BOOT_AFTER_OTA | BOOT_AFTER_MAINLINE_UPDATE => "verify",
        INSTALL | INSTALL_FAST | INSTALL_BULK => "speed-profile",
        INSTALL_BULK_SECONDARY | INSTALL_BULK_DOWNGRADED | INSTALL_BULK_SECONDARY_DOWNGRADED => {
            "verify"
        }
        BG_DEXOPT | PRE_REBOOT_DEXOPT => "speed-profile",
        INACTIVE | CMDLINE => "verify",
        SHARED => "speed",
        _ => return None,
    })
}

/// The compiler filter for `reason`
pub fn compiler_filter_for_reason(
    props: &dyn SystemProperties,
    reason: &str,
) -> DexoptResult<String> {
    let filter = props
        .get(&format!("pm.dexopt.{}", reason))
        .or_else(|| default_compiler_filter(reason).map(str::to_string))
        .ok_or_else(|| {
            DexoptError::IllegalState(format!("No compiler filter for reason '{}'", reason))
        })?;
    if !compiler_filter::is_valid(&filter) {
        return Err(DexoptError::IllegalState(format!(
            "Got invalid compiler filter '{}' for reason '{}'",
            filter, reason
        )));
    }
    Ok(filter)
}

/// The filter used for artifacts that must be readable by other apps
pub fn compiler_filter_for_shared(props: &dyn SystemProperties) -> DexoptResult<String> {
    let filter = compiler_filter_for_reason(props, SHARED)?;
    if compiler_filter::is_profile_guided(&filter) {
        return Err(DexoptError::IllegalState(format!(
            "Compiler filter for 'shared' must not be profile guided, got '{}'",
            filter
        )));
    }
    Ok(filter)
}

/// The process priority for `reason`
pub fn priority_class_for_reason(reason: &str) -> PriorityClass {
    match reason {
        FIRST_BOOT | BOOT_AFTER_OTA | BOOT_AFTER_MAINLINE_UPDATE => PriorityClass::BOOT,
        INSTALL_FAST => PriorityClass::INTERACTIVE_FAST,
        BG_DEXOPT | INACTIVE | PRE_REBOOT_DEXOPT => PriorityClass::BACKGROUND,
        _ => PriorityClass::INTERACTIVE,
    }
}

/// Number of packages dexopted in parallel for `reason`
pub fn concurrency_for_reason(props: &dyn SystemProperties, reason: &str) -> usize {
    let value = props.get_int(&format!("pm.dexopt.{}.concurrency", reason), 1);
    (value.max(1) as usize).min(num_cpus::get().max(1) * 4)
}
