//! Dexopt parameters

use bitflags::bitflags;
use dexopt_core::{PriorityClass, SystemProperties};

use crate::compiler_filter;
use crate::error::{DexoptError, DexoptResult};
use crate::reason;

bitflags! {
    /// Flags controlling a dexopt run
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DexoptFlags: u32 {
        /// Dexopt primary dex files
        const FOR_PRIMARY_DEX = 1 << 0;
        /// Dexopt secondary dex files
        const FOR_SECONDARY_DEX = 1 << 1;
        /// Also dexopt the packages' shared-library dependencies
        const SHOULD_INCLUDE_DEPENDENCIES = 1 << 2;
        /// Only downgrade existing artifacts
        const SHOULD_DOWNGRADE = 1 << 3;
        /// Recompile even if the artifacts are up to date
        const FORCE = 1 << 4;
        /// Only dexopt the split named in the params
        const FOR_SINGLE_SPLIT = 1 << 5;
        /// Skip when storage is low
        const SKIP_IF_STORAGE_LOW = 1 << 6;
        /// Ignore profiles even for profile-guided filters
        const IGNORE_PROFILE = 1 << 7;
        /// Merge profiles even if nothing changed
        const FORCE_MERGE_PROFILE = 1 << 8;
        /// Use the requested filter without upgrades
        const FORCE_COMPILER_FILTER = 1 << 9;
    }
}

/// Default flags for `reason`
pub fn default_flags_for_reason(compilation_reason: &str) -> DexoptFlags {
    match compilation_reason {
        r if reason::is_install_reason(r) => DexoptFlags::FOR_PRIMARY_DEX,
        reason::INACTIVE => {
            DexoptFlags::FOR_PRIMARY_DEX
                | DexoptFlags::FOR_SECONDARY_DEX
                | DexoptFlags::SHOULD_DOWNGRADE
        }
        r if reason::is_boot_reason(r) => {
            DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::SHOULD_INCLUDE_DEPENDENCIES
        }
        reason::BG_DEXOPT | reason::PRE_REBOOT_DEXOPT => {
            DexoptFlags::FOR_PRIMARY_DEX
                | DexoptFlags::FOR_SECONDARY_DEX
                | DexoptFlags::SHOULD_INCLUDE_DEPENDENCIES
                | DexoptFlags::SKIP_IF_STORAGE_LOW
        }
        _ => DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FOR_SECONDARY_DEX,
    }
}

/// Parameters of a dexopt operation on one or more packages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexoptParams {
    reason: String,
    compiler_filter: String,
    priority_class: PriorityClass,
    flags: DexoptFlags,
    split_name: Option<String>,
}

impl DexoptParams {
    /// Start building params for `reason`, with the reason's default flags
    pub fn builder(compilation_reason: &str) -> DexoptParamsBuilder {
        DexoptParamsBuilder {
            reason: compilation_reason.to_string(),
            compiler_filter: None,
            priority_class: PriorityClass::NONE,
            flags: default_flags_for_reason(compilation_reason),
            split_name: None,
        }
    }

    /// Compilation reason
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Requested compiler filter
    pub fn compiler_filter(&self) -> &str {
        &self.compiler_filter
    }

    /// Process priority
    pub fn priority_class(&self) -> PriorityClass {
        self.priority_class
    }

    /// Flags
    pub fn flags(&self) -> DexoptFlags {
        self.flags
    }

    /// Split to dexopt when `FOR_SINGLE_SPLIT` is set; `None` is the base APK
    pub fn split_name(&self) -> Option<&str> {
        self.split_name.as_deref()
    }

    /// A builder initialized from these params
    pub fn to_builder(&self) -> DexoptParamsBuilder {
        DexoptParamsBuilder {
            reason: self.reason.clone(),
            compiler_filter: Some(self.compiler_filter.clone()),
            priority_class: self.priority_class,
            flags: self.flags,
            split_name: self.split_name.clone(),
        }
    }
}

/// Builder for [`DexoptParams`]
#[derive(Debug, Clone)]
pub struct DexoptParamsBuilder {
    reason: String,
    compiler_filter: Option<String>,
    priority_class: PriorityClass,
    flags: DexoptFlags,
    split_name: Option<String>,
}

impl DexoptParamsBuilder {
    /// Override the reason's filter
    pub fn compiler_filter(mut self, filter: &str) -> Self {
        self.compiler_filter = Some(filter.to_string());
        self
    }

    /// Override the reason's priority
    pub fn priority_class(mut self, priority_class: PriorityClass) -> Self {
        self.priority_class = priority_class;
        self
    }

    /// Replace the flags selected by `mask` with `value`
    pub fn flags(mut self, value: DexoptFlags, mask: DexoptFlags) -> Self {
        self.flags = (self.flags & !mask) | (value & mask);
        self
    }

    /// Select a single split
    pub fn split_name(mut self, split_name: Option<&str>) -> Self {
        self.split_name = split_name.map(str::to_string);
        self
    }

    /// Validate and fill in reason defaults
    pub fn build(self, props: &dyn SystemProperties) -> DexoptResult<DexoptParams> {
        if self.reason.is_empty() {
            return Err(DexoptError::InvalidArgument("Reason must not be empty".to_string()));
        }

        let compiler_filter = match self.compiler_filter {
            Some(filter) => filter,
            None => reason::compiler_filter_for_reason(props, &self.reason)?,
        };
        if !compiler_filter::is_valid(&compiler_filter) {
            return Err(DexoptError::InvalidArgument(format!(
                "Invalid compiler filter '{}'",
                compiler_filter
            )));
        }

        let priority_class = if self.priority_class == PriorityClass::NONE {
            reason::priority_class_for_reason(&self.reason)
        } else {
            self.priority_class
        };
        if !priority_class.is_valid() {
            return Err(DexoptError::InvalidArgument(format!(
                "Invalid priority class {}",
                priority_class.0
            )));
        }

        let flags = self.flags;
        if !flags.intersects(DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FOR_SECONDARY_DEX) {
            return Err(DexoptError::InvalidArgument(
                "Nothing to dexopt: neither primary nor secondary dex files are selected"
                    .to_string(),
            ));
        }
        if flags.contains(DexoptFlags::SHOULD_DOWNGRADE | DexoptFlags::FORCE) {
            return Err(DexoptError::InvalidArgument(
                "SHOULD_DOWNGRADE and FORCE are mutually exclusive".to_string(),
            ));
        }
        if flags.contains(DexoptFlags::FOR_SINGLE_SPLIT)
            && flags.contains(DexoptFlags::FOR_SECONDARY_DEX)
        {
            return Err(DexoptError::InvalidArgument(
                "FOR_SINGLE_SPLIT requires primary dex files only".to_string(),
            ));
        }
        if self.split_name.is_some() && !flags.contains(DexoptFlags::FOR_SINGLE_SPLIT) {
            return Err(DexoptError::InvalidArgument(
                "A split name requires FOR_SINGLE_SPLIT".to_string(),
            ));
        }

        Ok(DexoptParams {
            reason: self.reason,
            compiler_filter,
            priority_class,
            flags,
            split_name: self.split_name,
        })
    }
}

/// Packages and params of a batch dexopt pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDexoptParams {
    /// Packages in dexopt order
    pub packages: Vec<String>,
    /// Params shared by all packages
    pub dexopt_params: DexoptParams,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexopt_core::MemoryProperties;

    #[test]
    fn test_defaults_from_reason() {
        let props = MemoryProperties::new();
        let params = DexoptParams::builder(reason::BG_DEXOPT).build(&props).unwrap();
        assert_eq!(params.compiler_filter(), "speed-profile");
        assert_eq!(params.priority_class(), PriorityClass::BACKGROUND);
        assert!(params.flags().contains(DexoptFlags::SKIP_IF_STORAGE_LOW));
        assert!(params.flags().contains(DexoptFlags::FOR_SECONDARY_DEX));

        let params = DexoptParams::builder(reason::INSTALL).build(&props).unwrap();
        assert_eq!(params.flags(), DexoptFlags::FOR_PRIMARY_DEX);
    }

    #[test]
    fn test_flag_mask() {
        let props = MemoryProperties::new();
        let params = DexoptParams::builder(reason::CMDLINE)
            .flags(DexoptFlags::FORCE, DexoptFlags::FORCE | DexoptFlags::FOR_SECONDARY_DEX)
            .build(&props)
            .unwrap();
        assert_eq!(params.flags(), DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FORCE);
    }

    #[test]
    fn test_validation() {
        let props = MemoryProperties::new();
        assert!(DexoptParams::builder(reason::CMDLINE)
            .compiler_filter("bogus")
            .build(&props)
            .is_err());
        assert!(DexoptParams::builder(reason::CMDLINE)
            .flags(DexoptFlags::empty(), DexoptFlags::all())
            .build(&props)
            .is_err());
        assert!(DexoptParams::builder(reason::CMDLINE)
            .flags(
                DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FORCE | DexoptFlags::SHOULD_DOWNGRADE,
                DexoptFlags::all()
            )
            .build(&props)
            .is_err());
        assert!(DexoptParams::builder(reason::CMDLINE)
            .split_name(Some("feature"))
            .build(&props)
            .is_err());
        assert!(DexoptParams::builder(reason::CMDLINE)
            .flags(
                DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FOR_SINGLE_SPLIT,
                DexoptFlags::all()
            )
            .split_name(Some("feature"))
            .build(&props)
            .is_ok());
        assert!(DexoptParams::builder(reason::CMDLINE)
            .priority_class(PriorityClass(200))
            .build(&props)
            .is_err());
    }
}
