//! Which differences from the existing artifacts justify a recompile

use dexopt_core::{ArtdResult, DexoptTrigger, FileVisibility};

use crate::params::DexoptFlags;

/// Compute the trigger for one (dex file, ISA).
///
/// `existing_visibility` is consulted only when the artifacts must become public.
pub fn dexopt_trigger<F>(
    flags: DexoptFlags,
    profile_merged: bool,
    needs_to_be_public: bool,
    existing_visibility: F,
) -> ArtdResult<DexoptTrigger>
where
    F: FnOnce() -> ArtdResult<FileVisibility>,
{
    if flags.contains(DexoptFlags::FORCE) {
        return Ok(DexoptTrigger::all());
    }
    if flags.contains(DexoptFlags::SHOULD_DOWNGRADE) {
        return Ok(DexoptTrigger::COMPILER_FILTER_IS_WORSE);
    }

    let mut trigger = DexoptTrigger::COMPILER_FILTER_IS_BETTER
        | DexoptTrigger::PRIMARY_BOOT_IMAGE_BECOMES_USABLE
        | DexoptTrigger::NEED_EXTRACTION;
    if profile_merged {
        trigger |= DexoptTrigger::COMPILER_FILTER_IS_SAME;
    }
    // Typically the app just started being used by other apps. Only a recompile can fix
    // the permissions.
    if needs_to_be_public && existing_visibility()? == FileVisibility::NotOtherReadable {
        trigger |= DexoptTrigger::COMPILER_FILTER_IS_SAME | DexoptTrigger::COMPILER_FILTER_IS_WORSE;
    }
    Ok(trigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexopt_core::ArtdError;

    #[test]
    fn test_base_trigger() {
        let trigger = dexopt_trigger(DexoptFlags::FOR_PRIMARY_DEX, false, false, || {
            panic!("visibility must not be queried")
        })
        .unwrap();
        assert_eq!(
            trigger,
            DexoptTrigger::COMPILER_FILTER_IS_BETTER
                | DexoptTrigger::PRIMARY_BOOT_IMAGE_BECOMES_USABLE
                | DexoptTrigger::NEED_EXTRACTION
        );
    }

    #[test]
    fn test_private_artifacts_that_must_be_public() {
        let trigger = dexopt_trigger(DexoptFlags::FOR_PRIMARY_DEX, false, true, || {
            Ok(FileVisibility::NotOtherReadable)
        })
        .unwrap();
        assert!(trigger.contains(
            DexoptTrigger::COMPILER_FILTER_IS_SAME | DexoptTrigger::COMPILER_FILTER_IS_WORSE
        ));

        let trigger = dexopt_trigger(DexoptFlags::FOR_PRIMARY_DEX, false, true, || {
            Ok(FileVisibility::NotFound)
        })
        .unwrap();
        assert!(!trigger.contains(DexoptTrigger::COMPILER_FILTER_IS_SAME));
    }

    #[test]
    fn test_visibility_error_propagates() {
        let result = dexopt_trigger(DexoptFlags::FOR_PRIMARY_DEX, false, true, || {
            Err(ArtdError::service_specific("boom"))
        });
        assert!(result.is_err());
    }
}
