//! Secondary dex files: code the app loads at runtime from its data directories

use dexopt_core::packages::PER_USER_RANGE;
use dexopt_core::{
    FileVisibility, FsPermission, OutputProfile, PermissionSettings, ProfilePath, SeContext,
    TmpProfilePath, WritableProfilePath,
};

use super::{DexInfo, DexInfoProvider, DexMetadataInfo, Session};
use crate::dex_use::SecondaryDexInfo;
use crate::error::DexoptResult;
use crate::utils::Abi;

impl DexInfo for SecondaryDexInfo {
    fn dex_path(&self) -> &str {
        &self.dex_path
    }

    fn class_loader_context(&self) -> Option<&str> {
        SecondaryDexInfo::class_loader_context(self)
    }
}

/// Permission settings for secondary artifacts. They live in the app's data directory, belong
/// to the app's uid in that user, and are never readable by other apps.
pub fn secondary_permission_settings(
    user_id: u32,
    app_id: i32,
    seinfo: &str,
) -> PermissionSettings {
    let uid = user_id * PER_USER_RANGE + app_id.max(0) as u32;
    PermissionSettings {
        dir_fs_permission: FsPermission {
            uid,
            gid: uid,
            is_other_readable: false,
            is_other_executable: true,
        },
        file_fs_permission: FsPermission {
            uid,
            gid: uid,
            is_other_readable: false,
            is_other_executable: false,
        },
        se_context: Some(SeContext {
            seinfo: seinfo.to_string(),
            uid,
        }),
    }
}

/// [`DexInfoProvider`] for secondary dex files
#[derive(Debug, Default, Clone, Copy)]
pub struct SecondaryDexInfoProvider;

impl DexInfoProvider for SecondaryDexInfoProvider {
    type Info = SecondaryDexInfo;

    fn is_in_dalvik_cache(&self, _session: &Session<'_>) -> DexoptResult<bool> {
        Ok(false)
    }

    fn dex_info_list(&self, session: &Session<'_>) -> Vec<SecondaryDexInfo> {
        session
            .ctx
            .dex_use
            .get_checked_secondary_dex_info(&session.pkg.package_name, true)
    }

    fn is_dexoptable(&self, _session: &Session<'_>, _info: &SecondaryDexInfo) -> bool {
        true
    }

    // Secondary artifacts are private to the owner, even when other apps load the file.
    fn needs_to_be_shared(&self, _session: &Session<'_>, _info: &SecondaryDexInfo) -> bool {
        false
    }

    fn is_dex_file_public(&self, _session: &Session<'_>, _info: &SecondaryDexInfo) -> bool {
        false
    }

    fn is_dex_file_found(&self, _session: &Session<'_>, info: &SecondaryDexInfo) -> DexoptResult<bool> {
        Ok(info.file_visibility != Some(FileVisibility::NotFound))
    }

    fn external_profiles(&self, _session: &Session<'_>, _info: &SecondaryDexInfo) -> Vec<ProfilePath> {
        Vec::new()
    }

    fn permission_settings(
        &self,
        session: &Session<'_>,
        info: &SecondaryDexInfo,
        _can_be_public: bool,
    ) -> PermissionSettings {
        secondary_permission_settings(info.user_id, session.pkg.app_id, &session.pkg.seinfo)
    }

    fn all_abis(&self, session: &Session<'_>, info: &SecondaryDexInfo) -> DexoptResult<Vec<Abi>> {
        session
            .ctx
            .abi_resolver()
            .abis_for_names(info.abi_names.iter().map(String::as_str), session.pkg)
    }

    fn ref_profile_path(&self, _session: &Session<'_>, info: &SecondaryDexInfo) -> ProfilePath {
        ProfilePath::SecondaryRef {
            dex_path: info.dex_path.clone(),
        }
    }

    fn output_profile(
        &self,
        session: &Session<'_>,
        info: &SecondaryDexInfo,
        _is_public: bool,
    ) -> OutputProfile {
        let uid = info.user_id * PER_USER_RANGE + session.pkg.app_id.max(0) as u32;
        OutputProfile {
            profile_path: TmpProfilePath {
                final_path: WritableProfilePath::SecondaryRef {
                    dex_path: info.dex_path.clone(),
                    is_pre_reboot: session.ctx.is_pre_reboot,
                },
                id: String::new(),
            },
            fs_permission: FsPermission {
                uid,
                gid: uid,
                is_other_readable: false,
                is_other_executable: false,
            },
        }
    }

    fn cur_profiles(&self, _session: &Session<'_>, info: &SecondaryDexInfo) -> Vec<ProfilePath> {
        vec![ProfilePath::SecondaryCur {
            dex_path: info.dex_path.clone(),
        }]
    }

    fn dex_metadata_info(
        &self,
        _session: &Session<'_>,
        _info: &SecondaryDexInfo,
    ) -> DexoptResult<DexMetadataInfo> {
        Ok(DexMetadataInfo::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secondary_permission_settings() {
        let settings = secondary_permission_settings(10, 10_001, "default:targetSdkVersion=34");
        assert_eq!(settings.file_fs_permission.uid, 1_010_001);
        assert_eq!(settings.file_fs_permission.gid, 1_010_001);
        assert!(!settings.file_fs_permission.is_other_readable);
        assert!(!settings.dir_fs_permission.is_other_readable);
        assert_eq!(
            settings.se_context,
            Some(SeContext {
                seinfo: "default:targetSdkVersion=34".to_string(),
                uid: 1_010_001,
            })
        );
    }
}
