//! Primary dex files: the APKs of a package

use dexopt_core::packages::SYSTEM_UID;
use dexopt_core::{
    ArtdResult, ArtifactStore, DexMetadataConfig, DexMetadataPath, FileVisibility, FsPermission,
    OutputProfile, OutputSecureDexMetadataCompanion, PermissionSettings, ProfilePath, SdmSdcPaths,
    TmpProfilePath, WritableProfilePath,
};

use super::result::DexoptStatus;
use super::{DexInfo, DexInfoProvider, DexMetadataInfo, DexoptTarget, Session};
use crate::error::DexoptResult;
use crate::params::DexoptFlags;
use crate::utils::{self, Abi};

/// One APK of the package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryDexInfo {
    /// Absolute path of the APK
    pub dex_path: String,
    /// `None` for the base APK
    pub split_name: Option<String>,
    /// Class loader context, if known
    pub class_loader_context: Option<String>,
    /// Whether the APK has dex code
    pub has_code: bool,
}

impl PrimaryDexInfo {
    /// Name of the profile files of this APK
    pub fn profile_name(&self) -> String {
        profile_name(self.split_name.as_deref())
    }
}

impl DexInfo for PrimaryDexInfo {
    fn dex_path(&self) -> &str {
        &self.dex_path
    }

    fn class_loader_context(&self) -> Option<&str> {
        self.class_loader_context.as_deref()
    }
}

/// "primary" for the base APK, "<split>.split" for a split
pub fn profile_name(split_name: Option<&str>) -> String {
    match split_name {
        None => "primary".to_string(),
        Some(split) => format!("{}.split", split),
    }
}

/// APKs of `pkg`, base first
pub fn primary_dex_info(android_package: &dexopt_core::AndroidPackage) -> Vec<PrimaryDexInfo> {
    android_package
        .splits
        .iter()
        .map(|split| PrimaryDexInfo {
            dex_path: split.path.clone(),
            split_name: split.name.clone(),
            class_loader_context: split.class_loader_context.clone(),
            has_code: split.has_code,
        })
        .collect()
}

/// Profiles shipped with an APK that can seed its reference profile, in priority order
pub fn primary_external_profiles(dex_path: &str) -> Vec<ProfilePath> {
    vec![
        ProfilePath::Prebuilt {
            dex_path: dex_path.to_string(),
        },
        ProfilePath::DexMetadata(DexMetadataPath {
            dex_path: dex_path.to_string(),
        }),
    ]
}

/// Look up the dex metadata file next to `dex_path` and read its config.
///
/// A missing or unreadable file yields no path and the default config.
pub fn dex_metadata_info(
    artd: &dyn ArtifactStore,
    dex_path: &str,
) -> ArtdResult<DexMetadataInfo> {
    let dm = DexMetadataPath {
        dex_path: dex_path.to_string(),
    };
    match artd.get_dm_file_visibility(&dm) {
        Ok(FileVisibility::NotFound) => return Ok(DexMetadataInfo::none()),
        Ok(_) => {}
        Err(err) if err.is_service_specific() => {
            log::error!("Failed to check dm file of '{}': {}", dex_path, err);
            return Ok(DexMetadataInfo::none());
        }
        Err(err) => return Err(err),
    }
    let config = match artd.get_dm_config(&dm) {
        Ok(config) => config,
        Err(err) if err.is_service_specific() => {
            log::error!("Failed to read config of dm file of '{}': {}", dex_path, err);
            DexMetadataConfig::default()
        }
        Err(err) => return Err(err),
    };
    Ok(DexMetadataInfo {
        path: Some(dm),
        config,
    })
}

/// Permission settings for primary artifacts. The files are owned by system and readable
/// by the app through its shared gid, or by everyone when public.
pub fn primary_permission_settings(app_id: i32, can_be_public: bool) -> PermissionSettings {
    PermissionSettings {
        dir_fs_permission: FsPermission {
            uid: SYSTEM_UID,
            gid: SYSTEM_UID,
            is_other_readable: false,
            is_other_executable: true,
        },
        file_fs_permission: FsPermission {
            uid: SYSTEM_UID,
            gid: utils::shared_app_gid(app_id),
            is_other_readable: can_be_public,
            is_other_executable: false,
        },
        se_context: None,
    }
}

/// Reference profile of an APK
pub fn primary_ref_profile(package_name: &str, profile_name: &str) -> ProfilePath {
    ProfilePath::PrimaryRef {
        package_name: package_name.to_string(),
        profile_name: profile_name.to_string(),
    }
}

/// Current profiles of an APK, one per user
pub fn primary_cur_profiles(
    package_name: &str,
    profile_name: &str,
    user_ids: &[u32],
) -> Vec<ProfilePath> {
    user_ids
        .iter()
        .map(|&user_id| ProfilePath::PrimaryCur {
            user_id,
            package_name: package_name.to_string(),
            profile_name: profile_name.to_string(),
        })
        .collect()
}

/// [`DexInfoProvider`] for primary dex files
#[derive(Debug, Default, Clone, Copy)]
pub struct PrimaryDexInfoProvider;

impl DexInfoProvider for PrimaryDexInfoProvider {
    type Info = PrimaryDexInfo;

    fn is_in_dalvik_cache(&self, session: &Session<'_>) -> DexoptResult<bool> {
        Ok(utils::is_in_dalvik_cache(session.pkg, session.artd.as_ref())?)
    }

    fn dex_info_list(&self, session: &Session<'_>) -> Vec<PrimaryDexInfo> {
        primary_dex_info(session.android_package)
    }

    fn is_dexoptable(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> bool {
        if !info.has_code {
            return false;
        }
        if !session.params.flags().contains(DexoptFlags::FOR_SINGLE_SPLIT) {
            return true;
        }
        session.params.split_name() == info.split_name.as_deref()
    }

    fn needs_to_be_shared(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> bool {
        session.android_package.is_shared_library
            || session
                .ctx
                .dex_use
                .is_primary_dex_used_by_other_apps(&session.pkg.package_name, &info.dex_path)
    }

    fn is_dex_file_public(&self, _session: &Session<'_>, _info: &PrimaryDexInfo) -> bool {
        // Installed APKs are always world-readable.
        true
    }

    fn is_dex_file_found(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> DexoptResult<bool> {
        Ok(session.artd.get_dex_file_visibility(&info.dex_path)? != FileVisibility::NotFound)
    }

    fn external_profiles(&self, _session: &Session<'_>, info: &PrimaryDexInfo) -> Vec<ProfilePath> {
        primary_external_profiles(&info.dex_path)
    }

    fn permission_settings(
        &self,
        session: &Session<'_>,
        _info: &PrimaryDexInfo,
        can_be_public: bool,
    ) -> PermissionSettings {
        primary_permission_settings(session.pkg.app_id, can_be_public)
    }

    fn all_abis(&self, session: &Session<'_>, _info: &PrimaryDexInfo) -> DexoptResult<Vec<Abi>> {
        session.ctx.abi_resolver().all_abis(session.pkg)
    }

    fn ref_profile_path(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> ProfilePath {
        primary_ref_profile(&session.pkg.package_name, &info.profile_name())
    }

    fn output_profile(
        &self,
        session: &Session<'_>,
        info: &PrimaryDexInfo,
        is_public: bool,
    ) -> OutputProfile {
        OutputProfile {
            profile_path: TmpProfilePath {
                final_path: WritableProfilePath::PrimaryRef {
                    package_name: session.pkg.package_name.clone(),
                    profile_name: info.profile_name(),
                    is_pre_reboot: session.ctx.is_pre_reboot,
                },
                id: String::new(),
            },
            fs_permission: FsPermission {
                uid: SYSTEM_UID,
                gid: utils::shared_app_gid(session.pkg.app_id),
                is_other_readable: is_public,
                is_other_executable: false,
            },
        }
    }

    fn cur_profiles(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> Vec<ProfilePath> {
        primary_cur_profiles(
            &session.pkg.package_name,
            &info.profile_name(),
            &session.ctx.packages.user_ids(),
        )
    }

    fn dex_metadata_info(
        &self,
        session: &Session<'_>,
        info: &PrimaryDexInfo,
    ) -> DexoptResult<DexMetadataInfo> {
        Ok(dex_metadata_info(session.artd.as_ref(), &info.dex_path)?)
    }

    fn on_dexopt_start(
        &self,
        session: &Session<'_>,
        info: &PrimaryDexInfo,
        is_in_dalvik_cache: bool,
    ) -> DexoptResult<()> {
        // The companion records that the secure dex metadata was verified; the runtime
        // only trusts an SDM file that has one.
        let settings = primary_permission_settings(session.pkg.app_id, true);
        for abi in self.all_abis(session, info)? {
            let output = OutputSecureDexMetadataCompanion {
                sdc_path: SdmSdcPaths {
                    dex_path: info.dex_path.clone(),
                    isa: abi.isa.clone(),
                    is_in_dalvik_cache,
                },
                permission_settings: settings.clone(),
            };
            match session.artd.maybe_create_sdc(&output) {
                Ok(()) => {}
                Err(err) if err.is_service_specific() => log::error!(
                    "Failed to create sdc file for '{}' ({}): {}",
                    info.dex_path,
                    abi.isa,
                    err
                ),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn on_target_result(
        &self,
        session: &Session<'_>,
        target: &DexoptTarget<'_, PrimaryDexInfo>,
        status: DexoptStatus,
    ) -> DexoptResult<()> {
        // New artifacts supersede the secure dex metadata.
        if status == DexoptStatus::Performed && !session.ctx.is_pre_reboot {
            session.artd.delete_sdm_sdc_files(&SdmSdcPaths {
                dex_path: target.dex_info.dex_path.clone(),
                isa: target.isa.clone(),
                is_in_dalvik_cache: target.is_in_dalvik_cache,
            })?;
        }
        Ok(())
    }
}
