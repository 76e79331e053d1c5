//! Helpers shared by the dexopters, the dex use store and the batch orchestrator

use dexopt_core::packages::{FIRST_APPLICATION_UID, FIRST_SHARED_APPLICATION_GID};
use dexopt_core::platform::instruction_set;
use dexopt_core::{
    ArtdResult, ArtifactStore, CopyAndRewriteProfileResult, CopyAndRewriteStatus, DeviceAbis,
    FileVisibility, OutputProfile, PackageRepository, PackageSnapshot, PackageState, ProfilePath,
    SystemProperties,
};
use std::sync::Arc;

use crate::dex_use::DexUseStore;
use crate::error::{DexoptError, DexoptResult};

/// An ABI a package is compiled for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Abi {
    /// ABI name, e.g. `arm64-v8a`
    pub name: String,
    /// Instruction set, e.g. `arm64`
    pub isa: String,
    /// Whether this is the ABI the app is launched with
    pub is_primary: bool,
}

impl Abi {
    fn new(name: &str, isa: &str, is_primary: bool) -> Self {
        Self {
            name: name.to_string(),
            isa: isa.to_string(),
            is_primary,
        }
    }
}

/// Resolves package ABIs against the device's native ABIs and the native bridge
pub struct AbiResolver<'a> {
    device: &'a DeviceAbis,
    props: &'a dyn SystemProperties,
}

impl<'a> AbiResolver<'a> {
    /// Create a resolver
    pub fn new(device: &'a DeviceAbis, props: &'a dyn SystemProperties) -> Self {
        Self { device, props }
    }

    /// All ABIs of `pkg`, primary first
    pub fn all_abis(&self, pkg: &PackageState) -> DexoptResult<Vec<Abi>> {
        let mut abis = vec![self.primary_abi(pkg)?];
        if let Some(secondary) = pkg.secondary_cpu_abi.as_deref() {
            if pkg.primary_cpu_abi.is_none() {
                return Err(DexoptError::IllegalState(format!(
                    "Package '{}' has a secondary ABI but no primary ABI",
                    pkg.package_name
                )));
            }
            if let Some(isa) = instruction_set(secondary).and_then(|isa| self.translated_isa(isa)) {
                abis.push(Abi::new(&self.native_isa_to_abi(&isa)?, &isa, false));
            }
        }
        if abis.len() == 2 && abis[0].isa == abis[1].isa {
            return Err(DexoptError::IllegalState(format!(
                "Duplicate ISA: primary ABI '{}' ('{}'), secondary ABI '{}' ('{}')",
                pkg.primary_cpu_abi.as_deref().unwrap_or(""),
                abis[0].name,
                pkg.secondary_cpu_abi.as_deref().unwrap_or(""),
                abis[1].name
            )));
        }
        Ok(abis)
    }

    /// ABIs with the given native names, the package's primary ABI first
    pub fn abis_for_names<'n, I>(&self, names: I, pkg: &PackageState) -> DexoptResult<Vec<Abi>>
    where
        I: IntoIterator<Item = &'n str>,
    {
        let primary = self.primary_abi(pkg)?;
        let mut abis = Vec::new();
        for name in names {
            if !self.device.is_native_abi(name) {
                return Err(DexoptError::IllegalState(format!(
                    "Non-native ABI '{}'",
                    name
                )));
            }
            let isa = instruction_set(name).ok_or_else(|| {
                DexoptError::IllegalState(format!("Unknown ABI '{}'", name))
            })?;
            abis.push(Abi::new(name, isa, name == primary.name));
        }
        abis.sort_by_key(|abi| !abi.is_primary);
        Ok(abis)
    }

    /// The ABI the app is launched with
    pub fn primary_abi(&self, pkg: &PackageState) -> DexoptResult<Abi> {
        if let Some(primary) = pkg.primary_cpu_abi.as_deref() {
            // Without native bridge support, fall through to the preferred ABI.
            if let Some(isa) = instruction_set(primary).and_then(|isa| self.translated_isa(isa)) {
                return Ok(Abi::new(&self.native_isa_to_abi(&isa)?, &isa, true));
            }
        }
        let preferred = &self.device.preferred;
        if !self.device.is_native_abi(preferred) {
            return Err(DexoptError::IllegalState(format!(
                "Preferred ABI '{}' is not native",
                preferred
            )));
        }
        let isa = instruction_set(preferred)
            .ok_or_else(|| DexoptError::IllegalState(format!("Unknown ABI '{}'", preferred)))?;
        Ok(Abi::new(preferred, isa, true))
    }

    fn translated_isa(&self, isa: &str) -> Option<String> {
        if self.device.native_isas().contains(&isa) {
            return Some(isa.to_string());
        }
        self.props.get(&format!("ro.dalvik.vm.isa.{}", isa))
    }

    fn native_isa_to_abi(&self, isa: &str) -> DexoptResult<String> {
        [&self.device.native_64, &self.device.native_32]
            .into_iter()
            .flatten()
            .find(|abi| instruction_set(abi) == Some(isa))
            .cloned()
            .ok_or_else(|| DexoptError::IllegalState(format!("Non-native isa '{}'", isa)))
    }
}

/// Whether the package has anything ART can dexopt
pub fn is_dexoptable(pkg: &PackageState) -> bool {
    pkg.app_id > 0 && pkg.has_android_package()
}

/// Whether the package should be dexopted; hibernating apps are skipped while their
/// artifacts are subject to deletion
pub fn can_dexopt_package(pkg: &PackageState, packages: &dyn PackageRepository) -> bool {
    is_dexoptable(pkg)
        && !(pkg.hibernating_globally && packages.is_oat_artifact_deletion_enabled())
}

/// Latest of the last recorded use and the last first-install across users
pub fn package_last_active_time_ms(
    pkg: &PackageState,
    dex_use: &DexUseStore,
    user_ids: &[u32],
) -> i64 {
    dex_use
        .get_package_last_used_at_ms(&pkg.package_name)
        .max(pkg.last_first_install_time_ms(user_ids))
}

/// Look up a package or fail with the caller error
pub fn package_state_or_err(
    snapshot: &PackageSnapshot,
    package_name: &str,
) -> DexoptResult<Arc<PackageState>> {
    snapshot
        .get(package_name)
        .cloned()
        .ok_or_else(|| DexoptError::UnknownPackage(package_name.to_string()))
}

/// Whether artifacts of the package's primary dex files live in dalvik-cache
pub fn is_in_dalvik_cache(pkg: &PackageState, artd: &dyn ArtifactStore) -> ArtdResult<bool> {
    let Some(base) = pkg.android_package.as_ref().and_then(|p| p.base_split()) else {
        return Ok(true);
    };
    match artd.is_in_dalvik_cache(&base.path) {
        Ok(value) => Ok(value),
        Err(err) if err.is_service_specific() => {
            // Conservatively use dalvik-cache.
            log::error!("Failed to determine the location of the artifacts: {}", err);
            Ok(true)
        }
        Err(err) => Err(err),
    }
}

/// The shared GID of an app, used as the group of public artifacts
pub fn shared_app_gid(app_id: i32) -> u32 {
    if app_id >= FIRST_APPLICATION_UID {
        (app_id - FIRST_APPLICATION_UID + FIRST_SHARED_APPLICATION_GID) as u32
    } else {
        app_id.max(0) as u32
    }
}

/// Whether `path` equals `prefix` or lies under it. Both must be absolute.
pub fn path_starts_with(path: &str, prefix: &str) -> bool {
    debug_assert!(path.starts_with('/') && prefix.starts_with('/'));
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Replace the extension of the last path component; `new_extension` includes the dot
pub fn replace_file_extension(path: &str, new_extension: &str) -> String {
    let stem = match path.rfind('.') {
        Some(pos) if !path[pos..].contains('/') => &path[..pos],
        _ => path,
    };
    format!("{}{}", stem, new_extension)
}

/// Outcome of resolving a reference profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitProfileResult {
    /// The profile to compile with, if any
    pub profile: Option<ProfilePath>,
    /// Whether the profile may be read by other apps
    pub is_other_readable: bool,
    /// Why external profiles were rejected
    pub external_profile_errors: Vec<String>,
}

/// Use the existing reference profile if usable, otherwise initialize one from the
/// external profiles
pub fn get_or_init_reference_profile(
    artd: &dyn ArtifactStore,
    dex_path: &str,
    ref_profile: &ProfilePath,
    external_profiles: &[ProfilePath],
    enable_embedded_profile: bool,
    init_output: &mut OutputProfile,
) -> ArtdResult<InitProfileResult> {
    match artd.is_profile_usable(ref_profile, dex_path) {
        Ok(true) => match artd.get_profile_visibility(ref_profile) {
            Ok(visibility) => {
                return Ok(InitProfileResult {
                    profile: Some(ref_profile.clone()),
                    is_other_readable: visibility == FileVisibility::OtherReadable,
                    external_profile_errors: Vec::new(),
                })
            }
            Err(err) if err.is_service_specific() => log::error!(
                "Failed to use the existing reference profile {}: {}",
                ref_profile,
                err
            ),
            Err(err) => return Err(err),
        },
        Ok(false) => {}
        Err(err) if err.is_service_specific() => log::error!(
            "Failed to use the existing reference profile {}: {}",
            ref_profile,
            err
        ),
        Err(err) => return Err(err),
    }

    init_reference_profile(
        artd,
        dex_path,
        external_profiles,
        enable_embedded_profile,
        init_output,
    )
}

/// Initialize a reference profile from external profiles only.
///
/// The result carries no user data, so it is always other-readable.
pub fn init_reference_profile(
    artd: &dyn ArtifactStore,
    dex_path: &str,
    external_profiles: &[ProfilePath],
    enable_embedded_profile: bool,
    output: &mut OutputProfile,
) -> ArtdResult<InitProfileResult> {
    let mut errors = Vec::new();

    let mut consider = |name: String,
                        result: ArtdResult<CopyAndRewriteProfileResult>,
                        output: &OutputProfile|
     -> ArtdResult<Option<InitProfileResult>> {
        match result {
            Ok(result) => match result.status {
                CopyAndRewriteStatus::Success => Ok(Some(InitProfileResult {
                    profile: Some(ProfilePath::Tmp(output.profile_path.clone())),
                    is_other_readable: true,
                    external_profile_errors: std::mem::take(&mut errors),
                })),
                CopyAndRewriteStatus::BadProfile => {
                    errors.push(result.error_msg);
                    Ok(None)
                }
                CopyAndRewriteStatus::NoProfile => Ok(None),
            },
            Err(err) if err.is_service_specific() => {
                log::error!("Failed to initialize profile from {}: {}", name, err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    };

    for profile in external_profiles {
        let result = artd.copy_and_rewrite_profile(profile, output, dex_path);
        if let Some(init) = consider(profile.to_string(), result, &*output)? {
            return Ok(init);
        }
    }
    if enable_embedded_profile {
        let result = artd.copy_and_rewrite_embedded_profile(output, dex_path);
        if let Some(init) = consider("embedded profile".to_string(), result, &*output)? {
            return Ok(init);
        }
    }

    Ok(InitProfileResult {
        profile: None,
        is_other_readable: true,
        external_profile_errors: errors,
    })
}
