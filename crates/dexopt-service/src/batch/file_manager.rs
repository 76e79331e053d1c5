//! Enumeration of the files ART manages for a package

use dexopt_core::{
    AndroidPackage, ArtifactStore, ArtifactsLocation, ArtifactsPath, PackageState,
    ProfilePath, RuntimeArtifactsPath, SdmSdcPaths,
};

use crate::compiler_filter;
use crate::dex_use::SecondaryDexInfo;
use crate::dexopter::primary::{
    primary_cur_profiles, primary_dex_info, primary_ref_profile, PrimaryDexInfo,
};
use crate::dexopter::{DexInfo, DexoptContext};
use crate::error::DexoptResult;
use crate::utils::{self, Abi};

/// Compilation reason artd reports when only the vdex is usable
const REASON_VDEX: &str = "vdex";

/// Which dex files to cover
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOptions {
    /// Primary dex files
    pub for_primary_dex: bool,
    /// Secondary dex files
    pub for_secondary_dex: bool,
    /// Drop secondary dex files that are gone and loaders that can no longer load them
    pub exclude_obsolete: bool,
}

impl FileOptions {
    /// Primary and secondary dex files
    pub fn all() -> Self {
        Self {
            for_primary_dex: true,
            for_secondary_dex: true,
            exclude_obsolete: false,
        }
    }
}

/// A dex file with the details needed for artd queries
#[derive(Debug, Clone)]
pub enum DetailedDexInfo {
    /// An APK
    Primary(PrimaryDexInfo),
    /// A secondary dex file
    Secondary(SecondaryDexInfo),
}

impl DetailedDexInfo {
    /// Whether this is an APK
    pub fn is_primary(&self) -> bool {
        matches!(self, DetailedDexInfo::Primary(_))
    }

    /// Absolute path
    pub fn dex_path(&self) -> &str {
        match self {
            DetailedDexInfo::Primary(info) => &info.dex_path,
            DetailedDexInfo::Secondary(info) => &info.dex_path,
        }
    }

    /// Class loader context, if known
    pub fn class_loader_context(&self) -> Option<&str> {
        match self {
            DetailedDexInfo::Primary(info) => DexInfo::class_loader_context(info),
            DetailedDexInfo::Secondary(info) => info.class_loader_context(),
        }
    }
}

/// Paths artifacts may be written to, whether or not they exist
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritableArtifactLists {
    /// Compiled artifacts
    pub artifacts: Vec<ArtifactsPath>,
    /// Secure dex metadata companions
    pub sdm_sdc_files: Vec<SdmSdcPaths>,
    /// Runtime images
    pub runtime_artifacts: Vec<RuntimeArtifactsPath>,
}

/// Artifacts the runtime can currently use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsableArtifactLists {
    /// Full artifacts
    pub artifacts: Vec<ArtifactsPath>,
    /// Artifacts of which only the vdex is usable
    pub vdex_files: Vec<ArtifactsPath>,
    /// Secure dex metadata companions
    pub sdm_sdc_files: Vec<SdmSdcPaths>,
    /// Runtime images that may be usable
    pub runtime_artifacts: Vec<RuntimeArtifactsPath>,
}

/// Reference and current profiles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileLists {
    /// Reference profiles
    pub ref_profiles: Vec<ProfilePath>,
    /// Current profiles
    pub cur_profiles: Vec<ProfilePath>,
}

impl ProfileLists {
    /// Reference profiles followed by current profiles
    pub fn all_profiles(self) -> Vec<ProfilePath> {
        let mut profiles = self.ref_profiles;
        profiles.extend(self.cur_profiles);
        profiles
    }
}

/// Lists the files of a package
pub struct ArtFileManager<'a> {
    ctx: &'a DexoptContext,
    artd: &'a dyn ArtifactStore,
}

impl<'a> ArtFileManager<'a> {
    /// Create a file manager over a pinned artd connection
    pub fn new(ctx: &'a DexoptContext, artd: &'a dyn ArtifactStore) -> Self {
        Self { ctx, artd }
    }

    fn secondary_dex_info(&self, pkg: &PackageState, options: FileOptions) -> Vec<SecondaryDexInfo> {
        if options.exclude_obsolete {
            self.ctx
                .dex_use
                .get_checked_secondary_dex_info(&pkg.package_name, true)
        } else {
            self.ctx.dex_use.get_secondary_dex_info(&pkg.package_name)
        }
    }

    fn secondary_abis(&self, pkg: &PackageState, info: &SecondaryDexInfo) -> DexoptResult<Vec<Abi>> {
        self.ctx
            .abi_resolver()
            .abis_for_names(info.abi_names.iter().map(String::as_str), pkg)
    }

    /// Every (dex file, ABI) pair in scope
    pub fn dex_and_abis(
        &self,
        pkg: &PackageState,
        android_package: &AndroidPackage,
        options: FileOptions,
    ) -> DexoptResult<Vec<(DetailedDexInfo, Abi)>> {
        let mut pairs = Vec::new();
        if options.for_primary_dex {
            let abis = self.ctx.abi_resolver().all_abis(pkg)?;
            for info in primary_dex_info(android_package)
                .into_iter()
                .filter(|info| info.has_code)
            {
                for abi in &abis {
                    pairs.push((DetailedDexInfo::Primary(info.clone()), abi.clone()));
                }
            }
        }
        if options.for_secondary_dex {
            for info in self.secondary_dex_info(pkg, options) {
                for abi in self.secondary_abis(pkg, &info)? {
                    pairs.push((DetailedDexInfo::Secondary(info.clone()), abi));
                }
            }
        }
        Ok(pairs)
    }

    /// Paths where artifacts of the package may be
    pub fn writable_artifacts(
        &self,
        pkg: &PackageState,
        android_package: &AndroidPackage,
        options: FileOptions,
    ) -> DexoptResult<WritableArtifactLists> {
        let mut lists = WritableArtifactLists::default();

        if options.for_primary_dex {
            let is_in_dalvik_cache = utils::is_in_dalvik_cache(pkg, self.artd)?;
            let abis = self.ctx.abi_resolver().all_abis(pkg)?;
            for info in primary_dex_info(android_package) {
                for abi in &abis {
                    lists.artifacts.push(ArtifactsPath::new(
                        &info.dex_path,
                        &abi.isa,
                        is_in_dalvik_cache,
                    ));
                    lists.sdm_sdc_files.push(SdmSdcPaths {
                        dex_path: info.dex_path.clone(),
                        isa: abi.isa.clone(),
                        is_in_dalvik_cache,
                    });
                    lists.runtime_artifacts.push(RuntimeArtifactsPath {
                        package_name: pkg.package_name.clone(),
                        dex_path: info.dex_path.clone(),
                        isa: abi.isa.clone(),
                    });
                }
            }
        }

        if options.for_secondary_dex {
            for info in self.secondary_dex_info(pkg, options) {
                for abi in self.secondary_abis(pkg, &info)? {
                    lists
                        .artifacts
                        .push(ArtifactsPath::new(&info.dex_path, &abi.isa, false));
                }
            }
        }

        Ok(lists)
    }

    /// Artifacts artd reports as usable. Per-file failures are logged and skipped.
    pub fn usable_artifacts(
        &self,
        pkg: &PackageState,
        android_package: &AndroidPackage,
    ) -> DexoptResult<UsableArtifactLists> {
        let mut lists = UsableArtifactLists::default();
        let options = FileOptions {
            exclude_obsolete: true,
            ..FileOptions::all()
        };

        for (info, abi) in self.dex_and_abis(pkg, android_package, options)? {
            let status = match self.artd.get_dexopt_status(
                info.dex_path(),
                &abi.isa,
                info.class_loader_context(),
            ) {
                Ok(status) => status,
                Err(err) if err.is_service_specific() => {
                    log::error!(
                        "Failed to get dexopt status [packageName = {}, dexPath = {}, isa = {}, \
                         classLoaderContext = {}]: {}",
                        pkg.package_name,
                        info.dex_path(),
                        abi.isa,
                        info.class_loader_context().unwrap_or("null"),
                        err
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match status.artifacts_location {
                location @ (ArtifactsLocation::DalvikCache | ArtifactsLocation::NextToDex) => {
                    let artifacts = ArtifactsPath::new(
                        info.dex_path(),
                        &abi.isa,
                        location == ArtifactsLocation::DalvikCache,
                    );
                    if status.compilation_reason == REASON_VDEX {
                        lists.vdex_files.push(artifacts);
                    } else {
                        lists.artifacts.push(artifacts);
                    }
                }
                location @ (ArtifactsLocation::SdmDalvikCache | ArtifactsLocation::SdmNextToDex) => {
                    lists.sdm_sdc_files.push(SdmSdcPaths {
                        dex_path: info.dex_path().to_string(),
                        isa: abi.isa.clone(),
                        is_in_dalvik_cache: location == ArtifactsLocation::SdmDalvikCache,
                    });
                }
                ArtifactsLocation::Dm | ArtifactsLocation::NoneOrError => {}
            }

            // Runtime images only exist for primary dex files and are only used when the
            // artifacts are not fully compiled. Some of the kept ones may be outdated.
            if status.artifacts_location != ArtifactsLocation::NoneOrError
                && info.is_primary()
                && !compiler_filter::is_optimized(&status.compiler_filter)
            {
                lists.runtime_artifacts.push(RuntimeArtifactsPath {
                    package_name: pkg.package_name.clone(),
                    dex_path: info.dex_path().to_string(),
                    isa: abi.isa.clone(),
                });
            }
        }

        Ok(lists)
    }

    /// Profiles of the package
    pub fn profiles(
        &self,
        pkg: &PackageState,
        android_package: &AndroidPackage,
        options: FileOptions,
    ) -> ProfileLists {
        let mut lists = ProfileLists::default();
        if options.for_primary_dex {
            let user_ids = self.ctx.packages.user_ids();
            for info in primary_dex_info(android_package) {
                let profile_name = info.profile_name();
                lists
                    .ref_profiles
                    .push(primary_ref_profile(&pkg.package_name, &profile_name));
                lists.cur_profiles.extend(primary_cur_profiles(
                    &pkg.package_name,
                    &profile_name,
                    &user_ids,
                ));
            }
        }
        if options.for_secondary_dex {
            for info in self.secondary_dex_info(pkg, options) {
                lists.ref_profiles.push(ProfilePath::SecondaryRef {
                    dex_path: info.dex_path.clone(),
                });
                lists.cur_profiles.push(ProfilePath::SecondaryCur {
                    dex_path: info.dex_path,
                });
            }
        }
        lists
    }
}

