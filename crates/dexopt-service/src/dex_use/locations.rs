//! Data directories where a package may keep secondary dex files

use dexopt_core::PackageState;
use rustc_hash::FxHashMap;

/// Credential-encrypted data directory of `package_name` for `user_id`
pub fn ce_data_dir(storage_uuid: Option<&str>, user_id: u32, package_name: &str) -> String {
    match storage_uuid {
        None => format!("/data/user/{}/{}", user_id, package_name),
        Some(uuid) => format!("/mnt/expand/{}/user/{}/{}", uuid, user_id, package_name),
    }
}

/// Device-encrypted data directory of `package_name` for `user_id`
pub fn de_data_dir(storage_uuid: Option<&str>, user_id: u32, package_name: &str) -> String {
    match storage_uuid {
        None => format!("/data/user_de/{}/{}", user_id, package_name),
        Some(uuid) => format!("/mnt/expand/{}/user_de/{}/{}", uuid, user_id, package_name),
    }
}

struct CachedLocations {
    storage_uuid: Option<String>,
    locations: Vec<String>,
}

/// Caches the CE and DE directories per (package, user). An entry is recomputed when the
/// package moves to another volume.
#[derive(Default)]
pub(crate) struct SecondaryDexLocations {
    cache: FxHashMap<(String, u32), CachedLocations>,
}

impl SecondaryDexLocations {
    pub(crate) fn locations(&mut self, pkg: &PackageState, user_id: u32) -> &[String] {
        let Some(android_package) = pkg.android_package.as_ref() else {
            return &[];
        };
        let storage_uuid = android_package.storage_uuid.clone();
        let key = (pkg.package_name.clone(), user_id);

        let stale = self
            .cache
            .get(&key)
            .map(|cached| cached.storage_uuid != storage_uuid)
            .unwrap_or(true);
        if stale {
            let uuid = storage_uuid.as_deref();
            let locations = vec![
                ce_data_dir(uuid, user_id, &pkg.package_name),
                de_data_dir(uuid, user_id, &pkg.package_name),
            ];
            self.cache.insert(
                key.clone(),
                CachedLocations {
                    storage_uuid,
                    locations,
                },
            );
        }
        self.cache
            .get(&key)
            .map(|cached| cached.locations.as_slice())
            .unwrap_or(&[])
    }
}
