use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::info;

use crate::app::catalog::{fetch_catalog_or_empty, CatalogSource};
use crate::app::error::AppError;
use crate::app::models::{CatalogEntry, InstalledApp, LocalPackage};
use crate::app::platform::PackageSource;

fn match_key(name: &str) -> String {
    name.to_lowercase()
}

fn by_display_name(a: &InstalledApp, b: &InstalledApp) -> Ordering {
    match_key(&a.display_name)
        .cmp(&match_key(&b.display_name))
        .then_with(|| a.package_name.cmp(&b.package_name))
}

/// Joins packages with catalog entries on case-insensitive display name.
///
/// Matched rows come first, then unmatched ones; each group is sorted by display name.
/// When the catalog lists a name twice the first entry wins.
pub fn merge_installed_apps(packages: Vec<LocalPackage>, catalog: &[CatalogEntry]) -> Vec<InstalledApp> {
    let mut index: HashMap<String, &CatalogEntry> = HashMap::new();
    for entry in catalog.iter().filter(|entry| entry.is_complete()) {
        index.entry(match_key(&entry.app_name)).or_insert(entry);
    }

    let mut matched = Vec::new();
    let mut unmatched = Vec::new();
    for package in packages {
        let remote = index.get(&match_key(&package.display_name)).copied();
        let mut app = InstalledApp::unmatched(package);
        match remote {
            Some(entry) => {
                app.remote_version = Some(entry.latest_version.clone());
                app.remote_app_id = Some(entry.app_id.clone()).filter(|id| !id.is_empty());
                app.download_url = Some(entry.apk_url.clone());
                app.remote_file_size = entry.file_size;
                app.is_matched = true;
                matched.push(app);
            }
            None => unmatched.push(app),
        }
    }

    matched.sort_by(by_display_name);
    unmatched.sort_by(by_display_name);
    matched.extend(unmatched);
    matched
}

pub fn refresh_installed_apps(
    packages: &dyn PackageSource,
    catalog: &dyn CatalogSource,
    trace_id: &str,
) -> Result<Vec<InstalledApp>, AppError> {
    let local = packages.installed_packages()?;
    let remote = fetch_catalog_or_empty(catalog, trace_id);
    let apps = merge_installed_apps(local, &remote);
    info!(
        trace_id = %trace_id,
        apps = apps.len(),
        matched = apps.iter().filter(|app| app.is_matched).count(),
        updates = apps.iter().filter(|app| app.has_update()).count(),
        "installed apps refreshed"
    );
    Ok(apps)
}

/// Looks an app up by display name or package id, ignoring case.
pub fn find_app<'a>(apps: &'a [InstalledApp], name: &str) -> Option<&'a InstalledApp> {
    let key = match_key(name.trim());
    apps.iter()
        .find(|app| match_key(&app.display_name) == key)
        .or_else(|| apps.iter().find(|app| match_key(&app.package_name) == key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(id: &str, name: &str, version: &str) -> LocalPackage {
        LocalPackage {
            package_name: id.to_string(),
            display_name: name.to_string(),
            version_name: Some(version.to_string()),
            version_code: None,
        }
    }

    fn entry(id: &str, name: &str, version: &str) -> CatalogEntry {
        CatalogEntry {
            app_id: id.to_string(),
            app_code: String::new(),
            app_name: name.to_string(),
            latest_version: version.to_string(),
            apk_url: format!("https://cdn.example/{id}.apk"),
            file_size: Some(4096),
            updated_at: String::new(),
        }
    }

    struct FixedPackages(Result<Vec<LocalPackage>, AppError>);

    impl PackageSource for FixedPackages {
        fn installed_packages(&self) -> Result<Vec<LocalPackage>, AppError> {
            self.0.clone()
        }
    }

    struct FixedCatalog(Result<Vec<CatalogEntry>, AppError>);

    impl CatalogSource for FixedCatalog {
        fn fetch(&self) -> Result<Vec<CatalogEntry>, AppError> {
            self.0.clone()
        }
    }

    #[test]
    fn display_name_override_is_what_links_a_package_to_the_catalog() {
        use crate::app::adb::apps::display_name_for;

        let catalog = vec![entry("7", "Moss", "2.0")];
        let mut names = HashMap::new();
        let bare = package("com.polyarc.moss", &display_name_for("com.polyarc.moss", &names), "1.0");
        assert!(!merge_installed_apps(vec![bare], &catalog)[0].is_matched);

        names.insert("com.polyarc.moss".to_string(), "Moss".to_string());
        let named = package("com.polyarc.moss", &display_name_for("com.polyarc.moss", &names), "1.0");
        assert!(merge_installed_apps(vec![named], &catalog)[0].is_matched);
    }

    #[test]
    fn matches_on_case_insensitive_exact_name_only() {
        let packages = vec![
            package("com.a.beat", "beat game", "1.0"),
            package("com.a.beatpro", "Beat Game Pro", "1.0"),
            package("com.a.space", "Space", "1.0"),
        ];
        let catalog = vec![entry("1", "Beat Game", "1.1"), entry("2", "Space Run", "2.0")];
        let apps = merge_installed_apps(packages, &catalog);

        let beat = apps.iter().find(|a| a.package_name == "com.a.beat").expect("beat");
        assert!(beat.is_matched);
        assert_eq!(beat.remote_version.as_deref(), Some("1.1"));
        assert_eq!(beat.remote_app_id.as_deref(), Some("1"));
        assert_eq!(beat.remote_file_size, Some(4096));
        assert!(beat.has_update());

        // No prefix or partial matching.
        assert!(!apps.iter().find(|a| a.package_name == "com.a.beatpro").expect("pro").is_matched);
        assert!(!apps.iter().find(|a| a.package_name == "com.a.space").expect("space").is_matched);
    }

    #[test]
    fn orders_matched_before_unmatched_each_sorted() {
        let packages = vec![
            package("com.z", "zeta", "1"),
            package("com.b", "Bravo", "1"),
            package("com.y", "Yankee", "1"),
            package("com.a", "alpha", "1"),
            package("com.c2", "charlie", "1"),
            package("com.c1", "Charlie", "1"),
        ];
        let catalog = vec![entry("1", "Zeta", "2"), entry("2", "ALPHA", "2")];
        let apps = merge_installed_apps(packages, &catalog);
        let order: Vec<_> = apps.iter().map(|a| a.package_name.as_str()).collect();
        assert_eq!(order, vec!["com.a", "com.z", "com.b", "com.c1", "com.c2", "com.y"]);
        assert!(apps[..2].iter().all(|a| a.is_matched));
        assert!(apps[2..].iter().all(|a| !a.is_matched));
    }

    #[test]
    fn first_duplicate_catalog_entry_wins() {
        let catalog = vec![entry("1", "Beat Game", "1.1"), entry("9", "beat game", "9.9")];
        let apps = merge_installed_apps(vec![package("com.a.beat", "Beat Game", "1.0")], &catalog);
        assert_eq!(apps[0].remote_app_id.as_deref(), Some("1"));
        assert_eq!(apps[0].remote_version.as_deref(), Some("1.1"));
    }

    #[test]
    fn refresh_degrades_when_catalog_fails() {
        let packages = FixedPackages(Ok(vec![package("com.a", "Alpha", "1")]));
        let catalog = FixedCatalog(Err(AppError::network("offline", "t")));
        let apps = refresh_installed_apps(&packages, &catalog, "t").expect("refresh");
        assert_eq!(apps.len(), 1);
        assert!(!apps[0].is_matched);
    }

    #[test]
    fn refresh_fails_when_packages_fail() {
        let packages = FixedPackages(Err(AppError::dependency("no device", "t")));
        let catalog = FixedCatalog(Ok(vec![entry("1", "Alpha", "2")]));
        let err = refresh_installed_apps(&packages, &catalog, "t").expect_err("packages");
        assert_eq!(err.code, "ERR_DEPENDENCY");
    }

    #[test]
    fn find_app_by_name_or_package() {
        let apps = merge_installed_apps(
            vec![package("com.a.beat", "Beat Game", "1.0")],
            &[entry("1", "Beat Game", "1.1")],
        );
        assert!(find_app(&apps, " beat GAME ").is_some());
        assert!(find_app(&apps, "COM.A.BEAT").is_some());
        assert!(find_app(&apps, "beat").is_none());
    }
}
