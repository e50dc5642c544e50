use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use zip::ZipArchive;

/// Local file header signature every APK (ZIP) starts with.
pub const APK_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

const APK_EXTENSION: &str = ".apk";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LocalArtifact {
    pub file_name: String,
    pub path: String,
    pub size_bytes: u64,
}

fn replace_hostile_chars(value: &str, extra: &[char], replacement: char) -> String {
    value
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_control()
                || matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
                || extra.contains(&ch)
            {
                replacement
            } else {
                ch
            }
        })
        .collect()
}

/// Spaces and dots become underscores so the name part never collides with the version part.
pub fn sanitize_app_name(app_name: &str) -> String {
    replace_hostile_chars(app_name, &[' ', '.'], '_')
}

/// The version part never holds `_`, which is what separates it from the name.
pub fn sanitize_version(version: &str) -> String {
    replace_hostile_chars(version, &[' ', '_'], '-')
}

pub fn artifact_file_name(app_name: &str, version: &str) -> String {
    format!(
        "{}_{}{APK_EXTENSION}",
        sanitize_app_name(app_name),
        sanitize_version(version)
    )
}

/// True for `{sanitized}_{other version}.apk`; `{sanitized}_Pro_1.0.apk` belongs to another app.
pub fn is_stale_artifact(file_name: &str, sanitized_name: &str, keep_file_name: &str) -> bool {
    if file_name == keep_file_name {
        return false;
    }
    let Some(rest) = file_name.strip_prefix(&format!("{sanitized_name}_")) else {
        return false;
    };
    let Some(version) = rest.strip_suffix(APK_EXTENSION) else {
        return false;
    };
    !version.is_empty() && !version.contains('_')
}

pub fn remove_stale_artifacts(dir: &Path, app_name: &str, keep_file_name: &str) -> Vec<PathBuf> {
    let sanitized = sanitize_app_name(app_name);
    let mut removed = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "failed to scan download dir");
            return removed;
        }
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !is_stale_artifact(&file_name, &sanitized, keep_file_name) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(file = %file_name, "removed previous version");
                removed.push(path);
            }
            Err(err) => warn!(file = %file_name, error = %err, "failed to remove previous version"),
        }
    }
    removed
}

pub fn has_apk_signature(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let read = file.read(&mut header[filled..])?;
        if read == 0 {
            return Ok(false);
        }
        filled += read;
    }
    Ok(header == APK_MAGIC)
}

/// Opens the central directory; returns the number of entries.
pub fn inspect_archive(path: &Path) -> Result<usize, String> {
    let file = File::open(path).map_err(|err| format!("Failed to open APK: {err}"))?;
    let archive = ZipArchive::new(file).map_err(|err| format!("Invalid APK: {err}"))?;
    Ok(archive.len())
}

pub fn list_local_artifacts(dir: &Path) -> Vec<LocalArtifact> {
    let mut artifacts = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|entry| {
                    entry
                        .file_name()
                        .to_string_lossy()
                        .to_lowercase()
                        .ends_with(APK_EXTENSION)
                })
                .filter_map(|entry| {
                    let metadata = entry.metadata().ok()?;
                    if !metadata.is_file() {
                        return None;
                    }
                    Some(LocalArtifact {
                        file_name: entry.file_name().to_string_lossy().to_string(),
                        path: entry.path().to_string_lossy().to_string(),
                        size_bytes: metadata.len(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    artifacts.sort_by_key(|artifact| artifact.file_name.to_lowercase());
    artifacts
}

pub fn format_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let size = size_bytes as f64;
    if size < KB {
        format!("{size_bytes} B")
    } else if size < KB * KB {
        format!("{:.1} KB", size / KB)
    } else if size < KB * KB * KB {
        format!("{:.1} MB", size / (KB * KB))
    } else {
        format!("{:.1} GB", size / (KB * KB * KB))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    /// A small but structurally valid APK (ZIP) payload of at least `min_len` bytes.
    pub(crate) fn sample_apk_bytes(min_len: usize) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);
        zip.start_file("AndroidManifest.xml", options).expect("start");
        zip.write_all(&vec![b'x'; min_len]).expect("write");
        zip.finish().expect("finish").into_inner()
    }

    #[test]
    fn builds_artifact_names() {
        assert_eq!(artifact_file_name("Beat Game", "1.4.0"), "Beat_Game_1.4.0.apk");
        assert_eq!(artifact_file_name("My.App v2", "2.0 beta"), "My_App_v2_2.0-beta.apk");
        assert_eq!(artifact_file_name("Moss", "1.0_rc/2"), "Moss_1.0-rc-2.apk");
        assert_eq!(artifact_file_name("a/b", "1.0"), "a_b_1.0.apk");
    }

    #[test]
    fn stale_detection_ignores_other_apps() {
        assert!(is_stale_artifact("Beat_Game_1.3.0.apk", "Beat_Game", "Beat_Game_1.4.0.apk"));
        assert!(!is_stale_artifact("Beat_Game_1.4.0.apk", "Beat_Game", "Beat_Game_1.4.0.apk"));
        assert!(!is_stale_artifact("Beat_Game_Pro_1.0.apk", "Beat_Game", "Beat_Game_1.4.0.apk"));
        assert!(!is_stale_artifact("Beat_Game_1.3.0.apk.part", "Beat_Game", "Beat_Game_1.4.0.apk"));
        assert!(!is_stale_artifact("Other_1.0.apk", "Beat_Game", "Beat_Game_1.4.0.apk"));
    }

    #[test]
    fn removes_only_previous_versions() {
        let tmp = TempDir::new().expect("tmp");
        for name in ["Beat_Game_1.3.0.apk", "Beat_Game_1.2.apk", "Beat_Game_Pro_1.0.apk", "Beat_Game_1.4.0.apk"] {
            fs::write(tmp.path().join(name), b"x").expect("write");
        }
        let removed = remove_stale_artifacts(tmp.path(), "Beat Game", "Beat_Game_1.4.0.apk");
        assert_eq!(removed.len(), 2);
        assert!(tmp.path().join("Beat_Game_1.4.0.apk").exists());
        assert!(tmp.path().join("Beat_Game_Pro_1.0.apk").exists());
        assert!(!tmp.path().join("Beat_Game_1.3.0.apk").exists());
    }

    #[test]
    fn prerelease_versions_with_spaces_are_cleaned_up() {
        let tmp = TempDir::new().expect("tmp");
        let old = artifact_file_name("App", "2.0 beta");
        assert_eq!(old, "App_2.0-beta.apk");
        fs::write(tmp.path().join(&old), b"x").expect("write");
        let keep = artifact_file_name("App", "2.1");
        fs::write(tmp.path().join(&keep), b"x").expect("write");

        let removed = remove_stale_artifacts(tmp.path(), "App", &keep);
        assert_eq!(removed, vec![tmp.path().join(&old)]);
        assert!(tmp.path().join(&keep).exists());
    }

    #[test]
    fn checks_signature_and_archive() {
        let tmp = TempDir::new().expect("tmp");
        let good = tmp.path().join("good.apk");
        fs::write(&good, sample_apk_bytes(64)).expect("write");
        assert!(has_apk_signature(&good).expect("read"));
        assert_eq!(inspect_archive(&good).expect("archive"), 1);

        let html = tmp.path().join("html.apk");
        fs::write(&html, b"<html>not found</html>").expect("write");
        assert!(!has_apk_signature(&html).expect("read"));
        assert!(inspect_archive(&html).is_err());

        let short = tmp.path().join("short.apk");
        fs::write(&short, b"PK").expect("write");
        assert!(!has_apk_signature(&short).expect("read"));
    }

    #[test]
    fn lists_artifacts_sorted() {
        let tmp = TempDir::new().expect("tmp");
        fs::write(tmp.path().join("b_1.apk"), b"12").expect("write");
        fs::write(tmp.path().join("A_1.APK"), b"1").expect("write");
        fs::write(tmp.path().join("notes.txt"), b"1").expect("write");
        let artifacts = list_local_artifacts(tmp.path());
        let names: Vec<_> = artifacts.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, vec!["A_1.APK", "b_1.apk"]);
        assert_eq!(artifacts[1].size_bytes, 2);
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
