//! Module discovery - scan directories for `module.json` descriptors

use std::path::{Path, PathBuf};

use super::manifest::ModuleManifest;

/// Descriptor file name inside a module directory
pub const MANIFEST_FILE: &str = "module.json";

/// Scan module directories for descriptors
///
/// Looks for `module.json` files in immediate subdirectories of each search
/// path. Returns `(directory, manifest)` pairs for each valid descriptor; a
/// name found in several paths keeps the first occurrence.
#[must_use]
pub fn discover_modules(dirs: &[PathBuf]) -> Vec<(PathBuf, ModuleManifest)> {
    let mut results: Vec<(PathBuf, ModuleManifest)> = Vec::new();

    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "module directory does not exist, skipping");
            continue;
        }

        let Ok(entries) = std::fs::read_dir(dir) else {
            tracing::warn!(path = %dir.display(), "failed to read module directory");
            continue;
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();

        for path in paths {
            if !path.is_dir() {
                continue;
            }

            let Some(manifest) = load_manifest(&path.join(MANIFEST_FILE)) else {
                continue;
            };

            if results.iter().any(|(_, m)| m.name == manifest.name) {
                tracing::debug!(
                    module = %manifest.name,
                    path = %path.display(),
                    "module already discovered in an earlier path, skipping"
                );
                continue;
            }

            tracing::debug!(module = %manifest.name, path = %path.display(), "discovered module");
            results.push((path, manifest));
        }
    }

    results
}

/// Load and parse a single descriptor
fn load_manifest(path: &Path) -> Option<ModuleManifest> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<ModuleManifest>(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse module manifest"
            );
            None
        }
    }
}

/// Default module search directories
#[must_use]
pub fn default_module_dirs(workdir: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![workdir.join("modules")];

    if let Some(data_dir) = directories::BaseDirs::new().map(|d| d.data_dir().to_path_buf()) {
        dirs.push(data_dir.join("switchyard").join("modules"));
    }

    dirs
}
