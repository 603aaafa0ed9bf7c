use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::driver::DriverState;
use crate::error::{Error, Result};
use crate::recipe::Recipe;
use crate::workspace::RecipeLayout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub package_dir: PathBuf,
    pub libs: Vec<String>,
    pub lib_dirs: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    pub bin_path: PathBuf,
}

pub fn library_name(file_name: &str) -> Option<String> {
    if let Some(stem) = file_name.strip_suffix(".lib") {
        return Some(stem.to_string()).filter(|s| !s.is_empty());
    }

    let stem = [".so", ".a", ".dylib"]
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .or_else(|| versioned_so_stem(file_name))?;
    let name = stem.strip_prefix("lib").unwrap_or(stem);
    Some(name.to_string()).filter(|s| !s.is_empty())
}

// `libfoo.so.1` or `libfoo.so.0.10.0`.
fn versioned_so_stem(file_name: &str) -> Option<&str> {
    let (stem, version) = file_name.split_once(".so.")?;
    version
        .split('.')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        .then_some(stem)
}

// Names of the libraries found directly inside `dirs`, de-duplicated and
// sorted. Directories that do not exist contribute nothing.
pub fn collect_libs(dirs: &[PathBuf]) -> Result<Vec<String>> {
    let mut names = BTreeSet::new();
    for dir in dirs.iter().filter(|d| d.is_dir()) {
        for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::publish(dir, format!("walkdir error: {e}")))?;
            if entry.file_type().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().and_then(library_name) {
                names.insert(name);
            }
        }
    }
    Ok(names.into_iter().collect())
}

pub fn publish(
    recipe: &dyn Recipe,
    layout: &RecipeLayout,
    state: DriverState,
) -> Result<PackageInfo> {
    let package_dir = &layout.package_dir;
    if state != DriverState::Installed {
        return Err(Error::publish(
            package_dir,
            format!("package is not installed (build driver is {state})"),
        ));
    }
    if !package_dir.is_dir() {
        return Err(Error::publish(package_dir, "package directory does not exist"));
    }

    let lib_dirs = package_relative(package_dir, recipe.lib_dirs());
    let include_dirs = package_relative(package_dir, recipe.include_dirs());
    let libs = collect_libs(&lib_dirs)?;
    if libs.is_empty() {
        tracing::warn!(package = %package_dir.display(), "no libraries found in package");
    }

    let desc = recipe.descriptor();
    Ok(PackageInfo {
        name: desc.name.clone(),
        version: desc.version.clone(),
        package_dir: package_dir.clone(),
        libs,
        lib_dirs,
        include_dirs,
        bin_path: package_dir.join(recipe.bin_dir()),
    })
}

fn package_relative(root: &Path, rels: Vec<&str>) -> Vec<PathBuf> {
    rels.into_iter().map(|r| root.join(r)).collect()
}
