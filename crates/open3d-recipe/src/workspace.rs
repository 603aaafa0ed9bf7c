use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::descriptor::{BuildType, PackageDescriptor};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Out,
    All,
}

impl CleanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Build => "build",
            Self::Out => "out",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root_dir: String,
    pub build_dir: String,
    pub out_dir: String,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: ".".into(),
            build_dir: "build".into(),
            out_dir: "out".into(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl WorkspacePaths {
    // Relative paths are rooted at the workspace root; absolute ones are kept.
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::msg("empty path"));
        }
        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() {
            pb
        } else {
            self.root.join(pb)
        })
    }

    pub fn layout(&self, desc: &PackageDescriptor, build_type: BuildType) -> RecipeLayout {
        let pkg_ref = format!("{}-{}", desc.name, desc.version);
        let work = self.build_dir.join(&pkg_ref);
        let source_root = work.join("src");
        let source_dir = match desc.source.subfolder.as_deref() {
            Some(sub) => source_root.join(sub),
            None => source_root.clone(),
        };
        RecipeLayout {
            source_dir,
            cmake_build_dir: work.join(format!(
                "cmake-build-{}",
                build_type.as_str().to_ascii_lowercase()
            )),
            package_dir: self.out_dir.join(&pkg_ref).join("package"),
            run_dir: self.out_dir.join(&pkg_ref).join("recipe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeLayout {
    pub source_dir: PathBuf,
    pub cmake_build_dir: PathBuf,
    pub package_dir: PathBuf,
    pub run_dir: PathBuf,
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = join_user_path(&cwd, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let out_dir = resolve_user_dir(&root, &cfg.out_dir)?;
    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;

    if matches!(cfg.clean, CleanMode::Build | CleanMode::All) {
        safe_remove_dir_all(&paths.root, &paths.build_dir)?;
    }
    if matches!(cfg.clean, CleanMode::Out | CleanMode::All) {
        safe_remove_dir_all(&paths.root, &paths.out_dir)?;
    }

    for dir in [&paths.build_dir, &paths.out_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    join_user_path(root, p)
}

fn join_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

// Removes `dir`, refusing anything outside `root` or `root` itself.
pub fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (not inside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}

pub fn validate_rel_like_path(p: &Path) -> Result<()> {
    if p.as_os_str().is_empty() {
        return Err(Error::msg("path is empty"));
    }
    if p.is_absolute() || p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::msg(format!(
            "path '{}' must be relative and must not contain '..'",
            p.display()
        )));
    }
    Ok(())
}
