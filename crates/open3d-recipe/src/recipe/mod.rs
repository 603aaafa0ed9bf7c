use std::sync::Arc;

use crate::descriptor::{PackageDescriptor, Settings};
use crate::error::{Error, Result};
use crate::options::{EffectiveOptions, OptionSet};
use crate::patcher::PatchOperation;
use crate::resolver::{Definitions, Requirement};

pub mod open3d;

// Every derivation takes the full effective option record; implementations
// must not keep state between calls.
pub trait Recipe: Send + Sync {
    fn descriptor(&self) -> &PackageDescriptor;

    fn options(&self) -> &OptionSet;

    fn requirements(&self, options: &EffectiveOptions) -> Result<Vec<Requirement>>;

    fn definitions(&self, options: &EffectiveOptions, settings: &Settings) -> Result<Definitions>;

    fn patches(&self) -> Vec<PatchOperation>;

    fn lib_dirs(&self) -> Vec<&'static str> {
        vec!["lib"]
    }

    fn include_dirs(&self) -> Vec<&'static str> {
        vec!["include"]
    }

    fn bin_dir(&self) -> &'static str {
        "bin"
    }
}

pub fn builtin_names() -> &'static [&'static str] {
    &["open3d"]
}

pub fn builtin(name: &str) -> Result<Arc<dyn Recipe>> {
    match name.trim() {
        "open3d" => Ok(Arc::new(open3d::Open3dRecipe::new()?)),
        other => Err(Error::msg(format!(
            "unknown recipe '{other}' (available: {})",
            builtin_names().join(", ")
        ))),
    }
}
