use std::collections::BTreeMap;
use std::fmt;

use semver::{Op, VersionReq};
use serde::Serialize;
use sha2::{Digest, Sha256};
use toml::Value;

use crate::descriptor::Settings;
use crate::error::{Error, Result};
use crate::options::{EffectiveOptions, OptionValue};
use crate::recipe::Recipe;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CMakeValue {
    Bool(bool),
    Str(String),
}

impl fmt::Display for CMakeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("ON"),
            Self::Bool(false) => f.write_str("OFF"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for CMakeValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for CMakeValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

pub type Definitions = BTreeMap<String, CMakeValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    pub name: String,
    pub version: VersionReq,
    pub options: BTreeMap<String, OptionValue>,
}

impl Requirement {
    pub fn new(name: &str, version: &str) -> Result<Self> {
        let version = VersionReq::parse(version).map_err(|e| {
            Error::msg(format!(
                "invalid version requirement '{version}' for {name}: {e}"
            ))
        })?;
        Ok(Self {
            name: name.to_string(),
            version,
            options: BTreeMap::new(),
        })
    }

    pub fn with_option(mut self, name: &str, value: OptionValue) -> Self {
        self.options.insert(name.to_string(), value);
        self
    }

    fn pinned(&self) -> bool {
        matches!(self.version.comparators.as_slice(), [c]
            if c.op == Op::Exact && c.minor.is_some() && c.patch.is_some())
    }
}

impl fmt::Display for Requirement {
    // `glew/2.1.0` for pins, `eigen/[>=3.3.7]` for ranges.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pinned() {
            let v = self.version.to_string();
            write!(f, "{}/{}", self.name, v.trim_start_matches('='))
        } else {
            write!(f, "{}/[{}]", self.name, self.version)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedConfig {
    pub options: EffectiveOptions,
    pub settings: Settings,
    pub definitions: Definitions,
    pub requirements: Vec<Requirement>,
}

impl ResolvedConfig {
    pub fn cmake_args(&self) -> Vec<String> {
        self.definitions
            .iter()
            .map(|(k, v)| format!("-D{k}={v}"))
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[settings]\n");
        out.push_str(&format!("os={}\n", self.settings.os));
        out.push_str(&format!("compiler={}\n", self.settings.compiler));
        out.push_str(&format!("build_type={}\n", self.settings.build_type));
        out.push_str(&format!("arch={}\n", self.settings.arch));
        out.push_str("\n[options]\n");
        for (k, v) in self.options.iter() {
            out.push_str(&format!("{k}={v}\n"));
        }
        out.push_str("\n[requires]\n");
        for req in &self.requirements {
            out.push_str(&format!("{req}\n"));
            for (k, v) in &req.options {
                out.push_str(&format!("  {}:{k}={v}\n", req.name));
            }
        }
        out.push_str("\n[definitions]\n");
        for (k, v) in &self.definitions {
            out.push_str(&format!("{k}={v}\n"));
        }
        out
    }

    // SHA-256 over the rendered configuration.
    pub fn signature(&self) -> String {
        hex::encode(Sha256::digest(self.render().as_bytes()))
    }
}

pub fn resolve(
    recipe: &dyn Recipe,
    configured: &BTreeMap<String, Value>,
    settings: &Settings,
) -> Result<ResolvedConfig> {
    let options = recipe.options().effective(configured)?;
    let requirements = recipe.requirements(&options)?;
    let mut definitions = recipe.definitions(&options, settings)?;
    definitions.insert(
        "CMAKE_BUILD_TYPE".into(),
        settings.build_type.as_str().into(),
    );

    tracing::debug!(
        recipe = %recipe.descriptor().name,
        definitions = definitions.len(),
        requirements = requirements.len(),
        "resolved configuration"
    );
    Ok(ResolvedConfig {
        options,
        settings: settings.clone(),
        definitions,
        requirements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirement_renders_pins_and_ranges() {
        let pin = Requirement::new("glew", "=2.1.0").expect("pin");
        let range = Requirement::new("eigen", ">=3.3.7").expect("range");
        assert_eq!(pin.to_string(), "glew/2.1.0");
        assert_eq!(range.to_string(), "eigen/[>=3.3.7]");
    }

    #[test]
    fn cmake_bools_render_on_off() {
        assert_eq!(CMakeValue::from(true).to_string(), "ON");
        assert_eq!(CMakeValue::from(false).to_string(), "OFF");
        assert_eq!(CMakeValue::from("Release").to_string(), "Release");
    }

    #[test]
    fn invalid_version_requirement_is_rejected() {
        assert!(Requirement::new("eigen", ">=three").is_err());
    }
}
