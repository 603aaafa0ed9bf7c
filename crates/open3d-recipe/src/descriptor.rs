use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub license_ref: String,
    pub description: String,
    pub homepage: String,
    pub source: SourceRef,
    pub settings: Vec<SettingAxis>,
    pub supported_os: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub url: String,
    pub revision: String,
    pub subfolder: Option<String>,
    pub submodules: SubmoduleMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmoduleMode {
    None,
    Shallow,
    Recursive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingAxis {
    Os,
    Compiler,
    BuildType,
    Arch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum BuildType {
    Debug,
    #[default]
    Release,
    RelWithDebInfo,
    MinSizeRel,
}

impl BuildType {
    pub const ALL: [BuildType; 4] = [
        BuildType::Debug,
        BuildType::Release,
        BuildType::RelWithDebInfo,
        BuildType::MinSizeRel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "Debug",
            Self::Release => "Release",
            Self::RelWithDebInfo => "RelWithDebInfo",
            Self::MinSizeRel => "MinSizeRel",
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|bt| bt.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let allowed = Self::ALL.map(BuildType::as_str).join(", ");
                Error::config(
                    "settings.build_type",
                    format!("'{s}' is not one of [{allowed}]"),
                )
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub os: Option<String>,
    pub compiler: Option<String>,
    pub build_type: Option<String>,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub os: String,
    pub compiler: String,
    pub build_type: BuildType,
    pub arch: String,
}

impl Settings {
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "linux" => "Linux",
            "macos" => "Macos",
            "windows" => "Windows",
            "freebsd" => "FreeBSD",
            other => other,
        };
        let compiler = match std::env::consts::OS {
            "macos" => "apple-clang",
            "windows" => "Visual Studio",
            _ => "gcc",
        };
        let arch = match std::env::consts::ARCH {
            "aarch64" => "armv8",
            "x86" => "x86",
            other => other,
        };
        Self {
            os: os.to_string(),
            compiler: compiler.to_string(),
            build_type: BuildType::Release,
            arch: arch.to_string(),
        }
    }

    pub fn resolve(cfg: &SettingsConfig, desc: &PackageDescriptor) -> Result<Self> {
        let mut out = Self::host();
        if let Some(os) = non_empty(cfg.os.as_deref()) {
            out.os = os.to_string();
        }
        if let Some(compiler) = non_empty(cfg.compiler.as_deref()) {
            out.compiler = compiler.to_string();
        }
        if let Some(arch) = non_empty(cfg.arch.as_deref()) {
            out.arch = arch.to_string();
        }
        if let Some(bt) = non_empty(cfg.build_type.as_deref()) {
            out.build_type = bt.parse()?;
        }

        if !desc.supported_os.is_empty()
            && !desc
                .supported_os
                .iter()
                .any(|os| os.eq_ignore_ascii_case(&out.os))
        {
            return Err(Error::config(
                "settings.os",
                format!(
                    "'{}' is not supported by {} (supported: {})",
                    out.os,
                    desc.name,
                    desc.supported_os.join(", ")
                ),
            ));
        }
        Ok(out)
    }
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}
