use std::cell::Cell;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;

use crate::descriptor::BuildType;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::resolver::ResolvedConfig;
use crate::workspace::RecipeLayout;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CMakeConfig {
    pub command: Vec<String>,
    pub generator: Option<String>,
    // Parallel build jobs; 0 uses the CPU count.
    pub jobs: usize,
    pub prefix_paths: Vec<String>,
}

impl Default for CMakeConfig {
    fn default() -> Self {
        Self {
            command: vec!["cmake".into()],
            generator: None,
            jobs: 0,
            prefix_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DriverState {
    Unconfigured,
    Configured,
    Built,
    Installed,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Built => "built",
            Self::Installed => "installed",
        })
    }
}

#[derive(Debug)]
pub struct BuildDriver {
    program: String,
    leading_args: Vec<String>,
    generator: Option<String>,
    jobs: usize,
    prefix_paths: Vec<PathBuf>,
    build_type: BuildType,
    layout: RecipeLayout,
    state: Cell<DriverState>,
}

impl BuildDriver {
    pub fn new(
        cfg: &CMakeConfig,
        layout: RecipeLayout,
        build_type: BuildType,
        prefix_paths: Vec<PathBuf>,
    ) -> Result<Self> {
        let Some((program, rest)) = cfg.command.split_first() else {
            return Err(Error::config("cmake.command", "must name a program"));
        };
        if program.trim().is_empty() {
            return Err(Error::config("cmake.command", "program is empty"));
        }
        let jobs = if cfg.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            cfg.jobs
        };
        Ok(Self {
            program: program.clone(),
            leading_args: rest.to_vec(),
            generator: cfg
                .generator
                .as_deref()
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(ToOwned::to_owned),
            jobs,
            prefix_paths,
            build_type,
            layout,
            state: Cell::new(DriverState::Unconfigured),
        })
    }

    pub fn state(&self) -> DriverState {
        self.state.get()
    }

    pub fn layout(&self) -> &RecipeLayout {
        &self.layout
    }

    fn tool(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd
    }

    pub fn configure_command(&self, resolved: &ResolvedConfig) -> Command {
        let mut cmd = self.tool();
        cmd.arg("-S")
            .arg(&self.layout.source_dir)
            .arg("-B")
            .arg(&self.layout.cmake_build_dir);
        if let Some(generator) = &self.generator {
            cmd.arg("-G").arg(generator);
        }
        cmd.args(resolved.cmake_args());
        cmd.arg(format!(
            "-DCMAKE_INSTALL_PREFIX={}",
            self.layout.package_dir.display()
        ));
        if !self.prefix_paths.is_empty() {
            let joined = self
                .prefix_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(";");
            cmd.arg(format!("-DCMAKE_PREFIX_PATH={joined}"));
        }
        cmd
    }

    pub fn build_command(&self) -> Command {
        let mut cmd = self.tool();
        cmd.arg("--build")
            .arg(&self.layout.cmake_build_dir)
            .args(["--config", self.build_type.as_str()])
            .arg("--parallel")
            .arg(self.jobs.to_string());
        cmd
    }

    pub fn install_command(&self) -> Command {
        let mut cmd = self.tool();
        cmd.arg("--install")
            .arg(&self.layout.cmake_build_dir)
            .args(["--config", self.build_type.as_str()])
            .arg("--prefix")
            .arg(&self.layout.package_dir);
        cmd
    }

    // Generates the build tree. A driver that already configured does
    // nothing.
    pub fn configure(&self, ctx: &ExecCtx, resolved: &ResolvedConfig) -> Result<()> {
        if self.state() >= DriverState::Configured {
            tracing::debug!(state = %self.state(), "already configured");
            return Ok(());
        }
        if !self.layout.source_dir.is_dir() {
            return Err(Error::msg(format!(
                "source tree {} does not exist; run the source phase first",
                self.layout.source_dir.display()
            )));
        }
        fs::create_dir_all(&self.layout.cmake_build_dir).map_err(|e| {
            Error::msg(format!(
                "failed to create {}: {e}",
                self.layout.cmake_build_dir.display()
            ))
        })?;
        ctx.run_cmd(self.configure_command(resolved), "configure")?;
        self.state.set(DriverState::Configured);
        Ok(())
    }

    pub fn build(&self, ctx: &ExecCtx) -> Result<()> {
        self.require("build", &[DriverState::Configured, DriverState::Built])?;
        ctx.run_cmd(self.build_command(), "build")?;
        self.state.set(DriverState::Built);
        Ok(())
    }

    pub fn install(&self, ctx: &ExecCtx) -> Result<()> {
        self.require("install", &[DriverState::Built, DriverState::Installed])?;
        ctx.run_cmd(self.install_command(), "install")?;
        self.state.set(DriverState::Installed);
        Ok(())
    }

    fn require(&self, phase: &str, allowed: &[DriverState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            return Ok(());
        }
        Err(Error::msg(format!(
            "cannot run the {phase} phase: build driver is {state}"
        )))
    }
}
