use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::descriptor::SubmoduleMode;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, StepRegistry};
use crate::patcher::SourcePatcher;
use crate::phases::Module;
use crate::phases::util::{
    copy_tree, dir_is_empty, ensure_dir, write_json_pretty, write_marker, write_text,
};
use crate::planner::{Plan, Step};
use crate::publisher;
use crate::workspace::safe_remove_dir_all;

static REVISION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Za-z][0-9A-Za-z._/-]*$").ok());

const FETCH_RECORD: &str = ".recipe-source";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub path: Option<String>,
    pub url: Option<String>,
    pub revision: Option<String>,
    pub submodules: Option<SubmoduleMode>,
}

pub struct RecipeModule;

const STEPS: [(&str, &str, &str); 6] = [
    ("recipe.source", "source", "Fetch and patch sources"),
    ("recipe.requirements", "requirements", "Declare requirements"),
    ("recipe.configure", "configure", "Configure"),
    ("recipe.build", "build", "Build"),
    ("recipe.package", "package", "Install into package"),
    ("recipe.package_info", "package_info", "Publish package info"),
];

impl Module for RecipeModule {
    fn id(&self) -> &'static str {
        "recipe"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table_path("recipe")
    }

    fn plan(&self, _doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let mut prev = "core:initialized";
        for (id, phase, label) in STEPS {
            plan.add(Step {
                id: id.into(),
                label: label.into(),
                module: self.id().into(),
                phase: phase.into(),
                after: vec![prev.into()],
                provides: vec![format!("recipe:{phase}")],
            })?;
            prev = id;
        }
        Ok(())
    }
}

impl ModuleExec for RecipeModule {
    fn register_steps(reg: &mut StepRegistry) -> Result<()> {
        reg.add("recipe.source", source)?;
        reg.add("recipe.requirements", requirements)?;
        reg.add("recipe.configure", configure)?;
        reg.add("recipe.build", build)?;
        reg.add("recipe.package", package)?;
        reg.add("recipe.package_info", package_info)?;
        Ok(())
    }
}

fn source(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let recipe = ctx.recipe(doc)?;
    let layout = ctx.layout(doc)?;
    let cfg: SourceConfig = doc.deserialize_path("source")?.unwrap_or_default();
    let checkout = &layout.source_dir;

    let fetch = match non_empty(cfg.path.as_deref()) {
        Some(local) => {
            let src = ctx.workspace_paths_or_init(doc)?.resolve_config_path(local)?;
            if !src.is_dir() {
                return Err(Error::config(
                    "source.path",
                    format!("{} is not a directory", src.display()),
                ));
            }
            Fetch::Path(src)
        }
        None => {
            let desc = &recipe.descriptor().source;
            let url = non_empty(cfg.url.as_deref()).unwrap_or(desc.url.as_str());
            let revision = non_empty(cfg.revision.as_deref()).unwrap_or(desc.revision.as_str());
            validate_revision(revision)?;
            Fetch::Git {
                url: url.to_string(),
                revision: revision.to_string(),
                submodules: cfg.submodules.unwrap_or(desc.submodules),
            }
        }
    };
    let key = fetch.key();

    let mut reused = false;
    if checkout.is_dir() && !dir_is_empty(checkout)? {
        if read_fetch_record(checkout)?.as_deref() == Some(key.as_str()) {
            ctx.log(&format!("reusing existing checkout {}", checkout.display()));
            reused = true;
        } else {
            ctx.log(&format!(
                "discarding incomplete or stale checkout {}",
                checkout.display()
            ));
            let build_dir = &ctx.workspace_paths_or_init(doc)?.build_dir;
            safe_remove_dir_all(build_dir, checkout)?;
        }
    }
    if !reused {
        fetch.run(ctx, checkout)?;
        write_text(&checkout.join(FETCH_RECORD), &format!("{key}\n"))?;
    }
    let origin = if reused { "existing".to_string() } else { key.clone() };

    let report = SourcePatcher::new(recipe.patches())?.apply(checkout)?;
    for id in &report.applied {
        ctx.log(&format!("applied patch {id}"));
    }
    for id in &report.skipped {
        ctx.log(&format!("patch {id} already applied"));
    }

    write_marker(
        &layout.run_dir,
        "source",
        &[
            ("origin", origin),
            ("fetched_from", key),
            ("patches_applied", report.applied.join(",")),
            ("patches_skipped", report.skipped.join(",")),
        ],
    )
}

enum Fetch {
    Path(PathBuf),
    Git {
        url: String,
        revision: String,
        submodules: SubmoduleMode,
    },
}

impl Fetch {
    fn key(&self) -> String {
        match self {
            Self::Path(src) => format!("path:{}", src.display()),
            Self::Git { url, revision, .. } => format!("git:{url}@{revision}"),
        }
    }

    fn run(&self, ctx: &ExecCtx, checkout: &Path) -> Result<()> {
        match self {
            Self::Path(src) => {
                let copied = copy_tree(src, checkout)?;
                ctx.log(&format!(
                    "copied {copied} files from {} to {}",
                    src.display(),
                    checkout.display()
                ));
                Ok(())
            }
            Self::Git {
                url,
                revision,
                submodules,
            } => clone_checkout(ctx, url, revision, *submodules, checkout),
        }
    }
}

fn clone_checkout(
    ctx: &ExecCtx,
    url: &str,
    revision: &str,
    submodules: SubmoduleMode,
    checkout: &Path,
) -> Result<()> {
    if let Some(parent) = checkout.parent() {
        ensure_dir(parent)?;
    }
    ctx.log(&format!("cloning {url}..."));
    let mut clone = Command::new("git");
    clone.arg("clone").arg(url).arg(checkout);
    ctx.run_cmd(clone, "source")?;

    ctx.log(&format!("checking out {revision}..."));
    let mut co = Command::new("git");
    co.arg("-C").arg(checkout).arg("checkout").arg(revision);
    ctx.run_cmd(co, "source")?;

    let mut sub = Command::new("git");
    sub.arg("-C")
        .arg(checkout)
        .args(["submodule", "update", "--init"]);
    match submodules {
        SubmoduleMode::None => return Ok(()),
        SubmoduleMode::Shallow => sub.args(["--depth", "1"]),
        SubmoduleMode::Recursive => sub.arg("--recursive"),
    };
    ctx.run_cmd(sub, "source")
}

// Present only once fetch, checkout and submodules all succeeded.
fn read_fetch_record(checkout: &Path) -> Result<Option<String>> {
    let path = checkout.join(FETCH_RECORD);
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    Ok(Some(text.trim().to_string()))
}

fn requirements(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let recipe = ctx.recipe(doc)?;
    let resolved = ctx.resolved(doc)?;
    let layout = ctx.layout(doc)?;

    let mut entries = Vec::with_capacity(resolved.requirements.len());
    for req in &resolved.requirements {
        ctx.log(&format!("requires {req}"));
        for (k, v) in &req.options {
            ctx.log(&format!("  {}:{k}={v}", req.name));
        }
        entries.push(serde_json::json!({
            "reference": req.to_string(),
            "name": req.name,
            "version": req.version.to_string(),
            "options": req.options,
        }));
    }

    let desc = recipe.descriptor();
    write_json_pretty(
        &layout.run_dir.join("requirements.json"),
        &serde_json::json!({
            "package": format!("{}/{}", desc.name, desc.version),
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "requires": entries,
        }),
    )
}

fn configure(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let resolved = ctx.resolved(doc)?;
    let driver = ctx.driver(doc)?;
    for (k, v) in resolved.options.iter() {
        ctx.log(&format!("option {k}={v}"));
    }

    driver.configure(ctx, resolved)?;

    let run_dir = &driver.layout().run_dir;
    write_text(&run_dir.join("resolved.txt"), &resolved.render())?;
    write_marker(run_dir, "configure", &[("signature", resolved.signature())])
}

fn build(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let driver = ctx.driver(doc)?;
    driver.build(ctx)?;
    write_marker(&driver.layout().run_dir, "build", &[])
}

fn package(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let driver = ctx.driver(doc)?;
    driver.install(ctx)?;
    let layout = driver.layout();
    write_marker(
        &layout.run_dir,
        "package",
        &[("package_dir", layout.package_dir.display().to_string())],
    )
}

fn package_info(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let recipe = ctx.recipe(doc)?;
    let driver = ctx.driver(doc)?;
    let info = publisher::publish(recipe.as_ref(), driver.layout(), driver.state())?;

    ctx.log(&format!("libs = [{}]", info.libs.join(", ")));
    ctx.log(&format!("PATH += {}", info.bin_path.display()));
    write_json_pretty(&driver.layout().run_dir.join("package_info.json"), &info)?;
    ctx.set_published(info)
}

fn validate_revision(rev: &str) -> Result<()> {
    let ok = REVISION.as_ref().is_some_and(|re| re.is_match(rev));
    if ok {
        Ok(())
    } else {
        Err(Error::config(
            "source.revision",
            format!("'{rev}' is not a valid git revision"),
        ))
    }
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}
