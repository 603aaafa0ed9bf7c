use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, StepRegistry};
use crate::phases::Module;
use crate::planner::{Plan, Step};
use crate::workspace::WorkspaceConfig;

// Tables a package-manager recipe might carry that this tool deliberately
// does not model.
const UNSUPPORTED_TABLES: [&str; 5] = ["generators", "exports", "tool_requires", "test", "deploy"];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        for table in UNSUPPORTED_TABLES {
            if doc.has_table_path(table) {
                return Err(Error::msg(format!(
                    "config table '{table}' is not supported; use recipe, options, settings, source, cmake and workspace"
                )));
            }
        }

        plan.add(Step {
            id: "core.init".into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}

impl ModuleExec for CoreModule {
    fn register_steps(reg: &mut StepRegistry) -> Result<()> {
        reg.add("core.init", core_init)
    }
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.build_dir = {}", ws.build_dir));
    ctx.log(&format!("workspace.out_dir = {}", ws.out_dir));
    ctx.log(&format!("workspace.clean = {}", ws.clean.as_str()));

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!(
        "workspace.build_dir(abs) = {}",
        paths.build_dir.display()
    ));
    ctx.log(&format!("workspace.out_dir(abs) = {}", paths.out_dir.display()));
    ctx.set_workspace_paths(paths);

    let recipe = ctx.recipe(doc)?;
    let desc = recipe.descriptor();
    ctx.log(&format!("recipe = {}/{}", desc.name, desc.version));
    Ok(())
}
