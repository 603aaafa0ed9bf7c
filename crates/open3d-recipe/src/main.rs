use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use open3d_recipe::config::{self, ConfigDoc};
use open3d_recipe::descriptor::{Settings, SettingsConfig};
use open3d_recipe::driver::{BuildDriver, CMakeConfig};
use open3d_recipe::executor::{self, ExecCtx, RecipeSection, StdoutSink, render_command};
use open3d_recipe::options::{apply_cli_overrides, configured_values};
use open3d_recipe::{Result, phases, recipe, resolver, workspace};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Format of diagnostic logs on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a build definition and print the ordered steps
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Print the resolved build flags, requirements and signature
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Override an option (KEY=VALUE); may be repeated
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
    /// Print the recipe's descriptor and declared options
    Info {
        /// Path to a build definition TOML
        build: PathBuf,
    },
    /// Fetch, patch, configure, build and package
    Run {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Override an option (KEY=VALUE); may be repeated
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
        /// Walk the plan and print tool invocations without running anything
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_format);

    match args.cmd {
        Command::Plan { build, dot } => cmd_plan(&build, dot),
        Command::Resolve { build, overrides } => cmd_resolve(&build, &overrides),
        Command::Info { build } => cmd_info(&build),
        Command::Run {
            build,
            overrides,
            dry_run,
        } => cmd_run(&build, &overrides, dry_run),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load(path: &Path, overrides: &[String]) -> Result<ConfigDoc> {
    let mut doc = config::load(path)?;
    apply_cli_overrides(&mut doc, overrides)?;
    Ok(doc)
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = load(path, &[])?;
    let plan = phases::plan_for(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }
    for (i, step) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<8} {:<13}  {}",
            i + 1,
            step.id,
            step.module,
            step.phase,
            step.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path, overrides: &[String]) -> Result<()> {
    let doc = load(path, overrides)?;
    let recipe = recipe_for(&doc)?;
    let settings_cfg: SettingsConfig = doc.deserialize_path("settings")?.unwrap_or_default();
    let settings = Settings::resolve(&settings_cfg, recipe.descriptor())?;
    let resolved = resolver::resolve(recipe.as_ref(), &configured_values(&doc)?, &settings)?;

    print!("{}", resolved.render());
    println!("\nsignature={}", resolved.signature());
    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let doc = load(path, &[])?;
    let recipe = recipe_for(&doc)?;
    let desc = recipe.descriptor();

    println!("{}/{}", desc.name, desc.version);
    println!("  description: {}", desc.description);
    println!("  license: {}", desc.license_ref);
    println!("  homepage: {}", desc.homepage);
    println!(
        "  source: {} @ {}{}",
        desc.source.url,
        desc.source.revision,
        desc.source
            .subfolder
            .as_deref()
            .map(|s| format!(" -> {s}/"))
            .unwrap_or_default()
    );
    println!("  options:");
    for opt in recipe.options().iter() {
        let allowed = opt
            .allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("|");
        println!(
            "    {:<20} default={:<6} [{allowed}]  {}",
            opt.name,
            opt.default.to_string(),
            opt.description
        );
    }
    Ok(())
}

fn cmd_run(path: &Path, overrides: &[String], dry_run: bool) -> Result<()> {
    let doc = load(path, overrides)?;
    let plan = phases::plan_for(&doc)?;
    let reg = executor::builtin_registry()?;
    let mut ctx = ExecCtx::new(dry_run, Arc::new(StdoutSink::default()));

    executor::execute_plan(&doc, &plan, &reg, &mut ctx)?;
    if dry_run && plan.get("recipe.configure").is_some() {
        print_tool_invocations(&doc, &ctx)?;
    }
    Ok(())
}

// Uses the configured workspace without creating or cleaning it.
fn print_tool_invocations(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<()> {
    let recipe = ctx.recipe(doc)?;
    let resolved = ctx.resolved(doc)?;
    let ws_cfg: workspace::WorkspaceConfig =
        doc.deserialize_path("workspace")?.unwrap_or_default();
    let ws = workspace::load_paths(&ws_cfg)?;
    let cmake: CMakeConfig = doc.deserialize_path("cmake")?.unwrap_or_default();
    let prefix_paths = cmake
        .prefix_paths
        .iter()
        .map(|p| ws.resolve_config_path(p))
        .collect::<Result<Vec<_>>>()?;
    let layout = ws.layout(recipe.descriptor(), resolved.settings.build_type);
    let driver = BuildDriver::new(&cmake, layout, resolved.settings.build_type, prefix_paths)?;

    println!("would run:");
    for cmd in [
        driver.configure_command(resolved),
        driver.build_command(),
        driver.install_command(),
    ] {
        println!("  {}", render_command(&cmd));
    }
    Ok(())
}

fn recipe_for(doc: &ConfigDoc) -> Result<Arc<dyn recipe::Recipe>> {
    let section: RecipeSection = doc.deserialize_path("recipe")?.unwrap_or_default();
    recipe::builtin(&section.name)
}
