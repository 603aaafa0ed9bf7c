use std::cell::OnceCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::descriptor::{Settings, SettingsConfig};
use crate::driver::{BuildDriver, CMakeConfig};
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::options::configured_values;
use crate::planner::Plan;
use crate::publisher::PackageInfo;
use crate::recipe::{self, Recipe};
use crate::resolver::{self, ResolvedConfig};
use crate::workspace::{CleanMode, RecipeLayout, WorkspaceConfig, WorkspacePaths};

pub type StepExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    StepStarted {
        id: String,
    },
    StepLog {
        id: String,
        line: String,
    },
    StepFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    steps_started: usize,
    steps_ok: usize,
    steps_failed: usize,
    log_lines: usize,
    failed_steps: Vec<String>,
    step_logs: BTreeMap<String, VecDeque<String>>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::StepStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.steps_started += 1;
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("RUN: {id}");
            }
            ExecEvent::StepLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines += 1;
                    let q = s.step_logs.entry(id.clone()).or_default();
                    if q.len() >= OUTPUT_TAIL_LINES {
                        q.pop_front();
                    }
                    q.push_back(line.clone());
                }
                println!("[{id}] {line}");
            }
            ExecEvent::StepFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let mut tail = Vec::new();
                if let Ok(mut s) = self.state.lock() {
                    let logs = s.step_logs.remove(&id).unwrap_or_default();
                    if ok {
                        s.steps_ok += 1;
                    } else {
                        s.steps_failed += 1;
                        s.failed_steps.push(id.clone());
                        tail = logs.into_iter().collect();
                    }
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!(
                        "FAIL: {id} ({elapsed_ms}ms) {}",
                        error.unwrap_or_default()
                    );
                    for line in tail {
                        println!("  | {line}");
                    }
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  steps: started={} ok={} failed={}",
                    s.steps_started, s.steps_ok, s.steps_failed
                );
                println!("  logs: {}", s.log_lines);
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                if !s.failed_steps.is_empty() {
                    println!("  failed_steps: {}", s.failed_steps.join(", "));
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecipeSection {
    pub name: String,
}

impl Default for RecipeSection {
    fn default() -> Self {
        Self {
            name: "open3d".into(),
        }
    }
}

pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_step: Option<String>,
    recipe: OnceCell<Arc<dyn Recipe>>,
    workspace: OnceCell<WorkspacePaths>,
    resolved: OnceCell<ResolvedConfig>,
    driver: OnceCell<BuildDriver>,
    published: OnceCell<PackageInfo>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_step: None,
            recipe: OnceCell::new(),
            workspace: OnceCell::new(),
            resolved: OnceCell::new(),
            driver: OnceCell::new(),
            published: OnceCell::new(),
        }
    }

    pub fn set_step(&mut self, id: impl Into<String>) {
        self.current_step = Some(id.into());
    }

    pub fn recipe(&self, doc: &ConfigDoc) -> Result<&Arc<dyn Recipe>> {
        cached(&self.recipe, || {
            let section: RecipeSection = doc.deserialize_path("recipe")?.unwrap_or_default();
            recipe::builtin(&section.name)
        })
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if self.workspace.set(paths).is_err() {
            tracing::warn!("workspace paths already initialized; keeping the first");
        }
    }

    // Cleaning is only applied by core.init.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<&WorkspacePaths> {
        cached(&self.workspace, || {
            let mut ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
            ws.clean = CleanMode::None;
            crate::workspace::init_dirs(&ws)
        })
    }

    pub fn resolved(&self, doc: &ConfigDoc) -> Result<&ResolvedConfig> {
        cached(&self.resolved, || {
            let recipe = self.recipe(doc)?;
            let settings_cfg: SettingsConfig =
                doc.deserialize_path("settings")?.unwrap_or_default();
            let settings = Settings::resolve(&settings_cfg, recipe.descriptor())?;
            let cfg = resolver::resolve(recipe.as_ref(), &configured_values(doc)?, &settings)?;
            tracing::info!(signature = %cfg.signature(), "configuration resolved");
            Ok(cfg)
        })
    }

    pub fn layout(&self, doc: &ConfigDoc) -> Result<RecipeLayout> {
        let ws = self.workspace_paths_or_init(doc)?;
        let build_type = self.resolved(doc)?.settings.build_type;
        Ok(ws.layout(self.recipe(doc)?.descriptor(), build_type))
    }

    pub fn driver(&self, doc: &ConfigDoc) -> Result<&BuildDriver> {
        cached(&self.driver, || {
            let cfg: CMakeConfig = doc.deserialize_path("cmake")?.unwrap_or_default();
            let ws = self.workspace_paths_or_init(doc)?;
            let prefix_paths = cfg
                .prefix_paths
                .iter()
                .map(|p| ws.resolve_config_path(p))
                .collect::<Result<Vec<_>>>()?;
            let build_type = self.resolved(doc)?.settings.build_type;
            BuildDriver::new(&cfg, self.layout(doc)?, build_type, prefix_paths)
        })
    }

    pub fn set_published(&self, info: PackageInfo) -> Result<()> {
        self.published
            .set(info)
            .map_err(|_| Error::msg("package info was already published for this run"))
    }

    pub fn published(&self) -> Option<&PackageInfo> {
        self.published.get()
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_step
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::StepLog {
            id,
            line: msg.to_string(),
        });
    }

    pub fn run_cmd(&self, mut cmd: Command, phase: &str) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {}", render_command(&cmd)));
            return Ok(());
        }
        tracing::debug!(phase, command = %render_command(&cmd), "spawning");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Build {
                phase: phase.to_string(),
                status: format!("failed to start {}: {e}", render_command(&cmd)),
                code: None,
                output: Vec::new(),
            })?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        for line in rx {
            let line = sanitize_log_line(&line);
            if line.is_empty() {
                continue;
            }
            self.log(&line);
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        if !status.success() {
            return Err(Error::Build {
                phase: phase.to_string(),
                status: status.to_string(),
                code: status.code(),
                output: tail.into_iter().collect(),
            });
        }
        Ok(())
    }
}

fn cached<'a, T>(cell: &'a OnceCell<T>, init: impl FnOnce() -> Result<T>) -> Result<&'a T> {
    if let Some(v) = cell.get() {
        return Ok(v);
    }
    let v = init()?;
    Ok(cell.get_or_init(|| v))
}

pub fn render_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Default)]
pub struct StepRegistry {
    exec: BTreeMap<&'static str, StepExecFn>,
}

impl StepRegistry {
    pub fn add(&mut self, id: &'static str, f: StepExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate step executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<StepExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_steps(reg: &mut StepRegistry) -> Result<()>;
}

// Runs the plan step by step. The first failure stops the run and is
// returned unchanged.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &StepRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for step in plan.ordered()? {
        let Some(exec) = reg.get(&step.id) else {
            return Err(Error::msg(format!(
                "no executor registered for step '{}'",
                step.id
            )));
        };
        ctx.sink.emit(ExecEvent::StepStarted {
            id: step.id.clone(),
        });
        ctx.set_step(step.id.clone());
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: {} ({}/{})",
                step.id, step.module, step.phase
            ));
            ctx.sink.emit(ExecEvent::StepFinished {
                id: step.id.clone(),
                ok: true,
                error: None,
                elapsed_ms: 0,
            });
            continue;
        }

        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::StepFinished {
                id: step.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                tracing::error!(step = %step.id, error = %e, "step failed");
                ctx.sink.emit(ExecEvent::StepFinished {
                    id: step.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(format!("step '{}' failed: {e}", step.id)),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<StepRegistry> {
    let mut reg = StepRegistry::default();
    crate::phases::core::CoreModule::register_steps(&mut reg)?;
    crate::phases::recipe::RecipeModule::register_steps(&mut reg)?;
    Ok(reg)
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_ctx() -> (ExecCtx, mpsc::Receiver<ExecEvent>) {
        let (tx, rx) = mpsc::channel();
        (ExecCtx::new(false, Arc::new(ChannelSink::new(tx))), rx)
    }

    #[test]
    fn resolved_config_is_computed_once() {
        let doc = ConfigDoc::parse("inline.toml", "[recipe]\nname = \"open3d\"\n").expect("doc");
        let (ctx, _rx) = channel_ctx();
        let a = ctx.resolved(&doc).expect("first") as *const ResolvedConfig;
        let b = ctx.resolved(&doc).expect("second") as *const ResolvedConfig;
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_recipe_is_rejected() {
        let doc = ConfigDoc::parse("inline.toml", "[recipe]\nname = \"pcl\"\n").expect("doc");
        let (ctx, _rx) = channel_ctx();
        let err = ctx.recipe(&doc).err().expect("must fail");
        assert!(err.to_string().contains("unknown recipe"), "unexpected err: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_a_build_error_with_output_tail() {
        let (mut ctx, rx) = channel_ctx();
        ctx.set_step("test.step");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo first; echo \"second\" >&2; exit 3"]);

        let err = ctx.run_cmd(cmd, "build").expect_err("must fail");
        match err {
            Error::Build {
                phase,
                code,
                output,
                ..
            } => {
                assert_eq!(phase, "build");
                assert_eq!(code, Some(3));
                assert!(output.iter().any(|l| l == "first"));
                assert!(output.iter().any(|l| l == "second"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let logged = rx
            .try_iter()
            .filter(|ev| matches!(ev, ExecEvent::StepLog { id, .. } if id == "test.step"))
            .count();
        assert_eq!(logged, 2);
    }

    #[test]
    fn dry_run_commands_are_only_logged() {
        let (tx, rx) = mpsc::channel();
        let ctx = ExecCtx::new(true, Arc::new(ChannelSink::new(tx)));
        let mut cmd = Command::new("definitely-not-a-real-tool");
        cmd.arg("--version");
        ctx.run_cmd(cmd, "configure").expect("dry run");
        let lines: Vec<_> = rx
            .try_iter()
            .filter_map(|ev| match ev {
                ExecEvent::StepLog { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["DRY-RUN: definitely-not-a-real-tool --version"]);
    }
}
