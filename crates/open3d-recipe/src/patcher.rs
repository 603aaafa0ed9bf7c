use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::workspace::validate_rel_like_path;

pub const LEDGER_FILE: &str = ".recipe-patches";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOperation {
    // Replace `find` in `target` with `replace`. With `occurrences` set,
    // the file must contain exactly that many matches.
    Replace {
        id: String,
        target: PathBuf,
        find: String,
        replace: String,
        occurrences: Option<usize>,
        // A file an earlier inject must have produced.
        requires: Option<PathBuf>,
    },
    Inject {
        id: String,
        target: PathBuf,
        contents: String,
    },
}

impl PatchOperation {
    pub fn id(&self) -> &str {
        match self {
            Self::Replace { id, .. } | Self::Inject { id, .. } => id.as_str(),
        }
    }

    pub fn target(&self) -> &Path {
        match self {
            Self::Replace { target, .. } | Self::Inject { target, .. } => target.as_path(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SourcePatcher {
    ops: Vec<PatchOperation>,
}

impl SourcePatcher {
    pub fn new(ops: Vec<PatchOperation>) -> Result<Self> {
        let mut ids = BTreeSet::new();
        let mut injected = BTreeSet::<&Path>::new();
        for op in &ops {
            let id = op.id();
            if id.trim().is_empty() {
                return Err(Error::msg("patch operation has an empty id"));
            }
            if !ids.insert(id) {
                return Err(Error::msg(format!("duplicate patch id '{id}'")));
            }
            validate_rel_like_path(op.target())
                .map_err(|e| Error::patch(id, op.target(), e.to_string()))?;

            match op {
                PatchOperation::Replace { find, requires, .. } => {
                    if find.is_empty() {
                        return Err(Error::patch(id, op.target(), "match text is empty"));
                    }
                    if let Some(req) = requires
                        && !injected.contains(req.as_path())
                    {
                        return Err(Error::patch(
                            id,
                            op.target(),
                            format!(
                                "requires {} which no earlier operation injects",
                                req.display()
                            ),
                        ));
                    }
                }
                PatchOperation::Inject { target, .. } => {
                    injected.insert(target.as_path());
                }
            }
        }
        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[PatchOperation] {
        &self.ops
    }

    pub fn apply(&self, root: &Path) -> Result<PatchReport> {
        if !root.is_dir() {
            return Err(Error::patch(
                "<tree>",
                root,
                "source tree does not exist or is not a directory",
            ));
        }

        let ledger_path = root.join(LEDGER_FILE);
        let done = read_ledger(&ledger_path)?;
        let mut report = PatchReport::default();

        for op in &self.ops {
            if done.contains(op.id()) {
                tracing::info!(patch = op.id(), "patch already applied; skipping");
                report.skipped.push(op.id().to_string());
                continue;
            }
            apply_one(root, op)?;
            append_ledger(&ledger_path, op.id())?;
            tracing::info!(patch = op.id(), target = %op.target().display(), "applied patch");
            report.applied.push(op.id().to_string());
        }
        Ok(report)
    }
}

fn apply_one(root: &Path, op: &PatchOperation) -> Result<()> {
    let path = root.join(op.target());
    match op {
        PatchOperation::Replace {
            id,
            find,
            replace,
            occurrences,
            ..
        } => {
            if !path.is_file() {
                return Err(Error::patch(id, &path, "target file is missing"));
            }
            let text = fs::read_to_string(&path)
                .map_err(|e| Error::patch(id, &path, format!("read failed: {e}")))?;
            let found = text.matches(find.as_str()).count();
            if found == 0 {
                return Err(Error::patch(
                    id,
                    &path,
                    format!("expected text '{find}' not found; the upstream tree changed shape"),
                ));
            }
            if let Some(want) = occurrences
                && found != *want
            {
                return Err(Error::patch(
                    id,
                    &path,
                    format!("expected {want} occurrence(s) of '{find}', found {found}"),
                ));
            }
            fs::write(&path, text.replace(find.as_str(), replace))
                .map_err(|e| Error::patch(id, &path, format!("write failed: {e}")))
        }
        PatchOperation::Inject { id, contents, .. } => {
            if path.exists() {
                let existing = fs::read_to_string(&path)
                    .map_err(|e| Error::patch(id, &path, format!("read failed: {e}")))?;
                if existing == *contents {
                    return Ok(());
                }
                return Err(Error::patch(
                    id,
                    &path,
                    "a different file already exists at the injection target",
                ));
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::patch(id, parent, format!("mkdir failed: {e}")))?;
            }
            fs::write(&path, contents)
                .map_err(|e| Error::patch(id, &path, format!("write failed: {e}")))
        }
    }
}

fn read_ledger(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let data = fs::read_to_string(path)
        .map_err(|e| Error::patch("<ledger>", path, format!("read failed: {e}")))?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToOwned::to_owned)
        .collect())
}

fn append_ledger(path: &Path, id: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::patch(id, path, format!("ledger open failed: {e}")))?;
    writeln!(f, "{id}").map_err(|e| Error::patch(id, path, format!("ledger write failed: {e}")))
}
