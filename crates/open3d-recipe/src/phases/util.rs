use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty<T: Serialize + ?Sized>(p: &Path, v: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

pub fn write_marker(run_dir: &Path, phase: &str, extra: &[(&str, String)]) -> Result<()> {
    let mut body = format!("{phase}_at={}\n", chrono::Utc::now().to_rfc3339());
    for (k, v) in extra {
        body.push_str(&format!("{k}={v}\n"));
    }
    write_text(&run_dir.join(format!("{phase}.marker")), &body)
}

pub fn dir_is_empty(p: &Path) -> Result<bool> {
    let mut it = fs::read_dir(p)
        .map_err(|e| Error::msg(format!("failed to read dir {}: {e}", p.display())))?;
    Ok(it.next().is_none())
}

pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0usize;
    let walker = walkdir::WalkDir::new(src)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &out).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} -> {}: {e}",
                    entry.path().display(),
                    out.display()
                ))
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}
