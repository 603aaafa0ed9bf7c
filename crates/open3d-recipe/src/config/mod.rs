use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;
use toml::value::Table;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn parse(path: impl Into<PathBuf>, src: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(src)
            .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn table_path(&self, path: &str) -> Option<&Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let segs: Vec<&str> = path.split('.').map(str::trim).collect();
        if segs.iter().any(|s| s.is_empty()) {
            return Err(Error::msg(format!("invalid config path '{path}'")));
        }
        let (last, parents) = segs
            .split_last()
            .ok_or_else(|| Error::msg("empty config path"))?;

        let mut cur = self
            .value
            .as_table_mut()
            .ok_or_else(|| Error::msg("config root must be a table"))?;
        for seg in parents {
            let slot = cur
                .entry(seg.to_string())
                .or_insert_with(|| Value::Table(Table::new()));
            cur = slot.as_table_mut().ok_or_else(|| {
                Error::msg(format!("config path '{path}' crosses non-table '{seg}'"))
            })?;
        }
        cur.insert(last.to_string(), value);
        Ok(())
    }
}

// Deep-merges `overlay` into `base`; tables merge key by key, anything
// else is replaced.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut loader = Loader::default();
    let value = loader.load_file(path)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[derive(Default)]
struct Loader {
    active: HashSet<PathBuf>,
}

impl Loader {
    fn load_file(&mut self, path: &Path) -> Result<Value> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !self.active.insert(key.clone()) {
            return Err(Error::msg(format!(
                "build definition cycle detected at {}",
                key.display()
            )));
        }

        let data = fs::read_to_string(path).map_err(|e| {
            Error::msg(format!(
                "failed to read build definition {}: {e}",
                path.display()
            ))
        })?;
        let mut value: Value = toml::from_str(&data)
            .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

        // `extends` names a single parent the whole file is layered over.
        let mut out = Value::Table(Table::new());
        if let Some(tbl) = value.as_table_mut()
            && let Some(parent) = tbl.remove("extends")
        {
            let Some(parent) = parent.as_str() else {
                return Err(Error::msg(format!(
                    "'extends' in {} must be a string",
                    path.display()
                )));
            };
            out = self.load_file(&relative_to(path, parent))?;
        }

        self.inline_imports(path, &mut value)?;
        merge(&mut out, value);

        self.active.remove(&key);
        Ok(out)
    }

    // `imports = [...]` may appear in any table; the imported files are merged
    // underneath that table's own keys.
    fn inline_imports(&mut self, file: &Path, value: &mut Value) -> Result<()> {
        let Value::Table(tbl) = value else {
            return Ok(());
        };

        if let Some(imports) = tbl.remove("imports") {
            let Some(list) = imports.as_array() else {
                return Err(Error::msg(format!(
                    "'imports' in {} must be an array of strings",
                    file.display()
                )));
            };
            let mut acc = Value::Table(Table::new());
            for entry in list {
                let Some(rel) = entry.as_str().map(str::trim) else {
                    return Err(Error::msg(format!(
                        "invalid imports entry in {} (expected string)",
                        file.display()
                    )));
                };
                if rel.is_empty() {
                    continue;
                }
                let loaded = self.load_file(&relative_to(file, rel))?;
                merge(&mut acc, loaded);
            }
            merge(&mut acc, Value::Table(std::mem::take(tbl)));
            if let Value::Table(merged) = acc {
                *tbl = merged;
            }
        }

        for (_, v) in tbl.iter_mut() {
            self.inline_imports(file, v)?;
        }
        Ok(())
    }
}

fn relative_to(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_layers_child_over_parent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[options]\nshared = true\nwith_visualization = false\n\n[settings]\nbuild_type = \"Release\"\n",
        )
        .expect("write base");
        fs::write(
            tmp.path().join("child.toml"),
            "extends = \"base.toml\"\n\n[options]\nwith_visualization = true\n",
        )
        .expect("write child");

        let doc = load(&tmp.path().join("child.toml")).expect("load");
        assert_eq!(
            doc.value_path("options.shared").and_then(Value::as_bool),
            Some(true)
        );
        assert_eq!(
            doc.value_path("options.with_visualization")
                .and_then(Value::as_bool),
            Some(true)
        );
        assert_eq!(
            doc.value_path("settings.build_type").and_then(Value::as_str),
            Some("Release")
        );
        assert!(doc.value_path("extends").is_none());
    }

    #[test]
    fn imports_merge_under_local_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("cmake.toml"),
            "generator = \"Ninja\"\njobs = 2\n",
        )
        .expect("write import");
        fs::write(
            tmp.path().join("main.toml"),
            "[cmake]\nimports = [\"cmake.toml\"]\njobs = 8\n",
        )
        .expect("write main");

        let doc = load(&tmp.path().join("main.toml")).expect("load");
        assert_eq!(
            doc.value_path("cmake.generator").and_then(Value::as_str),
            Some("Ninja")
        );
        assert_eq!(
            doc.value_path("cmake.jobs").and_then(Value::as_integer),
            Some(8)
        );
    }

    #[test]
    fn extends_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");

        let err = load(&tmp.path().join("a.toml")).expect_err("cycle");
        assert!(err.to_string().contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn set_path_creates_tables() {
        let mut doc = ConfigDoc::parse("inline.toml", "").expect("doc");
        doc.set_path("options.shared", Value::String("False".into()))
            .expect("set");
        assert_eq!(
            doc.value_path("options.shared").and_then(Value::as_str),
            Some("False")
        );
    }
}
