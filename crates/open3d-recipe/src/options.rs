use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use toml::Value;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Choice(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Choice(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Bool,
    Choice,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionDecl {
    pub name: String,
    pub kind: OptionKind,
    pub allowed: Vec<OptionValue>,
    pub default: OptionValue,
    pub description: String,
}

impl OptionDecl {
    pub fn boolean(name: &str, default: bool, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: OptionKind::Bool,
            allowed: vec![OptionValue::Bool(true), OptionValue::Bool(false)],
            default: OptionValue::Bool(default),
            description: description.to_string(),
        }
    }

    pub fn choice(name: &str, allowed: &[&str], default: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: OptionKind::Choice,
            allowed: allowed
                .iter()
                .map(|s| OptionValue::Choice(s.to_string()))
                .collect(),
            default: OptionValue::Choice(default.to_string()),
            description: description.to_string(),
        }
    }

    fn allowed_repr(&self) -> String {
        self.allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn coerce(&self, raw: &Value) -> Result<OptionValue> {
        let value = match (self.kind, raw) {
            (OptionKind::Bool, Value::Boolean(b)) => Some(OptionValue::Bool(*b)),
            (OptionKind::Bool, Value::String(s)) => parse_bool(s).map(OptionValue::Bool),
            (OptionKind::Bool, Value::Integer(i @ (0 | 1))) => Some(OptionValue::Bool(*i == 1)),
            (OptionKind::Choice, Value::String(s)) => Some(OptionValue::Choice(s.trim().into())),
            (OptionKind::Choice, Value::Integer(i)) => Some(OptionValue::Choice(i.to_string())),
            (OptionKind::Choice, Value::Boolean(b)) => {
                Some(OptionValue::Choice(OptionValue::Bool(*b).to_string()))
            }
            _ => None,
        };

        match value {
            Some(v) if self.allowed.contains(&v) => Ok(v),
            _ => Err(Error::config(
                &self.name,
                format!(
                    "value '{}' is not in allowed values [{}]",
                    value_repr(raw),
                    self.allowed_repr()
                ),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionSet {
    decls: Vec<OptionDecl>,
}

impl OptionSet {
    pub fn new(decls: Vec<OptionDecl>) -> Result<Self> {
        let mut seen = BTreeMap::new();
        for d in &decls {
            if seen.insert(d.name.as_str(), ()).is_some() {
                return Err(Error::config(&d.name, "declared more than once"));
            }
            if !d.allowed.contains(&d.default) {
                return Err(Error::config(
                    &d.name,
                    format!(
                        "default '{}' is not in allowed values [{}]",
                        d.default,
                        d.allowed_repr()
                    ),
                ));
            }
        }
        Ok(Self { decls })
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionDecl> {
        self.decls.iter()
    }

    pub fn get(&self, name: &str) -> Option<&OptionDecl> {
        self.decls.iter().find(|d| d.name == name)
    }

    pub fn effective(&self, configured: &BTreeMap<String, Value>) -> Result<EffectiveOptions> {
        for name in configured.keys() {
            if self.get(name).is_none() {
                let known = self
                    .decls
                    .iter()
                    .map(|d| d.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(Error::config(
                    name,
                    format!("unknown option (known: {known})"),
                ));
            }
        }

        let mut values = BTreeMap::new();
        for decl in &self.decls {
            let v = match configured.get(&decl.name) {
                Some(raw) => decl.coerce(raw)?,
                None => decl.default.clone(),
            };
            values.insert(decl.name.clone(), v);
        }
        Ok(EffectiveOptions(values))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveOptions(BTreeMap<String, OptionValue>);

impl EffectiveOptions {
    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.0.get(name)
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.0.get(name), Some(OptionValue::Bool(true)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

pub fn configured_values(doc: &ConfigDoc) -> Result<BTreeMap<String, Value>> {
    let Some(tbl) = doc.table_path("options") else {
        return Ok(BTreeMap::new());
    };
    Ok(tbl.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

pub fn parse_cli_overrides(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for item in raw {
        let Some((k, v)) = item.trim().split_once('=') else {
            return Err(Error::msg(format!(
                "invalid --set value '{item}'; expected KEY=VALUE"
            )));
        };
        let key = k.trim();
        if key.is_empty() {
            return Err(Error::msg(format!("invalid --set value '{item}'; key is empty")));
        }
        out.insert(key.to_string(), v.trim().to_string());
    }
    Ok(out)
}

// Writes `--set` overrides into `[options]`. Values stay strings here;
// they are checked against the declarations when the config is resolved.
pub fn apply_cli_overrides(doc: &mut ConfigDoc, raw: &[String]) -> Result<()> {
    for (key, value) in parse_cli_overrides(raw)? {
        doc.set_path(&format!("options.{key}"), Value::String(value))?;
    }
    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn value_repr(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
