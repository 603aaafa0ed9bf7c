use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type StepId = String;

#[derive(Debug, Clone)]
pub struct Step {
    pub id: StepId,
    pub label: String,
    pub module: String,
    pub phase: String,
    // Step ids or provide tokens this step runs after. A trailing `?` marks
    // the dependency optional.
    pub after: Vec<String>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    steps: BTreeMap<StepId, Step>,
}

impl Plan {
    pub fn add(&mut self, step: Step) -> Result<()> {
        if self.steps.contains_key(&step.id) {
            return Err(Error::msg(format!("duplicate step id '{}'", step.id)));
        }
        self.steps.insert(step.id.clone(), step);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, step) in &self.steps {
            for p in &step.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{p}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        step: &str,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if let Some((id, _)) = self.steps.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::msg(format!(
            "step '{step}' has invalid dependency '{dep}'"
        )))
    }

    pub fn ordered(&self) -> Result<Vec<&Step>> {
        let provides = self.provides_index()?;

        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (id, step) in &self.steps {
            let id = id.as_str();
            incoming.entry(id).or_insert(0);
            outgoing.entry(id).or_default();
            for dep in &step.after {
                let Some(dep_id) = self.resolve_dep(&provides, id, dep)? else {
                    continue;
                };
                if outgoing.entry(dep_id).or_default().insert(id) {
                    *incoming.entry(id).or_insert(0) += 1;
                }
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out = Vec::with_capacity(self.steps.len());

        while let Some(n) = q.pop_front() {
            if let Some(step) = self.steps.get(n) {
                out.push(step);
            }
            if let Some(children) = outgoing.get(n) {
                for &m in children {
                    if let Some(slot) = incoming.get_mut(m) {
                        *slot -= 1;
                        if *slot == 0 {
                            q.push_back(m);
                        }
                    }
                }
            }
        }

        if out.len() != self.steps.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "step graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let provides = self.provides_index()?;

        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for step in self.steps.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                step.id, step.label, step.module, step.phase
            ));
        }
        for step in self.steps.values() {
            for dep in &step.after {
                if let Some(dep_id) = self.resolve_dep(&provides, &step.id, dep)? {
                    out.push_str(&format!("  \"{dep_id}\" -> \"{}\";\n", step.id));
                }
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}
