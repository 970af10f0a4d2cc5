use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::script::{ClassDef, FunctionDef, FunctionFlags, Op, StateDef};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(u32);

impl ClassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One implementation in a dispatch chain, tagged with the class that
/// defined it so `Super` calls can skip past it.
#[derive(Debug, Clone)]
pub struct FnRef {
    pub class: ClassId,
    pub def: Arc<FunctionDef>,
}

/// Chains are ordered most-derived first.
pub type FnChain = Vec<FnRef>;

#[derive(Debug, Clone)]
pub struct LabelBlock {
    /// Class whose declaration supplied this code; `Super` calls in
    /// the block resolve relative to it.
    pub class: ClassId,
    pub ops: Arc<[Op]>,
}

/// A state as seen by one concrete class: its own declaration merged
/// with its `expands` target and any same-named ancestor states.
#[derive(Debug, Clone)]
pub struct LinkedState {
    pub name: String,
    pub is_auto: bool,
    /// Ignore set of the most-derived declaration only.
    pub ignores: BTreeSet<String>,
    pub functions: BTreeMap<String, FnChain>,
    pub labels: BTreeMap<String, LabelBlock>,
}

#[derive(Debug)]
pub struct LinkedClass {
    pub id: ClassId,
    pub name: String,
    pub parent: Option<ClassId>,
    pub defaults: BTreeMap<String, Value>,
    pub globals: BTreeMap<String, FnChain>,
    pub states: BTreeMap<String, Arc<LinkedState>>,
    pub auto_state: Option<String>,
}

/// Immutable class descriptor table. Built once by [`RegistryBuilder`]
/// from the compiler's output, then shared read-only.
#[derive(Debug)]
pub struct ClassRegistry {
    classes: Vec<LinkedClass>,
    by_name: BTreeMap<String, ClassId>,
}

impl ClassRegistry {
    pub fn class(&self, id: ClassId) -> &LinkedClass {
        &self.classes[id.index()]
    }

    pub fn find(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// The class itself followed by its ancestors, base-most last.
    pub fn ancestry(&self, id: ClassId) -> impl Iterator<Item = ClassId> + '_ {
        let mut cursor = Some(id);
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = self.class(current).parent;
            Some(current)
        })
    }

    pub fn is_strict_ancestor(&self, candidate: ClassId, of: ClassId) -> bool {
        self.ancestry(of).skip(1).any(|c| c == candidate)
    }

    pub fn state(&self, class: ClassId, name: &str) -> Option<&Arc<LinkedState>> {
        self.class(class).states.get(name)
    }
}

/// Two-pass linker: `declare` collects every class first so bodies may
/// reference classes in any order, `link` resolves and flattens.
#[derive(Default)]
pub struct RegistryBuilder {
    defs: Vec<ClassDef>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, def: ClassDef) -> &mut Self {
        self.defs.push(def);
        self
    }

    pub fn declare_all(&mut self, defs: impl IntoIterator<Item = ClassDef>) -> &mut Self {
        self.defs.extend(defs);
        self
    }

    pub fn link(self) -> Result<ClassRegistry> {
        let mut by_name = BTreeMap::new();
        for (idx, def) in self.defs.iter().enumerate() {
            let id = ClassId(idx as u32);
            if by_name.insert(def.name.clone(), id).is_some() {
                bail!("duplicate class '{}'", def.name);
            }
        }

        let mut parents = Vec::with_capacity(self.defs.len());
        for def in &self.defs {
            let parent = match &def.parent {
                Some(name) => Some(
                    by_name
                        .get(name)
                        .copied()
                        .ok_or_else(|| anyhow!("class '{}' extends unknown class '{name}'", def.name))?,
                ),
                None => None,
            };
            parents.push(parent);
        }

        // Single inheritance must stay acyclic even though forward
        // references are legal during declaration.
        for start in 0..self.defs.len() {
            let mut cursor = parents[start];
            let mut hops = 0;
            while let Some(p) = cursor {
                hops += 1;
                if hops > self.defs.len() {
                    bail!("inheritance cycle involving class '{}'", self.defs[start].name);
                }
                cursor = parents[p.index()];
            }
        }

        let mut linked: Vec<Option<LinkedClass>> = (0..self.defs.len()).map(|_| None).collect();
        let mut order: Vec<usize> = (0..self.defs.len()).collect();
        order.sort_by_key(|&idx| {
            let mut depth = 0usize;
            let mut cursor = parents[idx];
            while let Some(p) = cursor {
                depth += 1;
                cursor = parents[p.index()];
            }
            depth
        });

        for idx in order {
            let def = &self.defs[idx];
            let id = ClassId(idx as u32);
            let parent = parents[idx];
            let base = parent.map(|p| linked[p.index()].as_ref().expect("parents link first"));
            let class = link_class(def, id, parent, base)?;
            linked[idx] = Some(class);
        }

        let classes = linked.into_iter().map(|c| c.expect("all classes linked")).collect();
        Ok(ClassRegistry { classes, by_name })
    }
}

fn link_class(
    def: &ClassDef,
    id: ClassId,
    parent: Option<ClassId>,
    base: Option<&LinkedClass>,
) -> Result<LinkedClass> {
    let mut defaults = base.map(|b| b.defaults.clone()).unwrap_or_default();
    for (name, value) in &def.defaults {
        defaults.insert(name.clone(), value.clone());
    }

    let mut globals = base.map(|b| b.globals.clone()).unwrap_or_default();
    let mut seen = BTreeSet::new();
    for function in &def.functions {
        if !seen.insert(function.name.as_str()) {
            bail!("class '{}' defines function '{}' twice", def.name, function.name);
        }
        push_override(&mut globals, id, function, &def.name)?;
    }

    let mut states: BTreeMap<String, Arc<LinkedState>> =
        base.map(|b| b.states.clone()).unwrap_or_default();
    let mut own: BTreeMap<&str, &StateDef> = BTreeMap::new();
    for state in &def.states {
        if own.insert(state.name.as_str(), state).is_some() {
            bail!("class '{}' declares state '{}' twice", def.name, state.name);
        }
    }
    for state in &def.states {
        let linked = link_state(def, id, state, &own, &states, &mut BTreeSet::new())?;
        states.insert(state.name.clone(), Arc::new(linked));
    }

    let mut auto_state = None;
    for state in states.values() {
        if state.is_auto {
            if let Some(existing) = &auto_state {
                bail!(
                    "class '{}' has more than one auto state ('{existing}' and '{}')",
                    def.name,
                    state.name
                );
            }
            auto_state = Some(state.name.clone());
        }
    }

    Ok(LinkedClass {
        id,
        name: def.name.clone(),
        parent,
        defaults,
        globals,
        states,
        auto_state,
    })
}

fn link_state(
    class: &ClassDef,
    id: ClassId,
    def: &StateDef,
    own: &BTreeMap<&str, &StateDef>,
    inherited: &BTreeMap<String, Arc<LinkedState>>,
    visiting: &mut BTreeSet<String>,
) -> Result<LinkedState> {
    if !visiting.insert(def.name.clone()) {
        bail!("state '{}' in class '{}' expands itself", def.name, class.name);
    }

    // Base layer: the same-named state from the ancestor classes, then
    // the expands target stacked on top, then this declaration.
    let mut functions;
    let mut labels;
    match inherited.get(&def.name) {
        Some(base) => {
            functions = base.functions.clone();
            labels = base.labels.clone();
        }
        None => {
            functions = BTreeMap::new();
            labels = BTreeMap::new();
        }
    }

    if let Some(target) = &def.expands {
        let target_def = own.get(target.as_str()).ok_or_else(|| {
            anyhow!(
                "state '{}' in class '{}' expands unknown state '{target}' (expands is same-class only)",
                def.name,
                class.name
            )
        })?;
        let expanded = link_state(class, id, target_def, own, inherited, visiting)?;
        for (name, chain) in expanded.functions {
            merge_chain(functions.entry(name).or_default(), chain);
        }
        for (name, block) in expanded.labels {
            labels.insert(name, block);
        }
    }

    let mut seen = BTreeSet::new();
    for function in &def.functions {
        if !seen.insert(function.name.as_str()) {
            bail!(
                "state '{}' in class '{}' defines function '{}' twice",
                def.name,
                class.name,
                function.name
            );
        }
        push_override(&mut functions, id, function, &class.name)?;
    }
    for (name, ops) in &def.labels {
        labels.insert(name.clone(), LabelBlock { class: id, ops: Arc::from(ops.as_slice()) });
    }

    visiting.remove(&def.name);
    Ok(LinkedState {
        name: def.name.clone(),
        is_auto: def.auto || inherited.get(&def.name).map_or(false, |base| base.is_auto),
        ignores: def.ignores.iter().cloned().collect(),
        functions,
        labels,
    })
}

fn push_override(
    chains: &mut BTreeMap<String, FnChain>,
    id: ClassId,
    function: &FunctionDef,
    class_name: &str,
) -> Result<()> {
    let chain = chains.entry(function.name.clone()).or_default();
    if let Some(sealed) = chain.iter().find(|f| f.def.flags.contains(FunctionFlags::FINAL)) {
        bail!(
            "class '{class_name}' overrides final function '{}' (defined by class #{})",
            function.name,
            sealed.class.index()
        );
    }
    chain.insert(0, FnRef { class: id, def: Arc::new(function.clone()) });
    Ok(())
}

fn merge_chain(into: &mut FnChain, upper: FnChain) {
    // The expands target sits between this declaration and the
    // inherited layer; skip entries already present from inheritance.
    let mut insert_at = 0;
    for entry in upper {
        let duplicate = into
            .iter()
            .any(|existing| existing.class == entry.class && Arc::ptr_eq(&existing.def, &entry.def));
        if !duplicate {
            into.insert(insert_at, entry);
            insert_at += 1;
        }
    }
}
