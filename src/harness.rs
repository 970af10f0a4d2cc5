use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::actor::{ActorHandle, Continuation};
use crate::dispatch::DispatchMode;
use crate::driver::Runtime;
use crate::registry::RegistryBuilder;
use crate::script::ClassDef;
use crate::value::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    pub classes: Vec<ClassDef>,
    #[serde(default)]
    pub spawns: Vec<FixtureSpawn>,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_dt")]
    pub dt: f64,
    #[serde(default)]
    pub stimuli: Vec<FixtureStimulus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureSpawn {
    pub class: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureStimulus {
    /// Applied at the start of this step, before the tick runs.
    pub step: usize,
    #[serde(flatten)]
    pub action: StimulusAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum StimulusAction {
    Invoke {
        actor: String,
        function: String,
        #[serde(default)]
        global: bool,
        #[serde(default)]
        args: Vec<Value>,
    },
    Transition {
        actor: String,
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        label: Option<String>,
    },
    Signal {
        #[serde(default)]
        actor: Option<String>,
        tag: String,
    },
    Destroy {
        actor: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub steps: usize,
    pub dt: f64,
    pub setup: Vec<String>,
    pub results: Vec<StepResult>,
    pub final_actors: Vec<ActorSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: usize,
    pub events: Vec<String>,
    #[serde(default)]
    pub faults: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActorSummary {
    pub name: String,
    pub class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended: Option<String>,
    pub halted: bool,
    pub vars: BTreeMap<String, Value>,
}

pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessOutput> {
    let mut builder = RegistryBuilder::new();
    builder.declare_all(fixture.classes.iter().cloned());
    let registry = Arc::new(builder.link().context("linking fixture classes")?);
    let mut runtime = Runtime::new(registry);

    let mut by_name: BTreeMap<String, ActorHandle> = BTreeMap::new();
    let mut by_handle: BTreeMap<ActorHandle, String> = BTreeMap::new();
    for (idx, spawn) in fixture.spawns.iter().enumerate() {
        let handle = runtime
            .spawn(&spawn.class, spawn.vars.clone())
            .with_context(|| format!("spawning fixture actor of class '{}'", spawn.class))?;
        let name = spawn.name.clone().unwrap_or_else(|| format!("actor{idx}"));
        if by_name.insert(name.clone(), handle).is_some() {
            bail!("fixture spawns two actors named '{name}'");
        }
        by_handle.insert(handle, name);
    }
    let setup = runtime.drain_events().iter().map(ToString::to_string).collect();

    let mut results = Vec::with_capacity(fixture.steps);
    for step in 0..fixture.steps {
        let mut faults = Vec::new();
        for stimulus in fixture.stimuli.iter().filter(|s| s.step == step) {
            apply_stimulus(&mut runtime, &by_name, &stimulus.action, &mut faults)?;
        }
        let report = runtime
            .advance_tick(fixture.dt)
            .with_context(|| format!("advancing tick {step}"))?;
        faults.extend(report.faults.iter().map(ToString::to_string));
        let events = runtime.drain_events().iter().map(ToString::to_string).collect();
        results.push(StepResult { step, events, faults });
    }

    let mut final_actors = Vec::new();
    for handle in runtime.handles() {
        let name = by_handle.get(&handle).cloned().unwrap_or_else(|| handle.to_string());
        final_actors.push(ActorSummary {
            name,
            class: runtime.class_of(handle).unwrap_or_default(),
            state: runtime.state_of(handle),
            suspended: runtime.pending_latent_of(handle).map(|p| p.to_string()),
            halted: matches!(runtime.continuation_of(handle), Some(Continuation::Halted)),
            vars: runtime.vars_of(handle),
        });
    }
    final_actors.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(HarnessOutput { steps: fixture.steps, dt: fixture.dt, setup, results, final_actors })
}

fn apply_stimulus(
    runtime: &mut Runtime,
    by_name: &BTreeMap<String, ActorHandle>,
    action: &StimulusAction,
    faults: &mut Vec<String>,
) -> Result<()> {
    match action {
        StimulusAction::Invoke { actor, function, global, args } => {
            let handle = lookup(by_name, actor)?;
            let mode = if *global { DispatchMode::Global } else { DispatchMode::Normal };
            if let Err(fault) = runtime.invoke(handle, function, args, mode) {
                faults.push(fault.to_string());
            }
        }
        StimulusAction::Transition { actor, state, label } => {
            let handle = lookup(by_name, actor)?;
            if let Err(fault) =
                runtime.request_transition(handle, state.as_deref(), label.as_deref())
            {
                faults.push(fault.to_string());
            }
        }
        StimulusAction::Signal { actor, tag } => match actor {
            Some(actor) => {
                let handle = lookup(by_name, actor)?;
                runtime.post_signal(handle, tag);
            }
            None => runtime.broadcast_signal(tag),
        },
        StimulusAction::Destroy { actor } => {
            let handle = lookup(by_name, actor)?;
            runtime.destroy(handle);
        }
    }
    Ok(())
}

fn lookup(by_name: &BTreeMap<String, ActorHandle>, name: &str) -> Result<ActorHandle> {
    by_name.get(name).copied().ok_or_else(|| anyhow::anyhow!("fixture references unknown actor '{name}'"))
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("opening fixture '{}'", path.as_ref().display()))?;
    Ok(serde_json::from_reader(file).with_context(|| "parsing fixture JSON")?)
}

fn default_dt() -> f64 {
    0.1
}

fn default_steps() -> usize {
    4
}
