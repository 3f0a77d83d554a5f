use crate::definition::WorkflowDefinition;
use crate::orchestration::error::EngineError;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
    predecessors: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    wave_index: BTreeMap<String, usize>,
}

impl ExecutionPlan {
    pub fn predecessors_of(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.predecessors
            .get(step_id)
            .into_iter()
            .flat_map(|set| set.iter().map(|s| s.as_str()))
    }

    pub fn dependents_of(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(step_id)
            .into_iter()
            .flat_map(|set| set.iter().map(|s| s.as_str()))
    }

    pub fn descendants_of(&self, step_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut frontier: Vec<&str> = self.dependents_of(step_id).collect();
        while let Some(current) = frontier.pop() {
            if !seen.insert(current.to_string()) {
                continue;
            }
            frontier.extend(self.dependents_of(current));
        }
        seen
    }

    pub fn wave_of(&self, step_id: &str) -> Option<usize> {
        self.wave_index.get(step_id).copied()
    }
}

pub fn resolve(definition: &WorkflowDefinition) -> Result<ExecutionPlan, EngineError> {
    let mut predecessors: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for step in &definition.steps {
        let step_id = step.id.as_str().to_string();
        predecessors.entry(step_id.clone()).or_default();
        dependents.entry(step_id.clone()).or_default();

        for dependency in &step.depends_on {
            predecessors
                .entry(step_id.clone())
                .or_default()
                .insert(dependency.as_str().to_string());
            dependents
                .entry(dependency.as_str().to_string())
                .or_default()
                .insert(step_id.clone());
        }
        for (_, reference) in step.artifact_inputs() {
            predecessors
                .entry(step_id.clone())
                .or_default()
                .insert(reference.step_id.as_str().to_string());
            dependents
                .entry(reference.step_id.as_str().to_string())
                .or_default()
                .insert(step_id.clone());
        }
    }

    // Kahn layering; leftover nodes after the queue drains sit on a cycle.
    let mut remaining_degree: BTreeMap<String, usize> = predecessors
        .iter()
        .map(|(step_id, preds)| (step_id.clone(), preds.len()))
        .collect();
    let mut level: BTreeMap<String, usize> = BTreeMap::new();
    let mut frontier: Vec<String> = remaining_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(step_id, _)| step_id.clone())
        .collect();
    for step_id in &frontier {
        level.insert(step_id.clone(), 0);
    }

    while let Some(current) = frontier.pop() {
        let current_level = level.get(&current).copied().unwrap_or(0);
        for dependent in dependents.get(&current).into_iter().flatten() {
            let entry = level.entry(dependent.clone()).or_insert(0);
            *entry = (*entry).max(current_level + 1);
            let degree = remaining_degree
                .get_mut(dependent)
                .ok_or_else(|| EngineError::Internal("dependent missing from degree map".into()))?;
            *degree -= 1;
            if *degree == 0 {
                frontier.push(dependent.clone());
            }
        }
    }

    if let Some((cyclic, _)) = remaining_degree.iter().find(|(_, degree)| **degree > 0) {
        return Err(EngineError::CyclicDependency {
            step_id: cyclic.clone(),
        });
    }

    let wave_count = level.values().max().map(|max| max + 1).unwrap_or(0);
    let mut waves = vec![Wave { steps: Vec::new() }; wave_count];
    let mut wave_index = BTreeMap::new();
    for step in &definition.steps {
        let step_id = step.id.as_str();
        let index = level.get(step_id).copied().unwrap_or(0);
        waves[index].steps.push(step_id.to_string());
        wave_index.insert(step_id.to_string(), index);
    }
    for wave in &mut waves {
        wave.steps.sort_by(|a, b| {
            let group_a = definition.step(a).and_then(|s| s.parallel_group.clone());
            let group_b = definition.step(b).and_then(|s| s.parallel_group.clone());
            group_a.cmp(&group_b).then_with(|| a.cmp(b))
        });
    }

    Ok(ExecutionPlan {
        waves,
        predecessors,
        dependents,
        wave_index,
    })
}
