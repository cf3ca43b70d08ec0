//! Semantic validation of a parsed pipeline graph.

use std::collections::{BTreeMap, HashSet, VecDeque};

use anyhow::{bail, Result};

use crate::config::types::PipelineConfig;
use crate::registry::TransformRegistry;
use crate::transform::StepRole;

/// Validate a parsed pipeline configuration against the registry.
///
/// # Errors
///
/// Returns an error listing every validation failure found.
pub fn validate_pipeline(config: &PipelineConfig, registry: &TransformRegistry) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.steps.is_empty() {
        errors.push("Pipeline must define at least one step".to_string());
    }

    if config.resources.row_buffer_size == 0 {
        errors.push("row_buffer_size must be at least 1".to_string());
    }

    let mut seen = HashSet::new();
    for (i, step) in config.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            errors.push(format!("Step {i} has an empty name"));
        } else if !seen.insert(step.name.as_str()) {
            errors.push(format!("Duplicate step name '{}'", step.name));
        }
    }

    let names: HashSet<&str> = config.steps.iter().map(|s| s.name.as_str()).collect();
    let error_targets: HashSet<&str> = config.steps.iter().filter_map(|s| s.error_target()).collect();

    for step in &config.steps {
        if step.copies == 0 {
            errors.push(format!("Step '{}': copies must be at least 1", step.name));
        }
        for input in &step.inputs {
            if !names.contains(input.as_str()) {
                errors.push(format!("Step '{}': unknown input '{input}'", step.name));
            }
        }
        if let Some(target) = step.error_target() {
            if !names.contains(target) {
                errors.push(format!("Step '{}': unknown error target '{target}'", step.name));
            } else if target == step.name {
                errors.push(format!("Step '{}': cannot route errors to itself", step.name));
            }
        }

        match registry.role(&step.use_ref) {
            None => errors.push(format!(
                "Step '{}': unknown transform '{}'",
                step.name, step.use_ref
            )),
            Some(StepRole::Source) if !step.inputs.is_empty() => {
                errors.push(format!("Step '{}': a source cannot have inputs", step.name));
            }
            Some(StepRole::Source) if error_targets.contains(step.name.as_str()) => {
                errors.push(format!(
                    "Step '{}': a source cannot receive error rows",
                    step.name
                ));
            }
            Some(StepRole::Transform)
                if step.inputs.is_empty() && !error_targets.contains(step.name.as_str()) =>
            {
                errors.push(format!("Step '{}': has no inputs", step.name));
            }
            Some(_) => {}
        }
    }

    if let Some(cycle) = find_cycle(config) {
        errors.push(format!("Pipeline graph has a cycle through: {}", cycle.join(", ")));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

/// Kahn's algorithm over data and error edges. Returns the steps left on a
/// cycle, sorted.
fn find_cycle(config: &PipelineConfig) -> Option<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> =
        config.steps.iter().map(|s| (s.name.as_str(), 0)).collect();
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for step in &config.steps {
        let upstreams = step.inputs.iter().map(String::as_str);
        for from in upstreams {
            if in_degree.contains_key(from) {
                edges.entry(from).or_default().push(step.name.as_str());
            }
        }
        if let Some(target) = step.error_target() {
            if in_degree.contains_key(target) {
                edges.entry(step.name.as_str()).or_default().push(target);
            }
        }
    }
    for targets in edges.values() {
        for to in targets {
            if let Some(d) = in_degree.get_mut(to) {
                *d += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(name, _)| *name)
        .collect();
    while let Some(name) = queue.pop_front() {
        in_degree.remove(name);
        for to in edges.get(name).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(to) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*to);
                }
            }
        }
    }

    if in_degree.is_empty() {
        None
    } else {
        Some(in_degree.keys().map(|s| (*s).to_string()).collect())
    }
}

/// Steps in an order where every step comes after its data and error
/// upstreams. Assumes a validated, acyclic graph.
#[must_use]
pub fn topological_order(config: &PipelineConfig) -> Vec<String> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(config.steps.len());
    while order.len() < config.steps.len() {
        let before = order.len();
        for step in &config.steps {
            if placed.contains(step.name.as_str()) {
                continue;
            }
            let inputs_ready = step.inputs.iter().all(|i| placed.contains(i.as_str()));
            let error_sources_ready = config
                .steps
                .iter()
                .filter(|s| s.error_target() == Some(step.name.as_str()))
                .all(|s| placed.contains(s.name.as_str()));
            if inputs_ready && error_sources_ready {
                placed.insert(step.name.as_str());
                order.push(step.name.clone());
            }
        }
        if order.len() == before {
            break;
        }
    }
    order
}
