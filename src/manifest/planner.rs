//! Execution Planner
//!
//! Turns a validated manifest into the sequence the backends execute.
//! Steps run strictly one after another, so the plan is a single
//! topological order. Among steps that are ready at the same time, the one
//! that appears first in the manifest goes first, which makes the order a
//! pure function of the manifest and identical for every backend.

use std::collections::{BTreeSet, HashMap};

use log::debug;
use serde::{Deserialize, Serialize};

use super::model::Manifest;
use super::validator::ManifestError;

/// Topologically sorted step ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    order: Vec<String>,
}

impl ExecutionPlan {
    /// Orders the steps using Kahn's algorithm.
    ///
    /// Assumes every dependency resolves; unknown references are reported
    /// by [`super::validate_manifest`] before this runs.
    pub fn build(manifest: &Manifest) -> Result<Self, ManifestError> {
        let index: HashMap<&str, usize> = manifest
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut in_degree: Vec<usize> = vec![0; manifest.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); manifest.len()];

        for (i, step) in manifest.steps.iter().enumerate() {
            for dep in &step.depends_on {
                if let Some(&d) = index.get(dep.as_str()) {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        // Ready set keyed by manifest position breaks ties deterministically
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(manifest.len());
        while let Some(current) = ready.pop_first() {
            order.push(manifest.steps[current].id.clone());
            for &next in &dependents[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != manifest.len() {
            let stuck: Vec<String> = manifest
                .steps
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s.id.clone())
                .collect();
            return Err(ManifestError::CyclicDependency(stuck));
        }

        debug!("Execution order: {}", order.join(" -> "));
        Ok(Self { order })
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn into_order(self) -> Vec<String> {
        self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether `order` runs every step after all of its dependencies.
    pub fn is_topological(manifest: &Manifest, order: &[String]) -> bool {
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        order.len() == manifest.len()
            && manifest.steps.iter().all(|step| {
                let Some(&at) = position.get(step.id.as_str()) else {
                    return false;
                };
                step.depends_on
                    .iter()
                    .all(|dep| position.get(dep.as_str()).is_some_and(|&d| d < at))
            })
    }
}
