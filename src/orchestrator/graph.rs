//! Service dependency graph and wave computation
//!
//! Nodes are services, edges are `uses:` entries pointing from dependency
//! to dependent. Startup happens in topological layers (waves); a cycle is
//! a fatal manifest error. Shutdown walks the flattened order in reverse.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::manifest::{Manifest, ManifestError};

/// Directed graph over service names
#[derive(Debug)]
pub struct ServiceGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl ServiceGraph {
    /// Build the graph from the manifest's `uses:` edges
    pub fn build(manifest: &Manifest) -> Result<Self, ManifestError> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for name in manifest.services.keys() {
            let idx = graph.add_node(name.clone());
            indices.insert(name.clone(), idx);
        }

        for (name, spec) in &manifest.services {
            let dependent = indices[name];
            for target in &spec.uses {
                // Validated at manifest load; defensive lookup regardless
                let Some(&dependency) = indices.get(target) else {
                    return Err(ManifestError::UnknownDependency {
                        service: name.clone(),
                        target: target.clone(),
                    });
                };
                // dependency must be healthy before dependent starts
                graph.update_edge(dependency, dependent, ());
            }
        }

        let built = Self { graph, indices };
        // Cycles surface here rather than mid-startup
        built.waves()?;
        Ok(built)
    }

    /// Topological layers: every service in wave N depends only on services
    /// in waves < N. Services inside one wave start in parallel.
    pub fn waves(&self) -> Result<Vec<Vec<String>>, ManifestError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut waves = Vec::new();
        let mut remaining = in_degree.len();

        while remaining > 0 {
            let mut wave: Vec<NodeIndex> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(idx, _)| *idx)
                .collect();

            if wave.is_empty() {
                // Everything left has an unsatisfiable dependency: a cycle
                let mut stuck: Vec<String> = in_degree
                    .keys()
                    .map(|idx| self.graph[*idx].clone())
                    .collect();
                stuck.sort();
                return Err(ManifestError::DependencyCycle(stuck.join(" -> ")));
            }

            wave.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

            for idx in &wave {
                in_degree.remove(idx);
                remaining -= 1;
                for neighbor in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&neighbor) {
                        *degree -= 1;
                    }
                }
            }

            waves.push(wave.into_iter().map(|idx| self.graph[idx].clone()).collect());
        }

        Ok(waves)
    }

    /// Flattened startup order reversed, for shutdown
    pub fn reverse_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self
            .waves()
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .collect();
        order.reverse();
        order
    }

    /// Names of the services this one directly depends on
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        let Some(&idx) = self.indices.get(name) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|dep| self.graph[dep].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(yaml: &str) -> Manifest {
        Manifest::from_str(yaml).unwrap()
    }

    #[test]
    fn test_independent_services_share_one_wave() {
        let m = manifest(
            r#"
name: x
services:
  a: {language: node, project: ./a}
  b: {language: node, project: ./b}
"#,
        );
        let graph = ServiceGraph::build(&m).unwrap();
        let waves = graph.waves().unwrap();
        assert_eq!(waves, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn test_chain_produces_layers() {
        let m = manifest(
            r#"
name: x
services:
  db: {language: process, project: ./db}
  api: {language: node, project: ./api, uses: [db]}
  web: {language: node, project: ./web, uses: [api]}
"#,
        );
        let graph = ServiceGraph::build(&m).unwrap();
        let waves = graph.waves().unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["db".to_string()],
                vec!["api".to_string()],
                vec!["web".to_string()],
            ]
        );
    }

    #[test]
    fn test_diamond() {
        let m = manifest(
            r#"
name: x
services:
  db: {language: process, project: ./db}
  api: {language: node, project: ./api, uses: [db]}
  jobs: {language: node, project: ./jobs, uses: [db]}
  web: {language: node, project: ./web, uses: [api, jobs]}
"#,
        );
        let graph = ServiceGraph::build(&m).unwrap();
        let waves = graph.waves().unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec!["db".to_string()]);
        assert_eq!(waves[1], vec!["api".to_string(), "jobs".to_string()]);
        assert_eq!(waves[2], vec!["web".to_string()]);
    }

    #[test]
    fn test_cycle_is_fatal() {
        let m = manifest(
            r#"
name: x
services:
  a: {language: node, project: ./a, uses: [b]}
  b: {language: node, project: ./b, uses: [a]}
"#,
        );
        let err = ServiceGraph::build(&m).unwrap_err();
        assert!(matches!(err, ManifestError::DependencyCycle(_)));
    }

    #[test]
    fn test_reverse_order_tears_down_dependents_first() {
        let m = manifest(
            r#"
name: x
services:
  db: {language: process, project: ./db}
  api: {language: node, project: ./api, uses: [db]}
"#,
        );
        let graph = ServiceGraph::build(&m).unwrap();
        assert_eq!(
            graph.reverse_order(),
            vec!["api".to_string(), "db".to_string()]
        );
    }

    #[test]
    fn test_dependencies_of() {
        let m = manifest(
            r#"
name: x
services:
  db: {language: process, project: ./db}
  api: {language: node, project: ./api, uses: [db]}
"#,
        );
        let graph = ServiceGraph::build(&m).unwrap();
        assert_eq!(graph.dependencies_of("api"), vec!["db".to_string()]);
        assert!(graph.dependencies_of("db").is_empty());
    }
}
