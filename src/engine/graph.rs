use std::collections::HashMap;
use std::fmt::Display;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::engine::Task;
use crate::error::TaskError;
use crate::signature::Signature;

/// A task together with everything it transitively depends on.
///
/// One node per signature; edges point from a dependency to its dependent.
pub struct TaskGraph {
    graph: Graph<Task, ()>,
    root: NodeIndex,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn root(&self) -> &Task {
        &self.graph[self.root]
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Direct dependencies of `task`, if it is part of the graph.
    pub fn dependencies_of(&self, task: &Task) -> Vec<&Task> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index] == *task)
            .map(|index| {
                self.graph
                    .neighbors_directed(index, petgraph::Direction::Incoming)
                    .map(|dep| &self.graph[dep])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every task ordered so that dependencies come before their dependents.
    pub fn toposort(&self) -> Result<Vec<Task>, TaskError> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|i| self.graph[i].clone()).collect())
            .map_err(|cycle| TaskError::Cycle {
                task: self.graph[cycle.node_id()].name().to_string(),
            })
    }
}

impl Task {
    /// Builds the dependency graph rooted at this task.
    pub fn graph(&self) -> TaskGraph {
        let mut graph = Graph::new();
        let mut indices: HashMap<Signature, NodeIndex> = HashMap::new();

        let root = graph.add_node(self.clone());
        indices.insert(self.signature(), root);

        let mut pending = vec![(self.clone(), root)];
        while let Some((task, index)) = pending.pop() {
            for dep in task.dependencies() {
                let dep_index = match indices.get(&dep.signature()) {
                    Some(&existing) => existing,
                    None => {
                        let added = graph.add_node(dep.clone());
                        indices.insert(dep.signature(), added);
                        pending.push((dep, added));
                        added
                    }
                };
                graph.update_edge(dep_index, index, ());
            }
        }

        TaskGraph { graph, root }
    }
}

impl Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }
}
