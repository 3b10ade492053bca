//! Dependency DAG over the requests of one environment.
//!
//! Nodes are package names; an edge runs from a dependency to its dependent.
//! Dependencies naming packages outside the request set are treated as
//! externals that are already available and produce no edge.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::ConflictError;
use crate::request::BuildRequest;

pub struct RequestDag {
  graph: DiGraph<String, ()>,
  nodes: BTreeMap<String, NodeIndex>,
}

impl RequestDag {
  /// Build the DAG from requests with unique names.
  ///
  /// # Errors
  ///
  /// Returns `ConflictError::Cycle` naming every package of the first cycle found.
  pub fn from_requests<'a>(requests: impl IntoIterator<Item = &'a BuildRequest>) -> Result<Self, ConflictError> {
    let requests: Vec<&BuildRequest> = requests.into_iter().collect();
    let mut graph = DiGraph::new();
    let mut nodes = BTreeMap::new();

    for request in &requests {
      let idx = graph.add_node(request.name().to_string());
      nodes.insert(request.name().to_string(), idx);
    }

    for request in &requests {
      let dependent = nodes[request.name()];
      for dep in request.dependencies() {
        if let Some(&dep_idx) = nodes.get(dep) {
          graph.add_edge(dep_idx, dependent, ());
        }
      }
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), ConflictError> {
    if toposort(&self.graph, None).is_ok() {
      return Ok(());
    }

    let members = tarjan_scc(&self.graph)
      .into_iter()
      .find(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .map(|scc| {
        let mut names: Vec<String> = scc.into_iter().map(|idx| self.graph[idx].clone()).collect();
        names.sort();
        names
      })
      .unwrap_or_default();
    Err(ConflictError::Cycle { members })
  }

  /// Package names with dependencies before dependents. Ties keep name order.
  pub fn topological_order(&self) -> Vec<String> {
    self.waves().into_iter().flatten().collect()
  }

  /// Packages grouped into levels; every package's dependencies lie in
  /// earlier waves.
  pub fn waves(&self) -> Vec<Vec<String>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();
    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|&&idx| in_degree[&idx] == 0).copied().collect();
      // Acyclicity is checked on construction.
      if ready.is_empty() {
        break;
      }

      let mut wave = Vec::with_capacity(ready.len());
      for idx in ready {
        remaining.remove(&idx);
        wave.push(self.graph[idx].clone());
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }
      wave.sort();
      waves.push(wave);
    }

    waves
  }

  /// Direct in-set dependencies of a package.
  pub fn dependencies(&self, name: &str) -> BTreeSet<String> {
    self.neighbors(name, Direction::Incoming)
  }

  fn neighbors(&self, name: &str, direction: Direction) -> BTreeSet<String> {
    let Some(&idx) = self.nodes.get(name) else {
      return BTreeSet::new();
    };
    self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.nodes.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}
