//! Interleaved construction-order planners.
//!
//! A plan decides the order in which nodes are instantiated and, for each
//! step, which edges become realizable once that node exists. All five
//! strategies emit the same shape: a node permutation, one edge slot per
//! node, and the running realized-edge count. They differ only in the
//! node-selection rule.
//!
//! Planners are pure: no I/O, no failure modes beyond what the graph
//! already guarantees. An empty graph yields an empty plan.

use crate::graph::{Edge, Graph};
use crate::TopologyError;
use std::fmt;
use std::str::FromStr;

/// Node-selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Nodes in id order.
    Naive,
    /// Greedy on residual degree, maintained incrementally.
    Degree,
    /// Greedy on newly enabled edge count, recomputed each step.
    Dynamic,
    /// Greedy on newly enabled edge weight.
    WeightedDynamic,
    /// One-ply lookahead on enabled edge weight.
    BestWeightedDynamic,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::Naive,
        Strategy::Degree,
        Strategy::Dynamic,
        Strategy::WeightedDynamic,
        Strategy::BestWeightedDynamic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Naive => "naive",
            Strategy::Degree => "degree",
            Strategy::Dynamic => "dynamic",
            Strategy::WeightedDynamic => "weighted_dynamic",
            Strategy::BestWeightedDynamic => "best_weighted_dynamic",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "naive" => Ok(Strategy::Naive),
            "degree" => Ok(Strategy::Degree),
            "dynamic" => Ok(Strategy::Dynamic),
            "weighted_dynamic" => Ok(Strategy::WeightedDynamic),
            "best_weighted_dynamic" => Ok(Strategy::BestWeightedDynamic),
            other => Err(TopologyError::UnknownStrategy(other.to_string())),
        }
    }
}

/// The planner output consumed by the realization engine.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Permutation of the vertex set.
    pub node_order: Vec<usize>,
    /// `edge_order[i]` holds the edges whose later endpoint is
    /// `node_order[i]`, sorted by `(min(a,b), max(a,b))`.
    pub edge_order: Vec<Vec<Edge>>,
    /// Non-decreasing prefix of realized edge counts, ending at `|E|`.
    pub cum_edges: Vec<usize>,
}

impl Plan {
    pub fn total_edges(&self) -> usize {
        self.cum_edges.last().copied().unwrap_or(0)
    }

    /// Entry-wise reversal along the outer index, used for `clean`.
    /// `cum_edges` is left untouched; clean mode does not consume it.
    pub fn reverse_outer(&mut self) {
        self.node_order.reverse();
        self.edge_order.reverse();
    }

    /// Cost metric: sum over steps of `step_index * edges_emitted`, i.e.
    /// how many node instantiations each link had to wait behind.
    pub fn node_residency_cost(&self) -> usize {
        self.cum_edges
            .windows(2)
            .enumerate()
            .map(|(i, w)| (i + 1) * (w[1] - w[0]))
            .sum()
    }
}

/// Compute a plan for `graph` under `strategy`.
pub fn plan(graph: &Graph, strategy: Strategy) -> Plan {
    match strategy {
        Strategy::Naive => naive(graph),
        Strategy::Degree => degree(graph),
        Strategy::Dynamic => dynamic(graph),
        Strategy::WeightedDynamic => weighted_dynamic(graph),
        Strategy::BestWeightedDynamic => best_weighted_dynamic(graph),
    }
}

/// Edges between `node` and already-installed vertices, in slot order.
fn enabled_edges(graph: &Graph, node: usize, installed: &[bool]) -> Vec<Edge> {
    let mut edges: Vec<Edge> = graph
        .incident(node)
        .iter()
        .map(|&idx| *graph.edge(idx))
        .filter(|e| installed[e.peer_of(node)])
        .collect();
    edges.sort_by_key(|e| e.key());
    edges
}

fn finish(graph: &Graph, node_order: Vec<usize>, edge_order: Vec<Vec<Edge>>) -> Plan {
    debug_assert_eq!(node_order.len(), graph.node_num());
    let mut cum_edges = Vec::with_capacity(edge_order.len());
    let mut acc = 0;
    for slot in &edge_order {
        acc += slot.len();
        cum_edges.push(acc);
    }
    debug_assert_eq!(acc, graph.edge_num());
    Plan {
        node_order,
        edge_order,
        cum_edges,
    }
}

fn naive(graph: &Graph) -> Plan {
    let n = graph.node_num();
    let mut installed = vec![false; n];
    let mut node_order = Vec::with_capacity(n);
    let mut edge_order = Vec::with_capacity(n);
    for v in 0..n {
        edge_order.push(enabled_edges(graph, v, &installed));
        installed[v] = true;
        node_order.push(v);
    }
    finish(graph, node_order, edge_order)
}

fn degree(graph: &Graph) -> Plan {
    let n = graph.node_num();
    let mut installed = vec![false; n];
    // Residual score: number of already-installed neighbors.
    let mut score = vec![0usize; n];
    let mut node_order = Vec::with_capacity(n);
    let mut edge_order = Vec::with_capacity(n);

    for _ in 0..n {
        let mut best = None;
        for v in 0..n {
            if installed[v] {
                continue;
            }
            match best {
                Some((_, s)) if score[v] <= s => {}
                _ => best = Some((v, score[v])),
            }
        }
        let Some((v, _)) = best else { break };
        edge_order.push(enabled_edges(graph, v, &installed));
        installed[v] = true;
        node_order.push(v);
        for (_, peer) in graph.neighbors(v) {
            if !installed[peer] {
                score[peer] += 1;
            }
        }
    }
    finish(graph, node_order, edge_order)
}

/// Unweighted gain of installing `node` next: newly enabled edge count.
fn gain(graph: &Graph, node: usize, installed: &[bool]) -> usize {
    graph
        .neighbors(node)
        .filter(|&(_, peer)| installed[peer])
        .count()
}

/// Weighted gain: sum of enabled edge weights.
fn gain_weighted(graph: &Graph, node: usize, installed: &[bool]) -> u64 {
    graph
        .neighbors(node)
        .filter(|&(_, peer)| installed[peer])
        .map(|(idx, _)| graph.edge(idx).weight)
        .sum()
}

fn dynamic(graph: &Graph) -> Plan {
    greedy_by(graph, |g, v, installed| gain(g, v, installed) as u64)
}

fn weighted_dynamic(graph: &Graph) -> Plan {
    greedy_by(graph, gain_weighted)
}

/// Shared greedy loop: at each step pick the uninstalled vertex with the
/// highest score, ties broken by lowest id (strict-greater scan).
fn greedy_by(graph: &Graph, score: impl Fn(&Graph, usize, &[bool]) -> u64) -> Plan {
    let n = graph.node_num();
    let mut installed = vec![false; n];
    let mut node_order = Vec::with_capacity(n);
    let mut edge_order = Vec::with_capacity(n);

    for _ in 0..n {
        let mut best = None;
        for v in 0..n {
            if installed[v] {
                continue;
            }
            let s = score(graph, v, &installed);
            match best {
                Some((_, bs)) if s <= bs => {}
                _ => best = Some((v, s)),
            }
        }
        let Some((v, _)) = best else { break };
        edge_order.push(enabled_edges(graph, v, &installed));
        installed[v] = true;
        node_order.push(v);
    }
    finish(graph, node_order, edge_order)
}

fn best_weighted_dynamic(graph: &Graph) -> Plan {
    let n = graph.node_num();
    let mut installed = vec![false; n];
    let mut node_order = Vec::with_capacity(n);
    let mut edge_order = Vec::with_capacity(n);

    for step in 0..n {
        let mut best: Option<(usize, u64, u64)> = None; // (node, two-step, immediate)
        for v in 0..n {
            if installed[v] {
                continue;
            }
            let immediate = gain_weighted(graph, v, &installed);

            // Tentatively install v and evaluate the best follow-up.
            installed[v] = true;
            let mut followup = 0;
            if step + 1 < n {
                for w in 0..n {
                    if !installed[w] {
                        followup = followup.max(gain_weighted(graph, w, &installed));
                    }
                }
            }
            installed[v] = false;

            let two_step = immediate + followup;
            let better = match best {
                None => true,
                Some((_, bt, bi)) => two_step > bt || (two_step == bt && immediate > bi),
            };
            if better {
                best = Some((v, two_step, immediate));
            }
        }
        let Some((v, _, _)) = best else { break };
        edge_order.push(enabled_edges(graph, v, &installed));
        installed[v] = true;
        node_order.push(v);
    }
    finish(graph, node_order, edge_order)
}
