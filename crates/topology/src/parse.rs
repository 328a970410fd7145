//! Topology file parser.
//!
//! The format is plain text, line based:
//!
//! ```text
//! # comment
//! 3 3
//! 0 1 0 -1
//! 1 2 0 -1
//! 0 2 1 42 3
//! ```
//!
//! The first non-comment line is `n m`; each of the following `m` lines is
//! `a b server vxlan [weight]` with node ids in `[0, n)`. `vxlan == -1`
//! marks an internal edge; the optional weight defaults to 1.

use crate::graph::{Edge, Graph};
use crate::TopologyError;
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Parse a topology file from a path.
pub fn read_graph_from_file(path: &Path) -> Result<Graph, TopologyError> {
    let file = std::fs::File::open(path)?;
    read_graph(BufReader::new(file))
}

/// Parse a topology from any reader.
pub fn read_graph<R: Read>(reader: BufReader<R>) -> Result<Graph, TopologyError> {
    let mut lines = reader.lines().enumerate();

    let (header_line, header) = loop {
        match lines.next() {
            Some((no, line)) => {
                let line = line?;
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                break (no + 1, trimmed.to_string());
            }
            None => {
                return Err(TopologyError::Malformed {
                    line: 0,
                    reason: "missing 'n m' header".into(),
                })
            }
        }
    };

    let mut header_it = header.split_whitespace();
    let node_num = parse_field::<usize>(header_it.next(), header_line, "node count")?;
    let edge_num = parse_field::<usize>(header_it.next(), header_line, "edge count")?;
    if header_it.next().is_some() {
        return Err(TopologyError::Malformed {
            line: header_line,
            reason: "header must be exactly 'n m'".into(),
        });
    }

    let mut graph = Graph::with_nodes(node_num);
    let mut seen: HashSet<(usize, usize)> = HashSet::with_capacity(edge_num);

    while graph.edge_num() < edge_num {
        let (no, line) = match lines.next() {
            Some((no, line)) => (no + 1, line?),
            None => {
                return Err(TopologyError::Malformed {
                    line: header_line,
                    reason: format!(
                        "expected {} edges, file ended after {}",
                        edge_num,
                        graph.edge_num()
                    ),
                })
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut it = trimmed.split_whitespace();
        let a = parse_field::<usize>(it.next(), no, "endpoint a")?;
        let b = parse_field::<usize>(it.next(), no, "endpoint b")?;
        let server = parse_field::<usize>(it.next(), no, "server id")?;
        let vxlan = parse_field::<i32>(it.next(), no, "vxlan id")?;
        let weight = match it.next() {
            Some(tok) => tok.parse::<u64>().map_err(|_| TopologyError::Malformed {
                line: no,
                reason: format!("invalid weight '{}'", tok),
            })?,
            None => 1,
        };
        if it.next().is_some() {
            return Err(TopologyError::Malformed {
                line: no,
                reason: "trailing tokens after edge definition".into(),
            });
        }

        if a >= node_num || b >= node_num {
            return Err(TopologyError::Malformed {
                line: no,
                reason: format!("endpoint out of range ({}, {}) with n={}", a, b, node_num),
            });
        }
        if a == b {
            return Err(TopologyError::Malformed {
                line: no,
                reason: format!("self-loop on node {}", a),
            });
        }
        if vxlan < -1 {
            return Err(TopologyError::Malformed {
                line: no,
                reason: format!("invalid vxlan id {}", vxlan),
            });
        }
        let key = if a < b { (a, b) } else { (b, a) };
        if !seen.insert(key) {
            return Err(TopologyError::Malformed {
                line: no,
                reason: format!("duplicate edge ({}, {})", key.0, key.1),
            });
        }

        graph.add_edge(Edge::new(a, b, server, vxlan, weight));
    }

    Ok(graph)
}

fn parse_field<T: std::str::FromStr>(
    tok: Option<&str>,
    line: usize,
    what: &str,
) -> Result<T, TopologyError> {
    let tok = tok.ok_or_else(|| TopologyError::Malformed {
        line,
        reason: format!("missing {}", what),
    })?;
    tok.parse::<T>().map_err(|_| TopologyError::Malformed {
        line,
        reason: format!("invalid {} '{}'", what, tok),
    })
}
