//! Engine ordering guarantees, checked against instrumented managers:
//! node setup precedes the edges it enables, backbone namespaces open
//! exactly at shard boundaries, and the per-node join keeps batches
//! ordered even under the worker pool.

use netns_fabric::config::EngineContext;
use netns_fabric::env::LinkLog;
use netns_fabric::link::{LinkError, LinkManager};
use netns_fabric::netns::NetnsHandle;
use netns_fabric::node::{NodeError, NodeManager};
use netns_fabric::{network_clean, network_setup};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use topology::{order, Edge, Graph, Strategy};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Init { purge: bool },
    Node(usize),
    CleanNode(usize),
    NewBackbone(u32),
    Link { index: u64, key: (usize, usize) },
    Quiesce,
    CleanAll,
    EnterHost,
}

type EventLog = Arc<Mutex<Vec<Event>>>;

struct MockNodes {
    events: EventLog,
    fail_clean_on: Option<usize>,
}

impl NodeManager for MockNodes {
    fn init(&self, purge_existing: bool) -> Result<(), NodeError> {
        self.events.lock().push(Event::Init {
            purge: purge_existing,
        });
        Ok(())
    }

    async fn setup_node(&self, node: usize) -> Result<Duration, NodeError> {
        self.events.lock().push(Event::Node(node));
        Ok(Duration::from_micros(1))
    }

    fn node_netns(&self, _node: usize) -> Result<Arc<NetnsHandle>, NodeError> {
        Ok(Arc::new(NetnsHandle::current()?))
    }

    async fn clean_node(&self, node: usize) -> Result<(), NodeError> {
        if self.fail_clean_on == Some(node) {
            return Err(NodeError::UnknownNode(node));
        }
        self.events.lock().push(Event::CleanNode(node));
        Ok(())
    }

    fn delete(&self) {}
}

struct MockLinks {
    events: EventLog,
    counters: Mutex<(u64, u32)>,
    fail_on_link: Option<u64>,
}

impl MockLinks {
    fn new(events: EventLog, fail_on_link: Option<u64>) -> Self {
        Self {
            events,
            counters: Mutex::new((0, 0)),
            fail_on_link,
        }
    }
}

impl LinkManager for MockLinks {
    fn init(&self) -> Result<(), LinkError> {
        Ok(())
    }

    fn enter_new_backbone(&self) -> Result<Arc<NetnsHandle>, LinkError> {
        let index = {
            let mut counters = self.counters.lock();
            let index = counters.1;
            counters.1 += 1;
            index
        };
        self.events.lock().push(Event::NewBackbone(index));
        Ok(Arc::new(NetnsHandle::current()?))
    }

    fn enter_backbone(&self, _bb: &NetnsHandle) -> Result<(), LinkError> {
        Ok(())
    }

    fn enter_host(&self) -> Result<(), LinkError> {
        self.events.lock().push(Event::EnterHost);
        Ok(())
    }

    fn next_link_index(&self) -> u64 {
        let mut counters = self.counters.lock();
        let index = counters.0;
        counters.0 += 1;
        index
    }

    async fn setup_link(
        &self,
        _bb: &NetnsHandle,
        link_index: u64,
        edge: &Edge,
    ) -> Result<(), LinkError> {
        if self.fail_on_link == Some(link_index) {
            return Err(LinkError::NotFound(format!("injected-{}", link_index)));
        }
        self.events.lock().push(Event::Link {
            index: link_index,
            key: edge.key(),
        });
        Ok(())
    }

    async fn clean_all_backbones(&self) -> Result<(), LinkError> {
        self.events.lock().push(Event::CleanAll);
        Ok(())
    }

    async fn quiesce(&self) -> Result<(), LinkError> {
        self.events.lock().push(Event::Quiesce);
        Ok(())
    }

    fn delete(&self) {}
}

fn path_graph(edge_num: usize) -> Graph {
    let mut g = Graph::with_nodes(edge_num + 1);
    for i in 0..edge_num {
        g.add_edge(Edge::new(i, i + 1, 0, -1, 1));
    }
    g
}

fn ctx(parallel: usize, backbone_ns_num: usize) -> EngineContext {
    EngineContext::local_default(false, parallel, backbone_ns_num).unwrap()
}

fn link_log(dir: &tempfile::TempDir) -> Arc<LinkLog> {
    Arc::new(LinkLog::open(&dir.path().join("link_log.txt")).unwrap())
}

fn run_setup(
    parallel: usize,
    backbone_ns_num: usize,
    fail_on_link: Option<u64>,
) -> (Vec<Event>, Result<(), netns_fabric::FabricError>) {
    let dir = tempfile::tempdir().unwrap();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let graph = path_graph(10);
    let plan = order::plan(&graph, Strategy::Naive);

    let nodes = Arc::new(MockNodes {
        events: events.clone(),
        fail_clean_on: None,
    });
    let links = Arc::new(MockLinks::new(events.clone(), fail_on_link));
    let context = ctx(parallel, backbone_ns_num);
    let log = link_log(&dir);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let result = runtime.block_on(network_setup(&context, &nodes, &links, &plan, &log));

    let events = events.lock().clone();
    (events, result)
}

#[test]
fn serial_setup_orders_nodes_links_and_backbones() {
    // 10 links over 3 backbones: shard size 4, boundaries at 0, 4, 8.
    let (events, result) = run_setup(0, 3, None);
    result.unwrap();

    let backbones: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            Event::NewBackbone(i) => Some(*i),
            _ => None,
        })
        .collect();
    assert_eq!(backbones, vec![0, 1, 2]);

    let links: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            Event::Link { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(links, (0..10).collect::<Vec<u64>>());

    // Each shard-boundary link is directly preceded by its backbone.
    for (pos, event) in events.iter().enumerate() {
        if let Event::Link { index, .. } = event {
            if index % 4 == 0 {
                assert_eq!(
                    events[pos - 1],
                    Event::NewBackbone((index / 4) as u32),
                    "link {} not preceded by its backbone",
                    index
                );
            }
        }
    }

    assert_eq!(events.last(), Some(&Event::EnterHost));
}

#[test]
fn every_link_follows_both_of_its_nodes() {
    let (events, result) = run_setup(0, 1, None);
    result.unwrap();

    let mut installed = std::collections::HashSet::new();
    for event in &events {
        match event {
            Event::Node(v) => {
                installed.insert(*v);
            }
            Event::Link { key: (a, b), .. } => {
                assert!(
                    installed.contains(a) && installed.contains(b),
                    "link ({}, {}) before both nodes",
                    a,
                    b
                );
            }
            _ => {}
        }
    }
}

#[test]
fn cross_host_edges_flow_through_the_same_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    // Two nodes, one VXLAN edge toward server 1: a single backbone, a
    // single link, realized right after the second node.
    let mut graph = Graph::with_nodes(2);
    graph.add_edge(Edge::new(0, 1, 1, 42, 1));
    let plan = order::plan(&graph, Strategy::Degree);

    let nodes = Arc::new(MockNodes {
        events: events.clone(),
        fail_clean_on: None,
    });
    let links = Arc::new(MockLinks::new(events.clone(), None));
    let context = ctx(0, 1);
    let log = link_log(&dir);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime
        .block_on(network_setup(&context, &nodes, &links, &plan, &log))
        .unwrap();

    let events = events.lock().clone();
    assert_eq!(
        events,
        vec![
            Event::Init { purge: true },
            Event::Node(0),
            Event::Node(1),
            Event::NewBackbone(0),
            Event::Link {
                index: 0,
                key: (0, 1)
            },
            Event::EnterHost,
        ]
    );
}

#[test]
fn parallel_setup_realizes_every_link_with_per_node_joins() {
    let (events, result) = run_setup(2, 3, None);
    result.unwrap();

    let links: std::collections::HashSet<u64> = events
        .iter()
        .filter_map(|e| match e {
            Event::Link { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(links, (0..10).collect());

    let backbone_count = events
        .iter()
        .filter(|e| matches!(e, Event::NewBackbone(_)))
        .count();
    assert_eq!(backbone_count, 3);

    // The per-node join: a batch's links all land before the next node.
    let mut installed = std::collections::HashSet::new();
    for event in &events {
        match event {
            Event::Node(v) => {
                installed.insert(*v);
            }
            Event::Link { key: (a, b), .. } => {
                assert!(installed.contains(a) && installed.contains(b));
            }
            _ => {}
        }
    }

    assert_eq!(events.last(), Some(&Event::EnterHost));
}

#[test]
fn serial_failure_aborts_but_returns_to_host() {
    let (events, result) = run_setup(0, 1, Some(5));
    assert!(result.is_err());

    let links: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            Event::Link { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(links, (0..5).collect::<Vec<u64>>());
    assert_eq!(events.last(), Some(&Event::EnterHost));
}

#[test]
fn parallel_failure_is_collected_at_the_join() {
    let (events, result) = run_setup(2, 1, Some(3));
    assert!(result.is_err());
    assert_eq!(events.last(), Some(&Event::EnterHost));
}

#[test]
fn setup_purges_node_state_but_clean_does_not() {
    let (events, result) = run_setup(0, 1, None);
    result.unwrap();
    assert_eq!(events.first(), Some(&Event::Init { purge: true }));
}

#[test]
fn clean_walks_nodes_in_natural_order_then_destroys_backbones() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let graph = path_graph(3);
    let nodes = Arc::new(MockNodes {
        events: events.clone(),
        fail_clean_on: None,
    });
    let links = Arc::new(MockLinks::new(events.clone(), None));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime
        .block_on(network_clean(&nodes, &links, &graph))
        .unwrap();

    let events = events.lock().clone();
    assert_eq!(
        events,
        vec![
            Event::Init { purge: false },
            Event::CleanNode(0),
            Event::CleanNode(1),
            Event::CleanNode(2),
            Event::CleanNode(3),
            Event::Quiesce,
            Event::CleanAll,
        ]
    );
}

#[test]
fn clean_skips_nodes_that_fail_to_die() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let graph = path_graph(3);
    let nodes = Arc::new(MockNodes {
        events: events.clone(),
        fail_clean_on: Some(1),
    });
    let links = Arc::new(MockLinks::new(events.clone(), None));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime
        .block_on(network_clean(&nodes, &links, &graph))
        .unwrap();

    let events = events.lock().clone();
    let cleaned: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            Event::CleanNode(v) => Some(*v),
            _ => None,
        })
        .collect();
    assert_eq!(cleaned, vec![0, 2, 3]);
    assert!(events.contains(&Event::CleanAll));
}
