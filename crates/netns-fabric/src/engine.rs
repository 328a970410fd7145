//! Realization engine
//!
//! Drives a plan against a `NodeManager`/`LinkManager` pair: instantiate
//! each node in order, then realize every edge that node enables, opening
//! a fresh backbone namespace whenever the link counter crosses a shard
//! boundary. Link setup runs inline or on the worker pool.
//!
//! The engine must run on a current-thread runtime: the kernel scopes
//! network-namespace membership to the OS thread, and a namespace switch
//! must never be separated from the netlink calls that rely on it by a
//! runtime migration.

use crate::config::EngineContext;
use crate::env::LinkLog;
use crate::link::LinkManager;
use crate::node::NodeManager;
use crate::worker::WorkerPool;
use crate::FabricError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use topology::{Graph, Plan};
use tracing::{info, warn};

/// Realize a planned topology. On error the driver returns to the host
/// namespace and tears the managers down; already-realized nodes and
/// links are left for `clean`.
pub async fn network_setup<NM, LM>(
    ctx: &EngineContext,
    nodes: &Arc<NM>,
    links: &Arc<LM>,
    plan: &Plan,
    link_log: &Arc<LinkLog>,
) -> Result<(), FabricError>
where
    NM: NodeManager,
    LM: LinkManager + 'static,
{
    nodes.init(true)?;
    links.init()?;

    let outcome = drive_setup(ctx, nodes, links, plan, link_log).await;

    if let Err(e) = links.enter_host() {
        warn!("failed to return to host namespace: {}", e);
    }
    links.delete();
    nodes.delete();
    outcome
}

async fn drive_setup<NM, LM>(
    ctx: &EngineContext,
    nodes: &Arc<NM>,
    links: &Arc<LM>,
    plan: &Plan,
    link_log: &Arc<LinkLog>,
) -> Result<(), FabricError>
where
    NM: NodeManager,
    LM: LinkManager + 'static,
{
    let node_num = plan.node_order.len();
    let edge_num = plan.total_edges();
    let link_per_backbone = edge_num.div_ceil(ctx.backbone_ns_num).max(1);
    info!(
        "realizing {} nodes, {} links, {} links per backbone",
        node_num, edge_num, link_per_backbone
    );

    let pool = if ctx.parallel > 0 {
        Some(WorkerPool::new(ctx.parallel)?)
    } else {
        None
    };

    let node_per_report = node_num / 100;
    let mut report_clock = Instant::now();
    let mut launcher_total = Duration::ZERO;
    let mut node_total = Duration::ZERO;
    let mut link_total = Duration::ZERO;
    let mut cur_backbone = None;

    for (i, &node) in plan.node_order.iter().enumerate() {
        if node_per_report > 0 && i % node_per_report == 0 {
            info!(
                "{}% nodes added, {}ms since last report",
                100 * i / node_num,
                report_clock.elapsed().as_millis()
            );
            report_clock = Instant::now();
        }

        let node_started = Instant::now();
        launcher_total += nodes.setup_node(node).await?;
        node_total += node_started.elapsed();

        link_log.node_header(node);
        let batch = &plan.edge_order[i];
        let link_started = Instant::now();

        for edge in batch {
            let link_index = links.next_link_index();
            if link_index as usize % link_per_backbone == 0 {
                cur_backbone = Some(links.enter_new_backbone()?);
            }
            let backbone = cur_backbone
                .clone()
                .ok_or(crate::link::LinkError::NoActiveBackbone)?;

            match &pool {
                None => {
                    let started = Instant::now();
                    links.setup_link(&backbone, link_index, edge).await?;
                    link_log.link_line(link_index, started.elapsed());
                }
                Some(pool) => {
                    let links = links.clone();
                    let link_log = link_log.clone();
                    let edge = *edge;
                    pool.submit(move |runtime| {
                        links.enter_backbone(&backbone)?;
                        let started = Instant::now();
                        runtime.block_on(links.setup_link(&backbone, link_index, &edge))?;
                        link_log.link_line(link_index, started.elapsed());
                        Ok(())
                    })?;
                }
            }
        }

        if let Some(pool) = &pool {
            if !batch.is_empty() {
                pool.wait()?;
            }
        }
        link_total += link_started.elapsed();
    }

    info!("launcher time: {:.2}s", launcher_total.as_secs_f64());
    info!("node setup time: {:.2}s", node_total.as_secs_f64());
    info!("link setup time: {:.2}s", link_total.as_secs_f64());
    Ok(())
}

/// Tear a realized topology down. Nodes are killed in the graph's natural
/// vertex order (the backbone namespaces holding the links are destroyed
/// wholesale afterwards, so per-edge teardown is unnecessary). Individual
/// launcher failures are logged and skipped so a second run over
/// half-cleaned state converges instead of aborting.
pub async fn network_clean<NM, LM>(
    nodes: &Arc<NM>,
    links: &Arc<LM>,
    graph: &Graph,
) -> Result<(), FabricError>
where
    NM: NodeManager,
    LM: LinkManager + 'static,
{
    nodes.init(false)?;
    links.init()?;

    let mut failed = 0usize;
    for node in 0..graph.node_num() {
        if let Err(e) = nodes.clean_node(node).await {
            warn!("failed to clean node {}: {}", node, e);
            failed += 1;
        }
    }
    if failed > 0 {
        info!("{} of {} nodes did not clean", failed, graph.node_num());
    }

    links.quiesce().await?;
    links.clean_all_backbones().await?;

    links.delete();
    nodes.delete();
    Ok(())
}
