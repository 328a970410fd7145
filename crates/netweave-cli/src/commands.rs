//! Command implementations for the netweave CLI
//!
//! Argument validation is separated from execution so the two failure
//! classes map cleanly onto the exit codes: validation errors exit 1,
//! runtime errors exit 2.

use crate::Cli;
use anyhow::{Context, Result};
use netns_fabric::env::{self, LinkLog};
use netns_fabric::{
    network_clean, network_setup, CctrNodeManager, EngineContext, NtlBrLinkManager,
};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use topology::{order, read_graph_from_file, Plan, Strategy};
use tracing::{info, warn, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Setup,
    Clean,
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Setup => "setup",
            Operation::Clean => "clean",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(Operation::Setup),
            "clean" => Ok(Operation::Clean),
            other => Err(format!("invalid operation: {}", other)),
        }
    }
}

/// Arguments that survived validation.
pub struct Validated {
    pub operation: Operation,
    pub strategy: Strategy,
}

/// Check everything that does not require touching the system.
pub fn validate(cli: &Cli) -> Result<Validated, String> {
    let operation = cli.operation.parse::<Operation>()?;
    let strategy = cli
        .algorithm
        .parse::<Strategy>()
        .map_err(|_| format!("invalid algorithm: {}", cli.algorithm))?;
    if cli.link_manager != "ntlbr" {
        return Err(format!("invalid link manager: {}", cli.link_manager));
    }
    if cli.node_manager != "cctr" {
        return Err(format!("invalid node manager: {}", cli.node_manager));
    }
    Ok(Validated {
        operation,
        strategy,
    })
}

/// Run the validated operation end to end.
pub fn execute(cli: &Cli, validated: Validated) -> Result<()> {
    let ctx = build_context(cli)?;
    init_tracing(&ctx, validated.operation, cli.verbose);

    let graph = read_graph_from_file(&cli.topofile)
        .with_context(|| format!("reading topology {}", cli.topofile.display()))?;

    let plan_started = Instant::now();
    let mut plan = order::plan(&graph, validated.strategy);
    log_plan_summary(&plan, validated.strategy, plan_started);

    if validated.operation == Operation::Clean {
        // Upstream reversal; the clean engine itself walks the graph's
        // natural vertex order.
        plan.reverse_outer();
    }

    if validated.operation == Operation::Setup {
        if let Err(e) = env::apply_host_sysctls() {
            warn!("host sysctls not applied: {}", e);
        }
    }

    let ctx = Arc::new(ctx);
    let nodes = Arc::new(CctrNodeManager::new(ctx.clone()));
    let links = Arc::new(NtlBrLinkManager::new(ctx.clone(), nodes.clone()));

    // Namespace membership is per OS thread; a current-thread runtime
    // keeps the whole realization on this one.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    let op_started = Instant::now();
    let outcome = match validated.operation {
        Operation::Setup => {
            let link_log = Arc::new(LinkLog::open(&ctx.link_log_path())?);
            runtime.block_on(network_setup(&ctx, &nodes, &links, &plan, &link_log))
        }
        Operation::Clean => runtime.block_on(network_clean(&nodes, &links, &graph)),
    };
    info!(
        "network {} time: {:.2}s",
        validated.operation,
        op_started.elapsed().as_secs_f64()
    );

    outcome.with_context(|| format!("network {} failed", validated.operation))
}

fn build_context(cli: &Cli) -> Result<EngineContext> {
    let disable_ipv6 = cli.disable_ipv6 != 0;
    let ctx = match &cli.server_file {
        Some(path) => EngineContext::from_server_file(
            path,
            cli.server_id,
            disable_ipv6,
            cli.parallel,
            cli.backbone_ns_num,
        )
        .with_context(|| format!("loading server config {}", path.display()))?,
        None => EngineContext::local_default(disable_ipv6, cli.parallel, cli.backbone_ns_num)?,
    };
    Ok(ctx)
}

/// Log to `{tmp}/{operation}_log.txt` when the work directory is usable,
/// falling back to stderr.
fn init_tracing(ctx: &EngineContext, operation: Operation, verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let log_path = ctx.operation_log_path(operation.name());

    let file = std::fs::create_dir_all(&ctx.tmp_dir)
        .and_then(|_| std::fs::File::create(&log_path))
        .ok();
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);
    match file {
        Some(file) => builder.with_ansi(false).with_writer(Arc::new(file)).init(),
        None => builder.init(),
    }
}

fn log_plan_summary(plan: &Plan, strategy: Strategy, started: Instant) {
    info!(
        "plan ({}): {} nodes, {} links, residency cost {}",
        strategy,
        plan.node_order.len(),
        plan.total_edges(),
        plan.node_residency_cost()
    );
    let slot_sum: usize = plan.edge_order.iter().map(|slot| slot.len()).sum();
    info!(
        "plan time: {:.2}s, edge slots sum to {}",
        started.elapsed().as_secs_f64(),
        slot_sum
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["netweave"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    fn base_args<'a>(operation: &'a str, algorithm: &'a str) -> Vec<&'a str> {
        vec![
            "-o", operation, "-a", algorithm, "-t", "topo.txt", "-l", "ntlbr", "-N", "cctr",
        ]
    }

    #[test]
    fn accepts_every_algorithm_name() {
        for name in [
            "naive",
            "degree",
            "dynamic",
            "weighted_dynamic",
            "best_weighted_dynamic",
        ] {
            let cli = cli(&base_args("setup", name));
            let validated = validate(&cli).unwrap();
            assert_eq!(validated.strategy.name(), name);
        }
    }

    #[test]
    fn accepts_both_operations() {
        assert_eq!(
            validate(&cli(&base_args("setup", "naive"))).unwrap().operation,
            Operation::Setup
        );
        assert_eq!(
            validate(&cli(&base_args("clean", "naive"))).unwrap().operation,
            Operation::Clean
        );
    }

    #[test]
    fn rejects_unknown_operation() {
        let err = validate(&cli(&base_args("teardown", "naive"))).unwrap_err();
        assert!(err.contains("teardown"));
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let err = validate(&cli(&base_args("setup", "fastest"))).unwrap_err();
        assert!(err.contains("fastest"));
    }

    #[test]
    fn rejects_unknown_managers() {
        let mut args = base_args("setup", "naive");
        args[7] = "iprbr";
        let err = validate(&cli(&args)).unwrap_err();
        assert!(err.contains("iprbr"));

        let mut args = base_args("setup", "naive");
        args[9] = "goctr";
        let err = validate(&cli(&args)).unwrap_err();
        assert!(err.contains("goctr"));
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let cli = cli(&base_args("setup", "naive"));
        assert_eq!(cli.backbone_ns_num, 1);
        assert_eq!(cli.disable_ipv6, 0);
        assert_eq!(cli.server_id, 0);
        assert_eq!(cli.parallel, 0);
        assert!(cli.server_file.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn operation_names_round_trip() {
        for op in [Operation::Setup, Operation::Clean] {
            assert_eq!(op.name().parse::<Operation>().unwrap(), op);
        }
    }
}
