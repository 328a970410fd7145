//! Virtual-topology realization CLI
//!
//! `netweave` computes an interleaved node/link construction order for a
//! topology file and drives it against the kernel: one containerized
//! network namespace per node, links sharded across backbone namespaces,
//! cross-host links carried over VXLAN.
//!
//! Exit codes: 0 on success, 1 on argument validation failure, 2 on
//! runtime failure.

mod commands;

use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "netweave", version, about, long_about = None)]
struct Cli {
    /// Operation [setup|clean]
    #[arg(short = 'o', value_name = "OPERATION")]
    operation: String,

    /// Interleave algorithm
    /// [naive|degree|dynamic|weighted_dynamic|best_weighted_dynamic]
    #[arg(short = 'a', value_name = "ALGORITHM")]
    algorithm: String,

    /// Topology file
    #[arg(short = 't', value_name = "FILE")]
    topofile: PathBuf,

    /// Link manager backend [ntlbr]
    #[arg(short = 'l', value_name = "MANAGER")]
    link_manager: String,

    /// Node manager backend [cctr]
    #[arg(short = 'N', value_name = "MANAGER")]
    node_manager: String,

    /// Number of backbone network namespaces
    #[arg(short = 'b', value_name = "NUM", default_value_t = 1)]
    backbone_ns_num: usize,

    /// Value of the per-backbone disable_ipv6 sysctl
    #[arg(short = 'd', value_name = "NUM", default_value_t = 0)]
    disable_ipv6: u8,

    /// Server config file
    #[arg(short = 's', value_name = "FILE")]
    server_file: Option<PathBuf>,

    /// ID of this server within the server config
    #[arg(short = 'i', value_name = "ID", default_value_t = 0)]
    server_id: usize,

    /// Parallel link-setup workers (0 = serial)
    #[arg(short = 'p', value_name = "NUM", default_value_t = 0)]
    parallel: usize,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let validated = match commands::validate(&cli) {
        Ok(v) => v,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::from(1);
        }
    };

    match commands::execute(&cli, validated) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
