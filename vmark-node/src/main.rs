#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vmark_node_lib::api::register::{run_registration, RegistrationOutcome};
use vmark_node_lib::api::server;
use vmark_node_lib::dispatch::dispatch;
use vmark_node_lib::{Node, NodeError, RegisterState, StatePaths};

#[derive(Parser, Debug)]
#[command(author, version, about = "vMark-node network demarcation agent")]
struct Cli {
    /// State directory (defaults to ~/.vmark)
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Precompiled XDP object programmed into the datapath
    #[arg(
        long,
        value_name = "FILE",
        env = "VMARK_XDP_OBJECT",
        default_value = "/usr/lib/vmark-node/xdp_forwarding.o"
    )]
    xdp_object: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the datapath and serve the control API
    Run,
    /// Execute a single command line and print its output
    Exec {
        /// Verb line, e.g. `xdp-switch show-forwarding json`
        line: Vec<String>,
    },
    /// Link this node to a vMark controller
    Register {
        /// IP address for this node to listen on
        #[arg(long)]
        listen_ip: IpAddr,
        /// Port for this node to listen on (1024-65535)
        #[arg(long)]
        port: u16,
        /// Use a 4-digit PIN instead of a long token
        #[arg(long)]
        pin: bool,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let paths = match &cli.state_dir {
        Some(dir) => StatePaths::at(dir.clone()),
        None => StatePaths::default_location(),
    };
    let paths = match paths {
        Ok(p) => p,
        Err(err) => {
            error!(%err, "cannot prepare state directory");
            std::process::exit(1);
        }
    };
    let node = Arc::new(Node::new(paths.clone(), cli.xdp_object.clone()));

    match cli.command {
        Command::Run => run_agent(node, &paths).await,
        Command::Exec { line } => exec_line(&node, &line.join(" ")).await,
        Command::Register { listen_ip, port, pin } => {
            if !(1024..=65535).contains(&port) {
                error!(port, "port must be between 1024 and 65535");
                std::process::exit(1);
            }
            register(node, &paths, listen_ip, port, pin).await
        }
    }
}

async fn run_agent(node: Arc<Node>, paths: &StatePaths) {
    // The store is the authority for intent, the kernel for reality; resolve
    // any disagreement before serving requests.
    match node.engine.reconcile().await {
        Ok(msg) => info!("{msg}"),
        Err(err) => warn!(%err, "startup reconciliation failed, continuing"),
    }

    let state = match RegisterState::load(paths) {
        Ok(Some(state)) if state.is_registered() => state,
        Ok(_) => {
            info!("node is not registered; run 'vmark-node register' first");
            return;
        }
        Err(err) => {
            error!(%err, "cannot load registration state");
            std::process::exit(1);
        }
    };

    if let Err(err) = server::serve(node, &state).await {
        error!(%err, "API server exited with error");
        std::process::exit(1);
    }
}

async fn exec_line(node: &Node, line: &str) {
    match dispatch(node, line).await {
        Ok(output) => println!("{output}"),
        Err(err) => {
            eprintln!("Error: {err}");
            let code = match &err {
                NodeError::Validation(_) | NodeError::Conflict(_) | NodeError::NotFound(_) => 2,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}

async fn register(node: Arc<Node>, paths: &StatePaths, listen_ip: IpAddr, port: u16, pin: bool) {
    match run_registration(paths, listen_ip, port, pin).await {
        Ok(RegistrationOutcome::Registered(state)) => {
            println!("Registration successful! Node is now connected to vMark.");
            if let Err(err) = server::serve(node, &state).await {
                error!(%err, "API server exited with error");
                std::process::exit(1);
            }
        }
        Ok(RegistrationOutcome::Cancelled) => {
            println!("Registration cancelled by user.");
        }
        Err(err) => {
            error!(%err, "registration failed");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
