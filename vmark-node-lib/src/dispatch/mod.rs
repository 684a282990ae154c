//! Command dispatcher: routes `(verb, args)` lines from the CLI or the
//! `/api/execute` endpoint to the forwarding engine, the TWAMP registry, or
//! interface provisioning.

mod twamp;
pub mod validate;
mod xdp;

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::forwarding::ForwardingEngine;
use crate::state::StatePaths;
use crate::twamp::SessionRegistry;

/// Shared handles every verb handler works against.
pub struct Node {
    pub paths: StatePaths,
    pub engine: ForwardingEngine,
    pub registry: Arc<SessionRegistry>,
}

impl Node {
    pub fn new(paths: StatePaths, xdp_object: PathBuf) -> Self {
        let engine = ForwardingEngine::new(&paths, xdp_object);
        Self {
            paths,
            engine,
            registry: SessionRegistry::new(),
        }
    }
}

/// Execute one command line and return its textual output.
///
/// Unknown top-level verbs are not errors: the CLI is interactive and the
/// original shell answers them with a plain message.
pub async fn dispatch(node: &Node, line: &str) -> Result<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.split_first() {
        None => Ok("No command entered. Type 'help' for more information.".into()),
        Some((&"xdp-switch", rest)) => xdp::handle(node, rest).await,
        Some((&"twamp", rest)) => twamp::handle(node, rest).await,
        Some((&"config", rest)) => crate::netconf::handle(node, rest).await,
        Some((verb, _)) => Ok(format!("Unknown command: {verb}")),
    }
}
