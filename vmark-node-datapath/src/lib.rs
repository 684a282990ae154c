// The XDP datapath is Linux-only. This crate does not compile for other targets.
#![cfg(target_os = "linux")]

pub mod cmd;
pub mod codec;
pub mod iface;
pub mod loader;
pub mod maps;

pub use codec::{ActionKind, ActionStep, FwKey, TagKind, KEY_LEN, MAX_ACTIONS, VALUE_LEN};
pub use iface::InterfaceRef;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DatapathError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("'{command}' failed: {output}")]
    Tool { command: String, output: String },

    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("XDP object file not found: {0}")]
    ObjectMissing(PathBuf),

    #[error("BPF filesystem unavailable: {0}")]
    BpfFs(String),

    #[error("map codec error: {0}")]
    Codec(String),

    #[error("failed to parse bpftool output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, DatapathError>;
