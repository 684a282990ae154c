//! Interface name and index resolution.
//!
//! Sub-interfaces show up as `sub@parent` in `ip link` output. The datapath
//! always pins and attaches against the parent, while map keys use the index
//! of the base (sub) interface.

use tokio::process::Command;
use tracing::debug;

use crate::{DatapathError, Result};

/// Base name of an interface: the part before `@`, or the whole name.
pub fn base_name(name: &str) -> &str {
    name.split('@').next().unwrap_or(name)
}

/// Kernel index of an interface, resolved through sysfs for the base name.
pub async fn ifindex(name: &str) -> Result<u32> {
    let base = base_name(name);
    let path = format!("/sys/class/net/{base}/ifindex");
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| DatapathError::InterfaceNotFound(base.to_string()))?;
    raw.trim()
        .parse::<u32>()
        .map_err(|_| DatapathError::InterfaceNotFound(base.to_string()))
}

/// Resolve the parent interface a sub-interface hangs off.
///
/// A name already in `sub@parent` form is split directly. Otherwise
/// `ip -o link show dev <name>` is queried and its `idx: sub@parent:` prefix
/// parsed; a plain name with no `@` is its own parent.
pub async fn parent_name(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(DatapathError::InterfaceNotFound(String::new()));
    }
    if let Some((_, parent)) = name.split_once('@') {
        if !parent.is_empty() {
            return Ok(parent.to_string());
        }
    }

    let query = base_name(name);
    let out = Command::new("ip")
        .args(["-o", "link", "show", "dev", query])
        .output()
        .await
        .map_err(|source| DatapathError::Spawn { command: format!("ip -o link show dev {query}"), source })?;
    if !out.status.success() {
        debug!(interface = query, "ip link show failed, assuming base interface");
        return Ok(query.to_string());
    }

    let stdout = String::from_utf8_lossy(&out.stdout);
    Ok(parse_parent_from_link_line(&stdout).unwrap_or_else(|| query.to_string()))
}

/// Extract `parent` from a line shaped like `2: sub@parent: <FLAGS> ...`.
fn parse_parent_from_link_line(line: &str) -> Option<String> {
    let mut fields = line.split_whitespace();
    let _idx = fields.next()?;
    let name_field = fields.next()?;
    let name_field = name_field.strip_suffix(':').unwrap_or(name_field);
    let (_, parent) = name_field.split_once('@')?;
    if parent.is_empty() {
        None
    } else {
        Some(parent.to_string())
    }
}

/// An interface with its datapath-relevant coordinates resolved once.
#[derive(Debug, Clone)]
pub struct InterfaceRef {
    pub name: String,
    pub parent: String,
    pub index: u32,
}

impl InterfaceRef {
    pub async fn resolve(name: &str) -> Result<Self> {
        let index = ifindex(name).await?;
        let parent = parent_name(name).await?;
        Ok(Self { name: name.to_string(), parent, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("eth0"), "eth0");
        assert_eq!(base_name("if-a-cv90@ens160"), "if-a-cv90");
    }

    #[test]
    fn test_parse_parent_from_link_line() {
        let line = "2: if-a-cv90@ens160: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 xdp";
        assert_eq!(parse_parent_from_link_line(line).as_deref(), Some("ens160"));
    }

    #[test]
    fn test_parse_parent_plain_interface() {
        let line = "2: ens160: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500";
        assert_eq!(parse_parent_from_link_line(line), None);
    }
}
