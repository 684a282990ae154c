//! `config` verb family: VLAN sub-interface provisioning through `ip(8)`.

use tracing::{info, warn};

use vmark_node_datapath::cmd::{run_checked, run_privileged};
use vmark_node_datapath::iface::base_name;

use crate::dispatch::validate::{parse_ipv4, parse_mtu, parse_netmask, parse_vlan};
use crate::dispatch::Node;
use crate::error::{NodeError, Result};

const USAGE: &str =
    "Usage: config new-interface|interface|delete-interface ...";

pub async fn handle(node: &Node, args: &[&str]) -> Result<String> {
    match args.split_first() {
        None => Ok(USAGE.into()),
        Some((&"new-interface", rest)) => new_interface(rest).await,
        Some((&"interface", rest)) => interface_action(rest).await,
        Some((&"delete-interface", [name])) => delete_interface(node, name).await,
        Some((&"delete-interface", _)) => Err(NodeError::Validation(
            "Usage: config delete-interface <name>".into(),
        )),
        Some((cmd, _)) => Ok(format!(
            "Unknown config command: {cmd}. Supported: new-interface, interface, delete-interface."
        )),
    }
}

struct NewInterface<'a> {
    parent: Option<&'a str>,
    cvlan: Option<u16>,
    svlan: Option<u16>,
    mtu: Option<u32>,
    ipv4: Option<std::net::Ipv4Addr>,
    prefix: Option<u8>,
    status: &'a str,
}

/// `config new-interface <name> parent-interface <if> [cvlan-id N]
/// [svlan-id N] [mtu M] ipv4address <a.b.c.d> netmask </N|mask> [status up|down]`
async fn new_interface(args: &[&str]) -> Result<String> {
    let (&name, rest) = args.split_first().ok_or_else(|| {
        NodeError::Validation("Please specify a name for the new interface.".into())
    })?;

    let mut params = NewInterface {
        parent: None,
        cvlan: None,
        svlan: None,
        mtu: None,
        ipv4: None,
        prefix: None,
        status: "up",
    };

    let mut it = rest.iter();
    while let Some(key) = it.next() {
        let mut value = |key: &str| -> Result<&str> {
            it.next()
                .copied()
                .ok_or_else(|| NodeError::Validation(format!("Missing value for parameter: {key}")))
        };
        match *key {
            "parent-interface" => params.parent = Some(value("parent-interface")?),
            "cvlan-id" => params.cvlan = Some(parse_vlan("cvlan-id", value("cvlan-id")?)?),
            "svlan-id" => params.svlan = Some(parse_vlan("svlan-id", value("svlan-id")?)?),
            "mtu" => params.mtu = Some(parse_mtu(value("mtu")?)?),
            "ipv4address" => params.ipv4 = Some(parse_ipv4(value("ipv4address")?)?),
            "netmask" => params.prefix = Some(parse_netmask(value("netmask")?)?),
            "status" => {
                let status = value("status")?;
                if status != "up" && status != "down" {
                    return Err(NodeError::Validation(format!(
                        "Invalid status '{status}'. Choose from: up, down."
                    )));
                }
                params.status = status;
            }
            other => {
                return Err(NodeError::Validation(format!(
                    "Unknown parameter '{other}' or missing value."
                )))
            }
        }
    }

    let mut missing = Vec::new();
    if params.parent.is_none() {
        missing.push("parent-interface");
    }
    if params.ipv4.is_none() {
        missing.push("ipv4address");
    }
    if params.prefix.is_none() {
        missing.push("netmask");
    }
    if !missing.is_empty() {
        return Err(NodeError::Validation(format!(
            "Missing required parameters: {}",
            missing.join(", ")
        )));
    }
    let parent = params.parent.unwrap_or_default();
    let ipv4 = params.ipv4.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
    let prefix = params.prefix.unwrap_or_default();

    let exists = run_privileged(&["ip", "link", "show", parent]).await?;
    if !exists.success {
        return Err(NodeError::Validation(format!(
            "Parent interface '{parent}' does not exist."
        )));
    }

    // Outer tag first for QinQ, then the service interface itself.
    let mut outer_created: Option<String> = None;
    let create_res = async {
        match (params.svlan, params.cvlan) {
            (Some(svlan), Some(cvlan)) => {
                let outer = format!("{parent}.{svlan}");
                let svlan_s = svlan.to_string();
                let cvlan_s = cvlan.to_string();
                if !run_privileged(&["ip", "link", "show", &outer]).await?.success {
                    run_checked(&[
                        "ip", "link", "add", "link", parent, "name", &outer, "type", "vlan",
                        "id", &svlan_s,
                    ])
                    .await?;
                    run_checked(&["ip", "link", "set", &outer, "up"]).await?;
                    outer_created = Some(outer.clone());
                }
                run_checked(&[
                    "ip", "link", "add", "link", &outer, "name", name, "type", "vlan", "id",
                    &cvlan_s,
                ])
                .await?;
            }
            (None, Some(cvlan)) => {
                let cvlan_s = cvlan.to_string();
                run_checked(&[
                    "ip", "link", "add", "link", parent, "name", name, "type", "vlan", "id",
                    &cvlan_s,
                ])
                .await?;
            }
            // No tags requested: an untagged service point on a dummy link.
            _ => {
                run_checked(&["ip", "link", "add", "link", parent, "name", name, "type", "dummy"])
                    .await?;
            }
        }

        if let Some(mtu) = params.mtu {
            let mtu_s = mtu.to_string();
            run_checked(&["ip", "link", "set", "dev", name, "mtu", &mtu_s]).await?;
        }
        let addr = format!("{ipv4}/{prefix}");
        run_checked(&["ip", "addr", "add", &addr, "dev", name]).await?;
        run_checked(&["ip", "link", "set", "dev", name, params.status]).await?;
        Ok::<String, NodeError>(addr)
    }
    .await;

    match create_res {
        Ok(addr) => {
            info!(interface = name, parent, %addr, "sub-interface created");
            Ok(format!(
                "Successfully created interface {name} on parent {parent} with IP {addr}."
            ))
        }
        Err(err) => {
            // Undo partial creation so a retry starts clean.
            let _ = run_privileged(&["ip", "link", "delete", name]).await;
            if let Some(outer) = outer_created {
                let _ = run_privileged(&["ip", "link", "delete", &outer]).await;
            }
            warn!(interface = name, %err, "interface creation failed, partial links removed");
            Err(err)
        }
    }
}

/// `config interface <name> mtu <M>` / `config interface <name> status up|down`
async fn interface_action(args: &[&str]) -> Result<String> {
    match args {
        [name, "mtu", mtu] => {
            let mtu = parse_mtu(mtu)?;
            let mtu_s = mtu.to_string();
            run_checked(&["ip", "link", "set", "dev", name, "mtu", &mtu_s]).await?;
            Ok(format!("MTU for {name} set to {mtu}."))
        }
        [name, "status", status @ ("up" | "down")] => {
            run_checked(&["ip", "link", "set", "dev", name, status]).await?;
            Ok(format!("Status for {name} set to {status}."))
        }
        [_, "status", status] => Err(NodeError::Validation(format!(
            "Invalid status '{status}'. Choose from: up, down."
        ))),
        _ => Err(NodeError::Validation(
            "Usage: config interface <name> mtu <value> | status up|down".into(),
        )),
    }
}

/// Remove a sub-interface, unless an active forwarding rule still ingresses
/// on it.
async fn delete_interface(node: &Node, name: &str) -> Result<String> {
    let rules = node.engine.store().load()?;
    let in_use = rules.iter().any(|r| {
        r.active && base_name(&r.in_interface) == base_name(name)
    });
    if in_use {
        return Err(NodeError::Conflict(format!(
            "Interface '{name}' is the ingress of an active forwarding rule. Disable it first."
        )));
    }

    run_checked(&["ip", "link", "delete", base_name(name)]).await?;
    info!(interface = name, "sub-interface deleted");
    Ok(format!("Interface {name} deleted."))
}
