//! `twamp` verb family.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::json;

use super::validate::{
    parse_count, parse_dscp, parse_interval_ms, parse_ip, parse_padding, parse_port,
    parse_timer_secs, parse_tos, parse_ttl,
};
use super::Node;
use crate::error::{NodeError, Result};
use crate::twamp::{
    dscp, IpVersion, ReflectorConfig, SenderConfig, SenderStatus, SocketOptions,
};

const USAGE: &str = "Usage: twamp <ipv4|ipv6> <sender|responder|stop|status> ... | twamp dscptable";

pub async fn handle(node: &Node, args: &[&str]) -> Result<String> {
    match args.split_first() {
        None => Ok(USAGE.into()),
        Some((&"dscptable", _)) => Ok(dscp::render_table()),
        Some((&"ipv4", rest)) => handle_family(node, IpVersion::V4, rest).await,
        Some((&"ipv6", rest)) => handle_family(node, IpVersion::V6, rest).await,
        Some((other, _)) => Ok(format!("Unknown TWAMP command: {other}. {USAGE}")),
    }
}

async fn handle_family(node: &Node, version: IpVersion, args: &[&str]) -> Result<String> {
    match args.split_first() {
        None => Err(NodeError::Validation(format!(
            "Usage: twamp {version} <sender|responder|stop|status> ..."
        ))),
        Some((&"sender", rest)) => start_sender(node, version, rest),
        Some((&"responder", rest)) => start_responder(node, version, rest),
        Some((&"stop", rest)) => stop(node, version, rest).await,
        Some((&"status", rest)) => status(node, version, rest),
        Some((other, _)) => Ok(format!("Unknown TWAMP {version} command: {other}")),
    }
}

struct SenderArgs {
    dest_ip: Option<String>,
    port: Option<u16>,
    count: u32,
    interval: Duration,
    padding: usize,
    ttl: u32,
    tos: Option<u32>,
    dscp: Option<u32>,
    do_not_fragment: bool,
}

fn start_sender(node: &Node, version: IpVersion, args: &[&str]) -> Result<String> {
    let mut parsed = SenderArgs {
        dest_ip: None,
        port: None,
        count: 100,
        interval: Duration::from_millis(100),
        padding: 0,
        ttl: 64,
        tos: None,
        dscp: None,
        do_not_fragment: false,
    };

    let mut it = args.iter();
    while let Some(key) = it.next() {
        let mut value = |key: &str| -> Result<&str> {
            it.next()
                .copied()
                .ok_or_else(|| NodeError::Validation(format!("Missing value for parameter: {key}")))
        };
        match *key {
            "destination-ip" => parsed.dest_ip = Some(value("destination-ip")?.to_string()),
            "port" => parsed.port = Some(parse_port(value("port")?)?),
            "count" => parsed.count = parse_count(value("count")?)?,
            "interval" => parsed.interval = parse_interval_ms(value("interval")?)?,
            "padding" => parsed.padding = parse_padding(value("padding")?)?,
            "ttl" => parsed.ttl = parse_ttl(value("ttl")?)?,
            "tos" => parsed.tos = Some(parse_tos(value("tos")?)?),
            "dscp" => parsed.dscp = Some(parse_dscp(value("dscp")?)?),
            "do-not-fragment" => parsed.do_not_fragment = true,
            other => {
                return Err(NodeError::Validation(format!(
                    "Unknown sender parameter: {other}"
                )))
            }
        }
    }

    let dest_ip = parsed
        .dest_ip
        .ok_or_else(|| NodeError::Validation("Missing required parameter: destination-ip".into()))?;
    let port = parsed
        .port
        .ok_or_else(|| NodeError::Validation("Missing required parameter: port".into()))?;
    let ip = parse_ip(version, &dest_ip)?;

    let tos = match (parsed.tos, parsed.dscp) {
        (Some(_), Some(_)) => {
            return Err(NodeError::Validation(
                "tos and dscp are mutually exclusive".into(),
            ))
        }
        (Some(tos), None) => tos,
        (None, Some(dscp_tos)) => dscp_tos,
        (None, None) => 0,
    };

    let cfg = SenderConfig {
        ip_version: version,
        destination: SocketAddr::new(ip, port),
        count: parsed.count,
        interval: parsed.interval,
        padding: parsed.padding,
        options: SocketOptions {
            ttl: parsed.ttl,
            tos,
            do_not_fragment: parsed.do_not_fragment,
        },
    };
    node.registry.start_sender(cfg)
}

fn start_responder(node: &Node, version: IpVersion, args: &[&str]) -> Result<String> {
    let mut port = None;
    let mut ttl = 64;
    let mut tos = 0;
    let mut timer = 0;

    let mut it = args.iter();
    while let Some(key) = it.next() {
        let mut value = |key: &str| -> Result<&str> {
            it.next()
                .copied()
                .ok_or_else(|| NodeError::Validation(format!("Missing value for parameter: {key}")))
        };
        match *key {
            "port" => port = Some(parse_port(value("port")?)?),
            // accepted for command compatibility; replies carry no padding
            "padding" => {
                parse_padding(value("padding")?)?;
            }
            "ttl" => ttl = parse_ttl(value("ttl")?)?,
            "tos" => tos = parse_tos(value("tos")?)?,
            "timer" => timer = parse_timer_secs(value("timer")?)?,
            other => {
                return Err(NodeError::Validation(format!(
                    "Unknown responder parameter: {other}"
                )))
            }
        }
    }

    let port = port.ok_or_else(|| NodeError::Validation("Missing required parameter: port".into()))?;
    let cfg = ReflectorConfig {
        ip_version: version,
        bind_addr: None,
        port,
        reset_timer_secs: timer,
        options: SocketOptions { ttl, tos, do_not_fragment: false },
    };
    node.registry.start_responder(cfg)
}

async fn stop(node: &Node, version: IpVersion, args: &[&str]) -> Result<String> {
    match args.split_first() {
        Some((&"responder", ["port", port])) => {
            let port = parse_port(port)?;
            node.registry.stop_responder((version, port)).await
        }
        Some((&"sender", ["destination-ip", ip, "port", port])) => {
            let ip = parse_ip(version, ip)?;
            let port = parse_port(port)?;
            node.registry.stop_sender((version, ip, port)).await
        }
        _ => Err(NodeError::Validation(format!(
            "Usage: twamp {version} stop responder port <p> | stop sender destination-ip <ip> port <p>"
        ))),
    }
}

fn status(node: &Node, version: IpVersion, args: &[&str]) -> Result<String> {
    match args.split_first() {
        Some((&"sender", ["destination-ip", ip, "port", port])) => {
            let ip = parse_ip(version, ip)?;
            let port = parse_port(port)?;
            let payload = match node.registry.sender_status((version, ip, port)) {
                SenderStatus::Running => json!({"status": "running"}),
                SenderStatus::Completed(completed) => json!({
                    "status": "completed",
                    "timestamp": completed.finished_at,
                    "result": completed.result,
                    // one-way loss cannot be measured without synchronized clocks
                    "outbound_loss": "N/A",
                    "inbound_loss": "N/A",
                }),
                SenderStatus::Unknown => json!({"status": "unknown"}),
            };
            Ok(serde_json::to_string_pretty(&payload)?)
        }
        _ => Err(NodeError::Validation(format!(
            "Usage: twamp {version} status sender destination-ip <ip> port <p>"
        ))),
    }
}
