//! `xdp-switch` verb family.

use super::validate::{parse_pop_tags, parse_vlan_or_null};
use super::Node;
use crate::error::{NodeError, Result};
use crate::forwarding::Rule;

const USAGE: &str =
    "Usage: xdp-switch create-rule|delete-rule|enable-rule|disable-rule|show-forwarding [...]";

const CREATE_RULE_PARAMS: &[&str] = &[
    "name",
    "in_interface",
    "svlan",
    "cvlan",
    "out_interface",
    "pop_tags",
    "push_svlan",
    "push_cvlan",
];

pub async fn handle(node: &Node, args: &[&str]) -> Result<String> {
    match args.split_first() {
        None => Ok(USAGE.into()),
        Some((&"create-rule", rest)) => create_rule(node, rest).await,
        Some((&"delete-rule", [name])) => node.engine.delete_rule(name).await,
        Some((&"delete-rule", _)) => {
            Err(NodeError::Validation("Usage: xdp-switch delete-rule <name>".into()))
        }
        Some((&"enable-rule", [name])) => node.engine.enable_rule(name).await,
        Some((&"enable-rule", _)) => {
            Err(NodeError::Validation("Usage: xdp-switch enable-rule <name>".into()))
        }
        Some((&"disable-rule", [name])) => node.engine.disable_rule(name).await,
        Some((&"disable-rule", _)) => {
            Err(NodeError::Validation("Usage: xdp-switch disable-rule <name>".into()))
        }
        Some((&"show-forwarding", [])) => node.engine.show_forwarding(None),
        Some((&"show-forwarding", [arg])) => node.engine.show_forwarding(Some(*arg)),
        Some((&"show-forwarding", _)) => Err(NodeError::Validation(
            "Usage: xdp-switch show-forwarding [name|json]".into(),
        )),
        Some((cmd, _)) => Ok(format!(
            "Unknown xdp-switch command: {cmd}. Supported: create-rule, delete-rule, \
             enable-rule, disable-rule, show-forwarding."
        )),
    }
}

/// `create-rule name <n> in_interface <if> svlan <v|null> cvlan <v|null>
/// out_interface <if> pop_tags <0|1|2> push_svlan <v|null> push_cvlan <v|null>`
///
/// Parameters may appear in any order; all are required, with `null` as the
/// explicit absent marker.
async fn create_rule(node: &Node, args: &[&str]) -> Result<String> {
    let mut params: Vec<(&str, &str)> = Vec::new();
    let mut it = args.iter();
    while let Some(&key) = it.next() {
        if !CREATE_RULE_PARAMS.contains(&key) {
            return Err(NodeError::Validation(format!(
                "Unknown parameter for create-rule: {key}"
            )));
        }
        let value = it.next().copied().ok_or_else(|| {
            NodeError::Validation(format!("Missing value for parameter: {key}"))
        })?;
        params.push((key, value));
    }

    let get = |name: &str| params.iter().find(|(k, _)| *k == name).map(|(_, v)| *v);
    let missing: Vec<&str> = CREATE_RULE_PARAMS
        .iter()
        .filter(|p| get(p).is_none())
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(NodeError::Validation(format!(
            "Missing parameters for create-rule: {}",
            missing.join(", ")
        )));
    }

    let rule = Rule {
        name: get("name").unwrap_or_default().to_string(),
        in_interface: get("in_interface").unwrap_or_default().to_string(),
        match_svlan: parse_vlan_or_null("svlan", get("svlan").unwrap_or_default())?,
        match_cvlan: parse_vlan_or_null("cvlan", get("cvlan").unwrap_or_default())?,
        out_interface: get("out_interface").unwrap_or_default().to_string(),
        pop_tags: parse_pop_tags(get("pop_tags").unwrap_or_default())?,
        push_svlan: parse_vlan_or_null("push_svlan", get("push_svlan").unwrap_or_default())?,
        push_cvlan: parse_vlan_or_null("push_cvlan", get("push_cvlan").unwrap_or_default())?,
        active: false,
    };
    node.engine.create_rule(rule).await
}
