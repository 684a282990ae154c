//! Forwarding engine: rule lifecycle and kernel map programming.
//!
//! The store is authoritative for intent, the kernel map for reality. Every
//! verb saves the store first and then drives the datapath, so a failed
//! bpftool invocation leaves a consistent store and a subsequent call
//! converges.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{info, warn};

use vmark_node_datapath::codec::{pack_value, ActionStep, FwKey, TagKind, KEY_LEN};
use vmark_node_datapath::{iface, loader, maps, InterfaceRef};

use super::egress::derive_egress;
use super::rule::{egress_name_for, Rule};
use super::store::RuleStore;
use crate::error::{NodeError, Result};
use crate::state::StatePaths;

pub struct ForwardingEngine {
    store: RuleStore,
    xdp_object: PathBuf,
    /// Store mutations and map rebuilds run one at a time; concurrent API
    /// workers must not interleave load/save cycles or bpftool map writes.
    ops: tokio::sync::Mutex<()>,
}

impl ForwardingEngine {
    pub fn new(paths: &StatePaths, xdp_object: PathBuf) -> Self {
        Self {
            store: RuleStore::new(paths.forwarding_table_file()),
            xdp_object,
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// Create a rule and its derived egress pair, both inactive. The kernel
    /// map is untouched.
    pub async fn create_rule(&self, rule: Rule) -> Result<String> {
        let _ops = self.ops.lock().await;
        rule.validate()?;
        let mut rules = self.store.load()?;
        RuleStore::detect_conflict(&rules, &rule)?;

        let egress = derive_egress(&rule);
        rules.push(rule.clone());
        if !rules.iter().any(|r| r.name == egress.name) {
            RuleStore::detect_conflict(&rules, &egress)?;
            rules.push(egress.clone());
        }
        self.store.save(&rules)?;
        info!(rule = %rule.name, egress = %egress.name, "forwarding rule created");
        Ok(format!(
            "Rule '{}' and its egress pair '{}' created (inactive).",
            rule.name, egress.name
        ))
    }

    /// Delete a rule and its egress pair. Active rules must be disabled
    /// first. Parents that still carry a pinned map are rebuilt from the
    /// remaining active rules.
    pub async fn delete_rule(&self, name: &str) -> Result<String> {
        let _ops = self.ops.lock().await;
        let egress_name = egress_name_for(name);
        let mut rules = self.store.load()?;

        let rule = rules
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("Rule '{name}' not found.")))?;
        if rule.active {
            return Err(NodeError::Conflict(format!(
                "Rule '{name}' is active. Disable it before deletion."
            )));
        }
        let egress = rules.iter().find(|r| r.name == egress_name).cloned();

        rules.retain(|r| r.name != name && r.name != egress_name);
        self.store.save(&rules)?;

        let mut messages = Vec::new();
        let mut ifaces: Vec<&str> = vec![rule.in_interface.as_str()];
        if let Some(e) = &egress {
            if e.in_interface != rule.in_interface {
                ifaces.push(e.in_interface.as_str());
            }
        }
        for name in ifaces {
            let parent = iface::parent_name(name).await?;
            if maps::pinned_map(&parent).await?.is_some() {
                match self.rebuild_map(&parent, &rules).await {
                    Ok(()) => messages.push(format!("BPF map rebuilt for {name}.")),
                    Err(err) => messages.push(format!("Error rebuilding BPF map for {name}: {err}")),
                }
            }
        }

        info!(rule = name, "forwarding rule deleted");
        let mut out = format!("Rule '{name}' and its egress pair '{egress_name}' deleted.");
        for m in messages {
            out.push(' ');
            out.push_str(&m);
        }
        Ok(out)
    }

    /// Mark a rule and its egress pair active, attach the XDP program to each
    /// affected parent if needed, and rebuild the maps.
    pub async fn enable_rule(&self, name: &str) -> Result<String> {
        let _ops = self.ops.lock().await;
        let mut rules = self.store.load()?;
        if !rules.iter().any(|r| r.name == name) {
            return Err(NodeError::NotFound(format!("Rule '{name}' not found.")));
        }
        let egress_name = egress_name_for(name);
        for r in rules.iter_mut() {
            if r.name == name || r.name == egress_name {
                r.active = true;
            }
        }
        self.store.save(&rules)?;

        let affected: Vec<Rule> = rules
            .iter()
            .filter(|r| r.name == name || r.name == egress_name)
            .cloned()
            .collect();
        let mut rebuilt = HashSet::new();
        for rule in &affected {
            let parent = iface::parent_name(&rule.in_interface).await?;
            if !rebuilt.insert(parent.clone()) {
                continue;
            }
            loader::ensure_attached(&parent, &self.xdp_object).await?;
            self.rebuild_map(&parent, &rules).await?;
        }

        info!(rule = name, "forwarding rule enabled");
        Ok(format!(
            "Rule '{name}' and its egress pair enabled and BPF maps rebuilt."
        ))
    }

    /// Mark a rule and its egress pair inactive and rebuild the affected
    /// maps. A parent left without active rules is fully detached and
    /// promiscuous mode is dropped from ingress interfaces no active rule
    /// uses anymore.
    pub async fn disable_rule(&self, name: &str) -> Result<String> {
        let _ops = self.ops.lock().await;
        let mut rules = self.store.load()?;
        if !rules.iter().any(|r| r.name == name) {
            return Err(NodeError::NotFound(format!("Rule '{name}' not found.")));
        }
        let egress_name = egress_name_for(name);
        let mut disabled = Vec::new();
        for r in rules.iter_mut() {
            if r.name == name || r.name == egress_name {
                r.active = false;
                disabled.push(r.clone());
            }
        }
        self.store.save(&rules)?;

        let active_parents = active_parent_set(&rules).await?;
        let active_ifaces: HashSet<&str> = rules
            .iter()
            .filter(|r| r.active)
            .map(|r| iface::base_name(&r.in_interface))
            .collect();

        let mut handled = HashSet::new();
        for rule in &disabled {
            let parent = iface::parent_name(&rule.in_interface).await?;
            if handled.insert(parent.clone()) {
                if maps::pinned_map(&parent).await?.is_some() {
                    self.rebuild_map(&parent, &rules).await?;
                }
                if !active_parents.contains(&parent) {
                    loader::detach_force(&parent).await?;
                }
            }
            let base = iface::base_name(&rule.in_interface);
            if !active_ifaces.contains(base) {
                maps::set_promisc(base, false).await;
            }
        }

        info!(rule = name, "forwarding rule disabled");
        Ok(format!(
            "Rule '{name}' and its egress pair disabled and BPF maps rebuilt."
        ))
    }

    /// Render the store: full table, one rule's table row, or raw JSON.
    pub fn show_forwarding(&self, arg: Option<&str>) -> Result<String> {
        let rules = self.store.load()?;
        match arg {
            Some("json") => Ok(serde_json::to_string_pretty(&rules)?),
            Some(name) => {
                let selected: Vec<&Rule> = rules.iter().filter(|r| r.name == name).collect();
                if selected.is_empty() {
                    Ok(render_table(&[], Some(name)))
                } else {
                    Ok(render_table(&selected, None))
                }
            }
            None => {
                let all: Vec<&Rule> = rules.iter().collect();
                Ok(render_table(&all, None))
            }
        }
    }

    /// Clear the parent's pinned map and repopulate it from every active rule
    /// whose ingress parent matches. Promiscuous mode is raised on each
    /// active ingress interface as its rule is programmed.
    pub async fn rebuild_map(&self, parent: &str, rules: &[Rule]) -> Result<()> {
        let pin = loader::map_pin_path(parent);
        maps::clear(&pin).await?;

        let mut applied = 0usize;
        for rule in rules.iter().filter(|r| r.active) {
            let ingress = InterfaceRef::resolve(&rule.in_interface).await?;
            if ingress.parent != parent {
                continue;
            }
            let key = FwKey::new(ingress.index, rule.match_cvlan, rule.match_svlan);
            let actions = rule_actions(rule).await?;
            let value = pack_value(&actions)?;
            maps::set_promisc(&ingress.name, true).await;
            maps::update_entry(&pin, &key.pack(), &value).await?;
            applied += 1;
        }
        info!(parent, rules = applied, "forwarding map rebuilt");
        Ok(())
    }

    /// Startup reconciliation: confirm every active rule's key is actually in
    /// the kernel map. A parent with no program gets one re-attach attempt
    /// followed by a rebuild; anything else that cannot be confirmed is
    /// downgraded to inactive. The store is downgraded to match the kernel,
    /// never the reverse.
    pub async fn reconcile(&self) -> Result<String> {
        let _ops = self.ops.lock().await;
        let mut rules = self.store.load()?;
        let mut parents: HashMap<String, ParentState> = HashMap::new();
        let mut downgraded: Vec<String> = Vec::new();
        let mut rebuild: HashSet<String> = HashSet::new();

        for i in 0..rules.len() {
            if !rules[i].active {
                continue;
            }
            let rule = rules[i].clone();

            // One resolution per rule covers both the pin path (parent) and
            // the map key (base interface index).
            let ingress = match InterfaceRef::resolve(&rule.in_interface).await {
                Ok(i) => i,
                Err(err) => {
                    warn!(rule = %rule.name, %err, "cannot resolve ingress interface, deactivating");
                    deactivate_pair(&mut rules, &rule.name, &mut downgraded);
                    continue;
                }
            };
            let parent = ingress.parent.clone();

            if !parents.contains_key(&parent) {
                let state = self.probe_parent(&parent).await?;
                if matches!(state, ParentState::FreshlyAttached) {
                    rebuild.insert(parent.clone());
                }
                parents.insert(parent.clone(), state);
            }

            match parents.get(&parent) {
                Some(ParentState::FreshlyAttached) => {
                    // map was just created empty; the rebuild below restores it
                }
                Some(ParentState::Attached(keys)) => {
                    let key = FwKey::new(ingress.index, rule.match_cvlan, rule.match_svlan);
                    if !keys.contains(&key.pack()) {
                        warn!(rule = %rule.name, parent, "active rule missing from kernel map, deactivating");
                        deactivate_pair(&mut rules, &rule.name, &mut downgraded);
                        rebuild.insert(parent.clone());
                    }
                }
                Some(ParentState::Unavailable) | None => {
                    warn!(rule = %rule.name, parent, "datapath unavailable for parent, deactivating");
                    deactivate_pair(&mut rules, &rule.name, &mut downgraded);
                }
            }
        }

        if !downgraded.is_empty() {
            self.store.save(&rules)?;
        }
        for parent in &rebuild {
            if maps::pinned_map(parent).await?.is_some() {
                self.rebuild_map(parent, &rules).await?;
            }
        }

        let msg = if downgraded.is_empty() {
            "Reconciliation complete: store and kernel state agree.".to_string()
        } else {
            downgraded.sort();
            downgraded.dedup();
            format!(
                "Reconciliation deactivated rules absent from the datapath: {}.",
                downgraded.join(", ")
            )
        };
        info!("{msg}");
        Ok(msg)
    }

    async fn probe_parent(&self, parent: &str) -> Result<ParentState> {
        if loader::is_attached(parent).await? {
            match maps::pinned_map(parent).await? {
                Some(pin) => {
                    let keys = maps::dump_keys(&pin).await.unwrap_or_default();
                    Ok(ParentState::Attached(keys))
                }
                None => Ok(ParentState::Unavailable),
            }
        } else {
            match loader::attach(parent, &self.xdp_object).await {
                Ok(()) => Ok(ParentState::FreshlyAttached),
                Err(err) => {
                    warn!(parent, %err, "re-attach during reconciliation failed");
                    Ok(ParentState::Unavailable)
                }
            }
        }
    }
}

enum ParentState {
    Attached(HashSet<[u8; KEY_LEN]>),
    FreshlyAttached,
    Unavailable,
}

/// Set a rule and its pair inactive, recording both names.
fn deactivate_pair(rules: &mut [Rule], name: &str, downgraded: &mut Vec<String>) {
    let pair = match name.strip_prefix("egress-") {
        Some(base) => base.to_string(),
        None => egress_name_for(name),
    };
    for r in rules.iter_mut() {
        if (r.name == name || r.name == pair) && r.active {
            r.active = false;
            downgraded.push(r.name.clone());
        }
    }
}

async fn active_parent_set(rules: &[Rule]) -> Result<HashSet<String>> {
    let mut parents = HashSet::new();
    for rule in rules.iter().filter(|r| r.active) {
        parents.insert(iface::parent_name(&rule.in_interface).await?);
    }
    Ok(parents)
}

/// Translate a rule into its action program: pops first (outermost tag
/// first), then pushes, then the forward step.
async fn rule_actions(rule: &Rule) -> Result<Vec<ActionStep>> {
    let mut actions = Vec::new();
    match rule.pop_tags {
        2 => {
            actions.push(ActionStep::pop(TagKind::Svlan));
            actions.push(ActionStep::pop(TagKind::Cvlan));
        }
        1 => actions.push(ActionStep::pop(TagKind::Cvlan)),
        _ => {}
    }
    if let Some(svlan) = rule.push_svlan {
        actions.push(ActionStep::push(TagKind::Svlan, svlan));
    }
    if let Some(cvlan) = rule.push_cvlan {
        actions.push(ActionStep::push(TagKind::Cvlan, cvlan));
    }
    let target = iface::ifindex(&rule.out_interface).await?;
    actions.push(ActionStep::forward(target));
    Ok(actions)
}

fn render_table(rules: &[&Rule], missing: Option<&str>) -> String {
    let header = concat!(
        "+----------+--------------+----------+----------+--------------+----------+------------+------------+--------+\n",
        "|   name   | in_interface | svlan    | cvlan    | out_interface| pop_tags | push_svlan | push_cvlan | active |\n",
        "+----------+--------------+----------+----------+--------------+----------+------------+------------+--------+"
    );
    let footer = format!("+{}+", "-".repeat(108));

    if rules.is_empty() {
        let note = match missing {
            Some(name) => format!("Rule '{name}' not found"),
            None => "no rules configured".to_string(),
        };
        return format!("{header}\n| {:<106} |\n{footer}", format!("({note})"));
    }

    let mut lines = vec![header.to_string()];
    for rule in rules {
        lines.push(format!(
            "| {:<8} | {:<12} | {:<8} | {:<8} | {:<12} | {:<8} | {:<10} | {:<10} | {:<6} |",
            truncate(&rule.name, 8),
            truncate(&rule.in_interface, 12),
            fmt_vlan(rule.match_svlan),
            fmt_vlan(rule.match_cvlan),
            truncate(&rule.out_interface, 12),
            rule.pop_tags,
            fmt_vlan(rule.push_svlan),
            fmt_vlan(rule.push_cvlan),
            if rule.active { "yes" } else { "no" },
        ));
    }
    lines.push(footer);
    lines.join("\n")
}

fn fmt_vlan(v: Option<u16>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "null".into())
}

fn truncate(s: &str, max: usize) -> &str {
    s.get(..max).unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StatePaths;

    fn engine(dir: &std::path::Path) -> ForwardingEngine {
        let paths = StatePaths::at(dir.to_path_buf()).unwrap();
        ForwardingEngine::new(&paths, PathBuf::from("/nonexistent/xdp_forwarding.o"))
    }

    fn new_rule(name: &str, cvlan: u16) -> Rule {
        Rule {
            name: name.into(),
            in_interface: "if-a".into(),
            match_svlan: None,
            match_cvlan: Some(cvlan),
            out_interface: "if-b".into(),
            pop_tags: 0,
            push_svlan: Some(10),
            push_cvlan: None,
            active: false,
        }
    }

    #[tokio::test]
    async fn test_create_rule_appends_egress_pair() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create_rule(new_rule("r1", 100)).await.unwrap();

        let rules = eng.store().load().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "r1");
        assert_eq!(rules[1].name, "egress-r1");
        assert!(!rules[0].active && !rules[1].active);
        assert_eq!(rules[1].in_interface, "if-b");
    }

    #[tokio::test]
    async fn test_create_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create_rule(new_rule("r1", 100)).await.unwrap();
        let err = eng.create_rule(new_rule("r1", 200)).await.unwrap_err();
        assert!(matches!(err, NodeError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_duplicate_match_tuple_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create_rule(new_rule("r1", 100)).await.unwrap();
        let err = eng.create_rule(new_rule("r2", 100)).await.unwrap_err();
        assert!(matches!(err, NodeError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_rule() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let err = eng.delete_rule("nope").await.unwrap_err();
        assert!(matches!(err, NodeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_active_rule_refused() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create_rule(new_rule("r1", 100)).await.unwrap();
        let mut rules = eng.store().load().unwrap();
        for r in rules.iter_mut() {
            r.active = true;
        }
        eng.store().save(&rules).unwrap();

        let err = eng.delete_rule("r1").await.unwrap_err();
        assert!(matches!(err, NodeError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_show_forwarding_json_matches_store() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create_rule(new_rule("r1", 100)).await.unwrap();

        let json = eng.show_forwarding(Some("json")).unwrap();
        let shown: Vec<Rule> = serde_json::from_str(&json).unwrap();
        assert_eq!(shown, eng.store().load().unwrap());
    }

    #[tokio::test]
    async fn test_show_forwarding_unknown_rule() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let out = eng.show_forwarding(Some("ghost")).unwrap();
        assert!(out.contains("Rule 'ghost' not found"));
    }

    #[tokio::test]
    async fn test_rule_actions_translation() {
        // No kernel access here: only the pure translation ordering can be
        // checked, using a rule whose interfaces do not resolve.
        let rule = Rule {
            pop_tags: 2,
            push_svlan: Some(20),
            push_cvlan: Some(200),
            ..new_rule("r1", 100)
        };
        // out_interface does not exist, so translation fails at the forward
        // step; everything before it is deterministic.
        assert!(rule_actions(&rule).await.is_err());
    }
}
