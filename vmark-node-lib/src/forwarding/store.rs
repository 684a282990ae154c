//! JSON-backed rule store.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::rule::Rule;
use crate::error::{NodeError, Result};
use crate::state::write_json_atomic;

/// The persistent set of forwarding rules, one JSON array on disk.
#[derive(Debug, Clone)]
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load all rules. A missing file is an empty store.
    pub fn load(&self) -> Result<Vec<Rule>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let rules: Vec<Rule> = serde_json::from_str(&raw)?;
        Ok(rules)
    }

    pub fn save(&self, rules: &[Rule]) -> Result<()> {
        write_json_atomic(&self.path, &rules)?;
        debug!(count = rules.len(), path = %self.path.display(), "rule store saved");
        Ok(())
    }

    /// Reject a candidate rule that duplicates an existing name or an
    /// existing `(in_interface, match_cvlan, match_svlan)` tuple.
    pub fn detect_conflict(rules: &[Rule], candidate: &Rule) -> Result<()> {
        for rule in rules {
            if rule.name == candidate.name {
                return Err(NodeError::Conflict(format!(
                    "Rule name '{}' already exists.",
                    candidate.name
                )));
            }
            if rule.match_tuple() == candidate.match_tuple() {
                let (iface, cvlan, svlan) = candidate.match_tuple();
                return Err(NodeError::Conflict(format!(
                    "Rule for in_interface={iface}, cvlan={}, svlan={} already exists.",
                    fmt_opt(cvlan),
                    fmt_opt(svlan)
                )));
            }
        }
        Ok(())
    }
}

fn fmt_opt(v: Option<u16>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "null".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, in_if: &str, cvlan: Option<u16>, svlan: Option<u16>) -> Rule {
        Rule {
            name: name.into(),
            in_interface: in_if.into(),
            match_svlan: svlan,
            match_cvlan: cvlan,
            out_interface: "eth1".into(),
            pop_tags: 0,
            push_svlan: None,
            push_cvlan: None,
            active: false,
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(dir.path().join("forwarding_table.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(dir.path().join("forwarding_table.json"));
        let rules = vec![rule("r1", "eth0", Some(100), None)];
        store.save(&rules).unwrap();
        assert_eq!(store.load().unwrap(), rules);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let rules = vec![rule("r1", "eth0", Some(100), None)];
        let dup = rule("r1", "eth2", Some(200), None);
        assert!(matches!(
            RuleStore::detect_conflict(&rules, &dup),
            Err(NodeError::Conflict(_))
        ));
    }

    #[test]
    fn test_duplicate_match_tuple_rejected() {
        let rules = vec![rule("r1", "eth0", Some(100), None)];
        let dup = rule("r2", "eth0", Some(100), None);
        assert!(matches!(
            RuleStore::detect_conflict(&rules, &dup),
            Err(NodeError::Conflict(_))
        ));
    }

    #[test]
    fn test_null_fields_compare_as_null() {
        let rules = vec![rule("r1", "eth0", None, None)];
        let dup = rule("r2", "eth0", None, None);
        assert!(RuleStore::detect_conflict(&rules, &dup).is_err());
        let ok = rule("r3", "eth0", Some(1), None);
        assert!(RuleStore::detect_conflict(&rules, &ok).is_ok());
    }
}
