use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

pub const VLAN_MIN: u16 = 1;
pub const VLAN_MAX: u16 = 4094;

/// A forwarding rule as stored in `forwarding_table.json`.
///
/// Rules are created inactive. Every ingress rule is paired with a derived
/// `egress-<name>` mirror that shares its `active` flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub in_interface: String,
    pub match_svlan: Option<u16>,
    pub match_cvlan: Option<u16>,
    pub out_interface: String,
    pub pop_tags: u8,
    pub push_svlan: Option<u16>,
    pub push_cvlan: Option<u16>,
    #[serde(default)]
    pub active: bool,
}

impl Rule {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(NodeError::Validation("rule name must not be empty".into()));
        }
        if self.in_interface.is_empty() || self.out_interface.is_empty() {
            return Err(NodeError::Validation(
                "in_interface and out_interface must not be empty".into(),
            ));
        }
        if self.pop_tags > 2 {
            return Err(NodeError::Validation(format!(
                "invalid pop_tags {}: must be 0, 1 or 2",
                self.pop_tags
            )));
        }
        for (label, vlan) in [
            ("svlan", self.match_svlan),
            ("cvlan", self.match_cvlan),
            ("push_svlan", self.push_svlan),
            ("push_cvlan", self.push_cvlan),
        ] {
            if let Some(v) = vlan {
                if !(VLAN_MIN..=VLAN_MAX).contains(&v) {
                    return Err(NodeError::Validation(format!(
                        "invalid {label} {v}: must be {VLAN_MIN}-{VLAN_MAX} or null"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Tuple that must be unique across the store.
    pub fn match_tuple(&self) -> (&str, Option<u16>, Option<u16>) {
        (self.in_interface.as_str(), self.match_cvlan, self.match_svlan)
    }
}

/// Name of the derived mirror rule for an ingress rule.
pub fn egress_name_for(name: &str) -> String {
    format!("egress-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> Rule {
        Rule {
            name: "r1".into(),
            in_interface: "eth0".into(),
            match_svlan: None,
            match_cvlan: Some(100),
            out_interface: "eth1".into(),
            pop_tags: 0,
            push_svlan: Some(10),
            push_cvlan: None,
            active: false,
        }
    }

    #[test]
    fn test_valid_rule() {
        assert!(rule().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_vlan() {
        let mut r = rule();
        r.match_cvlan = Some(4095);
        assert!(r.validate().is_err());
        r.match_cvlan = Some(0);
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_pop_tags() {
        let mut r = rule();
        r.pop_tags = 3;
        assert!(r.validate().is_err());
    }
}
