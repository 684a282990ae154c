//! Egress-pair derivation.
//!
//! For an ingress rule, the mirror rule must match the frame as it looks
//! *after* the ingress pop/push sequence, undo the pushes, and restore
//! whatever tags the ingress rule consumed. A single outer tag is always
//! treated as a C-VLAN (MEF single-tagged service), so an S-VLAN-only match
//! is normalized to a C-VLAN-only match before anything else.

use super::rule::{egress_name_for, Rule};

/// Build the `egress-<name>` mirror for an ingress rule, with
/// `in_interface`/`out_interface` swapped and the same `active` flag.
pub fn derive_egress(rule: &Rule) -> Rule {
    // Normalization: a lone S-VLAN match is really a single outer tag.
    let (match_svlan, match_cvlan) = match (rule.match_svlan, rule.match_cvlan) {
        (Some(s), None) => (None, Some(s)),
        other => other,
    };
    let pop = rule.pop_tags;
    let push_s = rule.push_svlan;
    let push_c = rule.push_cvlan;

    // Tag stack after the ingress pop.
    let (s_after_pop, c_after_pop) = match pop {
        0 => (match_svlan, match_cvlan),
        1 if match_svlan.is_some() => (None, match_cvlan),
        1 => (None, None),
        _ => (None, None),
    };

    // Tag stack after the ingress push. This is what egress must match.
    let (egress_match_s, egress_match_c) = if let Some(ps) = push_s {
        let c = match push_c {
            Some(pc) => Some(pc),
            None if pop == 0 => match_cvlan,
            None if pop == 1 && match_svlan.is_some() => match_svlan,
            None => None,
        };
        (Some(ps), c)
    } else if let Some(pc) = push_c {
        if match_svlan.is_some() {
            // Pushing a C-tag on top of a double-tagged match: the pushed tag
            // becomes the new outer tag.
            (Some(pc), match_svlan)
        } else {
            (None, Some(pc))
        }
    } else {
        (s_after_pop, c_after_pop)
    };

    // Egress pops exactly what ingress pushed.
    let egress_pop = push_s.iter().count() as u8 + push_c.iter().count() as u8;

    // Stack remaining once the egress pop has run.
    let (s_remaining, c_remaining) = match egress_pop {
        0 => (egress_match_s, egress_match_c),
        1 => match (egress_match_s, egress_match_c) {
            (Some(_), Some(c)) => (None, Some(c)),
            _ => (None, None),
        },
        _ => (None, None),
    };

    // Egress pushes only the tags the ingress rule consumed and the egress
    // pop did not already leave in place.
    let egress_push_s = if match_svlan != s_remaining { match_svlan } else { None };
    let egress_push_c = if match_cvlan != c_remaining { match_cvlan } else { None };

    // Same single-outer-tag normalization on the derived match.
    let (egress_match_s, egress_match_c) = match (egress_match_s, egress_match_c) {
        (Some(s), None) => (None, Some(s)),
        other => other,
    };

    Rule {
        name: egress_name_for(&rule.name),
        in_interface: rule.out_interface.clone(),
        out_interface: rule.in_interface.clone(),
        match_svlan: egress_match_s,
        match_cvlan: egress_match_c,
        pop_tags: egress_pop,
        push_svlan: egress_push_s,
        push_cvlan: egress_push_c,
        active: rule.active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingress(
        match_svlan: Option<u16>,
        match_cvlan: Option<u16>,
        pop_tags: u8,
        push_svlan: Option<u16>,
        push_cvlan: Option<u16>,
    ) -> Rule {
        Rule {
            name: "r1".into(),
            in_interface: "if-a".into(),
            match_svlan,
            match_cvlan,
            out_interface: "if-b".into(),
            pop_tags,
            push_svlan,
            push_cvlan,
            active: false,
        }
    }

    /// Apply a rule's pop/push sequence to a tag stack `(svlan, cvlan)`.
    fn apply(rule: &Rule, stack: (Option<u16>, Option<u16>)) -> (Option<u16>, Option<u16>) {
        let (mut s, mut c) = stack;
        for _ in 0..rule.pop_tags {
            if s.is_some() {
                s = None;
            } else {
                c = None;
            }
        }
        if let Some(ps) = rule.push_svlan {
            if c.is_none() {
                // pushing an outer tag over a single tag keeps it single-level
                c = s;
            }
            s = Some(ps);
        }
        if let Some(pc) = rule.push_cvlan {
            if s.is_none() && c.is_some() {
                s = Some(pc);
            } else {
                c = Some(pc);
            }
        }
        normalize(s, c)
    }

    fn normalize(s: Option<u16>, c: Option<u16>) -> (Option<u16>, Option<u16>) {
        match (s, c) {
            (Some(v), None) => (None, Some(v)),
            other => other,
        }
    }

    #[test]
    fn test_swaps_interfaces_and_name() {
        let egress = derive_egress(&ingress(None, Some(100), 0, Some(10), None));
        assert_eq!(egress.name, "egress-r1");
        assert_eq!(egress.in_interface, "if-b");
        assert_eq!(egress.out_interface, "if-a");
    }

    #[test]
    fn test_single_tag_push_svlan() {
        // match C-VLAN 100, push S-VLAN 10: the egress side sees (10, 100),
        // pops the pushed tag, and the original C-tag is already in place.
        let egress = derive_egress(&ingress(None, Some(100), 0, Some(10), None));
        assert_eq!(egress.match_svlan, Some(10));
        assert_eq!(egress.match_cvlan, Some(100));
        assert_eq!(egress.pop_tags, 1);
        assert_eq!(egress.push_svlan, None);
        assert_eq!(egress.push_cvlan, None);
    }

    #[test]
    fn test_pop_one_cvlan_only_no_push() {
        // The ingress strips the only tag; egress matches untagged frames and
        // restores the C-tag.
        let egress = derive_egress(&ingress(None, Some(100), 1, None, None));
        assert_eq!(egress.match_svlan, None);
        assert_eq!(egress.match_cvlan, None);
        assert_eq!(egress.pop_tags, 0);
        assert_eq!(egress.push_svlan, None);
        assert_eq!(egress.push_cvlan, Some(100));
    }

    #[test]
    fn test_qinq_full_rewrite() {
        let egress = derive_egress(&ingress(Some(10), Some(100), 2, Some(20), Some(200)));
        assert_eq!(egress.match_svlan, Some(20));
        assert_eq!(egress.match_cvlan, Some(200));
        assert_eq!(egress.pop_tags, 2);
        assert_eq!(egress.push_svlan, Some(10));
        assert_eq!(egress.push_cvlan, Some(100));
    }

    #[test]
    fn test_svlan_only_match_normalized() {
        // S-VLAN-only matches are treated as a single outer C-tag.
        let egress = derive_egress(&ingress(Some(30), None, 0, None, None));
        assert_eq!(egress.match_svlan, None);
        assert_eq!(egress.match_cvlan, Some(30));
        assert_eq!(egress.pop_tags, 0);
        assert_eq!(egress.push_svlan, None);
        assert_eq!(egress.push_cvlan, None);
    }

    #[test]
    fn test_egress_pop_count_equals_ingress_push_count() {
        let cases = [
            ingress(None, Some(100), 0, Some(10), None),
            ingress(None, Some(100), 1, Some(10), Some(20)),
            ingress(Some(10), Some(100), 2, None, None),
            ingress(None, None, 0, None, Some(5)),
        ];
        for rule in &cases {
            let pushes =
                rule.push_svlan.iter().count() as u8 + rule.push_cvlan.iter().count() as u8;
            assert_eq!(derive_egress(rule).pop_tags, pushes, "case {rule:?}");
        }
    }

    #[test]
    fn test_ingress_then_egress_restores_original_stack() {
        let cases = [
            ingress(None, Some(100), 0, Some(10), None),
            ingress(None, Some(100), 1, None, None),
            ingress(Some(10), Some(100), 2, Some(20), Some(200)),
            ingress(Some(10), Some(100), 0, None, None),
            ingress(None, Some(100), 1, Some(50), None),
            ingress(Some(30), None, 1, None, None),
        ];
        for rule in &cases {
            let original = normalize(rule.match_svlan, rule.match_cvlan);
            let egress = derive_egress(rule);
            let mid = apply(rule, original);
            assert_eq!(
                mid,
                normalize(egress.match_svlan, egress.match_cvlan),
                "egress match must equal the post-ingress stack for {rule:?}"
            );
            let restored = apply(&egress, mid);
            assert_eq!(restored, original, "round trip failed for {rule:?}");
        }
    }

    #[test]
    fn test_active_flag_tracks_ingress() {
        let mut rule = ingress(None, Some(100), 0, None, None);
        rule.active = true;
        assert!(derive_egress(&rule).active);
    }
}
