//! DMRGateway-style rewrite rules applied to DMRD frames per master connection

use serde::Deserialize;

use crate::dmrd::DmrdPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleResult {
    Matched,
    Unmatched,
}

/// A single rewrite rule. Rules are loaded from configuration, held
/// read-only for the lifetime of the bridge and evaluated in list order.
///
/// Slots are numbered 1 and 2 at this surface; the frame itself encodes
/// TS1 as `slot = false`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Rule {
    /// Remap a block of talkgroups, optionally moving slot
    #[serde(rename = "TGRewrite")]
    TgRewrite {
        from_slot: u8,
        from_tg: u32,
        to_slot: u8,
        to_tg: u32,
        range: u32,
    },
    /// Remap a block of private-call destinations
    #[serde(rename = "PCRewrite")]
    PcRewrite {
        from_slot: u8,
        from_id: u32,
        to_slot: u8,
        to_id: u32,
        range: u32,
    },
    /// Turn a group call into a private call to a reflector-style ID
    #[serde(rename = "TypeRewrite")]
    TypeRewrite {
        from_slot: u8,
        from_tg: u32,
        to_slot: u8,
        to_id: u32,
        range: u32,
    },
    /// Remap the source ID, leaving the call type alone
    #[serde(rename = "SrcRewrite")]
    SrcRewrite {
        from_slot: u8,
        from_id: u32,
        to_slot: u8,
        to_id: u32,
        range: u32,
    },
    /// Accept every group call on the given slot unchanged
    #[serde(rename = "PassAllTG")]
    PassAllTg { slot: u8 },
    /// Accept every private call on the given slot unchanged
    #[serde(rename = "PassAllPC")]
    PassAllPc { slot: u8 },
}

fn packet_slot(pkt: &DmrdPacket) -> u8 {
    if pkt.slot { 2 } else { 1 }
}

fn set_packet_slot(pkt: &mut DmrdPacket, slot: u8) {
    pkt.slot = slot == 2;
}

impl Rule {
    /// Evaluate this rule against `pkt`, mutating it in place on a match.
    pub fn process(&self, pkt: &mut DmrdPacket) -> RuleResult {
        match *self {
            Rule::TgRewrite { from_slot, from_tg, to_slot, to_tg, range } => {
                if !pkt.group_call
                    || packet_slot(pkt) != from_slot
                    || !(from_tg..from_tg + range).contains(&pkt.dst)
                {
                    return RuleResult::Unmatched;
                }
                pkt.dst = pkt.dst + to_tg - from_tg;
                set_packet_slot(pkt, to_slot);
                RuleResult::Matched
            }
            Rule::PcRewrite { from_slot, from_id, to_slot, to_id, range } => {
                if pkt.group_call
                    || packet_slot(pkt) != from_slot
                    || !(from_id..from_id + range).contains(&pkt.dst)
                {
                    return RuleResult::Unmatched;
                }
                pkt.dst = pkt.dst + to_id - from_id;
                set_packet_slot(pkt, to_slot);
                RuleResult::Matched
            }
            Rule::TypeRewrite { from_slot, from_tg, to_slot, to_id, range } => {
                if !pkt.group_call
                    || packet_slot(pkt) != from_slot
                    || !(from_tg..from_tg + range).contains(&pkt.dst)
                {
                    return RuleResult::Unmatched;
                }
                pkt.dst = pkt.dst + to_id - from_tg;
                pkt.group_call = false;
                set_packet_slot(pkt, to_slot);
                RuleResult::Matched
            }
            Rule::SrcRewrite { from_slot, from_id, to_slot, to_id, range } => {
                if packet_slot(pkt) != from_slot || !(from_id..from_id + range).contains(&pkt.src) {
                    return RuleResult::Unmatched;
                }
                pkt.src = pkt.src + to_id - from_id;
                set_packet_slot(pkt, to_slot);
                RuleResult::Matched
            }
            Rule::PassAllTg { slot } => {
                if pkt.group_call && packet_slot(pkt) == slot {
                    RuleResult::Matched
                } else {
                    RuleResult::Unmatched
                }
            }
            Rule::PassAllPc { slot } => {
                if !pkt.group_call && packet_slot(pkt) == slot {
                    RuleResult::Matched
                } else {
                    RuleResult::Unmatched
                }
            }
        }
    }
}

/// Run `pkt` through `rules` in order. The first matching rule mutates the
/// frame and stops the scan; returns whether any rule matched.
pub fn apply(rules: &[Rule], pkt: &mut DmrdPacket) -> bool {
    for rule in rules {
        if rule.process(pkt) == RuleResult::Matched {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_pkt(slot: u8, dst: u32) -> DmrdPacket {
        DmrdPacket {
            slot: slot == 2,
            group_call: true,
            dst,
            src: 1234,
            ..Default::default()
        }
    }

    fn private_pkt(slot: u8, dst: u32, src: u32) -> DmrdPacket {
        DmrdPacket {
            slot: slot == 2,
            group_call: false,
            dst,
            src,
            ..Default::default()
        }
    }

    #[test]
    fn test_tg_rewrite_single() {
        let r = Rule::TgRewrite { from_slot: 1, from_tg: 9, to_slot: 2, to_tg: 100, range: 1 };
        let mut pkt = group_pkt(1, 9);
        assert_eq!(r.process(&mut pkt), RuleResult::Matched);
        assert_eq!(pkt.dst, 100);
        assert!(pkt.slot, "expected TS2 after rewrite");
    }

    #[test]
    fn test_tg_rewrite_range_offset() {
        let r = Rule::TgRewrite { from_slot: 1, from_tg: 100, to_slot: 1, to_tg: 200, range: 10 };
        let mut pkt = group_pkt(1, 105);
        assert_eq!(r.process(&mut pkt), RuleResult::Matched);
        assert_eq!(pkt.dst, 205);
    }

    #[test]
    fn test_tg_rewrite_rejects() {
        let r = Rule::TgRewrite { from_slot: 1, from_tg: 100, to_slot: 1, to_tg: 200, range: 5 };
        // wrong slot
        assert_eq!(r.process(&mut group_pkt(2, 100)), RuleResult::Unmatched);
        // private call
        assert_eq!(r.process(&mut private_pkt(1, 100, 1)), RuleResult::Unmatched);
        // just past the range (100..105)
        assert_eq!(r.process(&mut group_pkt(1, 105)), RuleResult::Unmatched);
    }

    #[test]
    fn test_pc_rewrite() {
        let r = Rule::PcRewrite { from_slot: 1, from_id: 1000, to_slot: 2, to_id: 2000, range: 100 };
        let mut pkt = private_pkt(1, 1050, 5678);
        assert_eq!(r.process(&mut pkt), RuleResult::Matched);
        assert_eq!(pkt.dst, 2050);
        assert!(pkt.slot);

        assert_eq!(r.process(&mut group_pkt(1, 1050)), RuleResult::Unmatched);
        assert_eq!(r.process(&mut private_pkt(2, 1050, 1)), RuleResult::Unmatched);
    }

    #[test]
    fn test_type_rewrite_converts_to_private() {
        let r = Rule::TypeRewrite { from_slot: 1, from_tg: 9, to_slot: 2, to_id: 3100, range: 1 };
        let mut pkt = group_pkt(1, 9);
        assert_eq!(r.process(&mut pkt), RuleResult::Matched);
        assert_eq!(pkt.dst, 3100);
        assert!(!pkt.group_call);
        assert!(pkt.slot);
    }

    #[test]
    fn test_type_rewrite_range() {
        let r = Rule::TypeRewrite { from_slot: 1, from_tg: 100, to_slot: 1, to_id: 5000, range: 10 };
        let mut pkt = group_pkt(1, 107);
        assert_eq!(r.process(&mut pkt), RuleResult::Matched);
        assert_eq!(pkt.dst, 5007);
        assert!(!pkt.group_call);
    }

    #[test]
    fn test_src_rewrite_keeps_call_type() {
        let r = Rule::SrcRewrite { from_slot: 1, from_id: 1234, to_slot: 2, to_id: 9, range: 1 };
        let mut pkt = private_pkt(1, 999, 1234);
        assert_eq!(r.process(&mut pkt), RuleResult::Matched);
        assert_eq!(pkt.src, 9);
        assert_eq!(pkt.dst, 999, "dst must not change");
        assert!(!pkt.group_call);

        let mut grp = group_pkt(1, 9);
        grp.src = 1234;
        assert_eq!(r.process(&mut grp), RuleResult::Matched);
        assert!(grp.group_call, "group call must stay a group call");
    }

    #[test]
    fn test_src_rewrite_wrong_source() {
        let r = Rule::SrcRewrite { from_slot: 1, from_id: 1234, to_slot: 2, to_id: 9, range: 1 };
        assert_eq!(r.process(&mut private_pkt(1, 999, 5678)), RuleResult::Unmatched);
    }

    #[test]
    fn test_pass_all_tg() {
        let r = Rule::PassAllTg { slot: 1 };
        let mut pkt = group_pkt(1, 12345);
        assert_eq!(r.process(&mut pkt), RuleResult::Matched);
        assert_eq!(pkt.dst, 12345, "pass-all must not mutate");
        assert_eq!(r.process(&mut group_pkt(2, 12345)), RuleResult::Unmatched);
        assert_eq!(r.process(&mut private_pkt(1, 1, 2)), RuleResult::Unmatched);
    }

    #[test]
    fn test_pass_all_pc() {
        let r = Rule::PassAllPc { slot: 2 };
        let mut pkt = private_pkt(2, 9990, 1234);
        assert_eq!(r.process(&mut pkt), RuleResult::Matched);
        assert_eq!(pkt.dst, 9990);
        assert_eq!(pkt.src, 1234);
        assert_eq!(r.process(&mut private_pkt(1, 9990, 1234)), RuleResult::Unmatched);
        assert_eq!(r.process(&mut group_pkt(2, 9990)), RuleResult::Unmatched);
    }

    #[test]
    fn test_apply_first_match_wins() {
        let rules = vec![
            Rule::TgRewrite { from_slot: 1, from_tg: 9, to_slot: 1, to_tg: 100, range: 1 },
            Rule::TgRewrite { from_slot: 1, from_tg: 9, to_slot: 1, to_tg: 200, range: 1 },
        ];
        let mut pkt = group_pkt(1, 9);
        assert!(apply(&rules, &mut pkt));
        assert_eq!(pkt.dst, 100, "second rule must never run");
    }

    #[test]
    fn test_apply_no_match_and_empty() {
        let rules = vec![Rule::TgRewrite { from_slot: 2, from_tg: 9, to_slot: 1, to_tg: 100, range: 1 }];
        let mut pkt = group_pkt(1, 9);
        assert!(!apply(&rules, &mut pkt));
        assert!(!apply(&[], &mut pkt));
        assert_eq!(pkt.dst, 9);
    }

    #[test]
    fn test_apply_pass_all_fallback_after_specific() {
        let rules = vec![
            Rule::TgRewrite { from_slot: 1, from_tg: 100, to_slot: 1, to_tg: 200, range: 10 },
            Rule::PassAllTg { slot: 1 },
        ];

        // In range: the specific rule fires
        let mut pkt = group_pkt(1, 105);
        assert!(apply(&rules, &mut pkt));
        assert_eq!(pkt.dst, 205);

        // Out of range: falls through to pass-all, untouched
        let mut pkt = group_pkt(1, 9);
        assert!(apply(&rules, &mut pkt));
        assert_eq!(pkt.dst, 9);
    }

    #[test]
    fn test_rule_toml_deserialization() {
        let toml_src = r#"
            type = "TGRewrite"
            from_slot = 1
            from_tg = 9
            to_slot = 2
            to_tg = 100
            range = 1
        "#;
        let rule: Rule = toml::from_str(toml_src).unwrap();
        let mut pkt = group_pkt(1, 9);
        assert!(apply(&[rule], &mut pkt));
        assert_eq!(pkt.dst, 100);
        assert!(pkt.slot);
    }
}
