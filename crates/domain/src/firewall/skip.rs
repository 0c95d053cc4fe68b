//! Skip steps.
//!
//! For every rule and every predicate category, `skip[c]` holds the index of
//! the next rule whose value in that category differs. When a packet fails a
//! category predicate, every rule up to that index would fail it the same way,
//! so evaluation jumps straight there.

use super::entity::Rule;

pub const SKIP_IFP: usize = 0;
pub const SKIP_DIR: usize = 1;
pub const SKIP_RDOM: usize = 2;
pub const SKIP_AF: usize = 3;
pub const SKIP_PROTO: usize = 4;
pub const SKIP_SRC_ADDR: usize = 5;
pub const SKIP_DST_ADDR: usize = 6;
pub const SKIP_SRC_PORT: usize = 7;
pub const SKIP_DST_PORT: usize = 8;
pub const SKIP_COUNT: usize = 9;

fn same_category(c: usize, a: &Rule, b: &Rule) -> bool {
    match c {
        SKIP_IFP => a.interface == b.interface && a.ifnot == b.ifnot,
        SKIP_DIR => a.direction == b.direction,
        SKIP_RDOM => a.onrdomain == b.onrdomain && a.ifnot == b.ifnot,
        SKIP_AF => a.af == b.af,
        SKIP_PROTO => a.proto == b.proto,
        SKIP_SRC_ADDR => a.src.addr == b.src.addr && a.src.neg == b.src.neg,
        SKIP_DST_ADDR => a.dst.addr == b.dst.addr && a.dst.neg == b.dst.neg,
        SKIP_SRC_PORT => a.src.port == b.src.port,
        SKIP_DST_PORT => a.dst.port == b.dst.port,
        _ => false,
    }
}

/// Fill `skip` for every rule of one ruleset.
pub fn compute_skip_steps(rules: &mut [Rule]) {
    let len = rules.len();
    let mut head = [0usize; SKIP_COUNT];

    for cur in 1..=len {
        for (c, start) in head.iter_mut().enumerate() {
            let differs = cur == len || !same_category(c, &rules[*start], &rules[cur]);
            if differs {
                for rule in &mut rules[*start..cur] {
                    rule.skip[c] = cur;
                }
                *start = cur;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity::{Direction, Protocol};

    fn rule(dir: Option<Direction>, proto: Option<Protocol>) -> Rule {
        Rule {
            direction: dir,
            proto,
            ..Rule::default()
        }
    }

    #[test]
    fn empty_ruleset_is_fine() {
        let mut rules: Vec<Rule> = Vec::new();
        compute_skip_steps(&mut rules);
    }

    #[test]
    fn identical_rules_skip_to_end() {
        let mut rules = vec![rule(None, None), rule(None, None), rule(None, None)];
        compute_skip_steps(&mut rules);
        for r in &rules {
            assert!(r.skip.iter().all(|&s| s == 3));
        }
    }

    #[test]
    fn skip_points_at_next_differing_rule() {
        let mut rules = vec![
            rule(Some(Direction::In), Some(Protocol::Tcp)),
            rule(Some(Direction::In), Some(Protocol::Udp)),
            rule(Some(Direction::Out), Some(Protocol::Udp)),
            rule(Some(Direction::Out), Some(Protocol::Udp)),
        ];
        compute_skip_steps(&mut rules);
        assert_eq!(rules[0].skip[SKIP_DIR], 2);
        assert_eq!(rules[1].skip[SKIP_DIR], 2);
        assert_eq!(rules[2].skip[SKIP_DIR], 4);
        assert_eq!(rules[0].skip[SKIP_PROTO], 1);
        assert_eq!(rules[1].skip[SKIP_PROTO], 4);
        assert_eq!(rules[3].skip[SKIP_PROTO], 4);
    }

    #[test]
    fn skip_is_always_forward() {
        let mut rules = vec![
            rule(Some(Direction::In), None),
            rule(None, Some(Protocol::Tcp)),
            rule(Some(Direction::In), None),
        ];
        compute_skip_steps(&mut rules);
        for (i, r) in rules.iter().enumerate() {
            assert!(r.skip.iter().all(|&s| s > i && s <= rules.len()));
        }
    }
}
