use std::collections::HashMap;
use std::sync::Arc;

use crate::common::error::DomainError;

use super::entity::{KeepState, Rule, RuleAction};
use super::error::FirewallError;
use super::ruleset::Ruleset;

/// Rules of one generation per ruleset; anchors and main never share uids.
const UIDS_PER_RULESET: u64 = 1 << 20;

/// Number carried by the default rule; never a valid ruleset position.
pub const DEFAULT_RULE_NR: u32 = u32::MAX;

/// Loaded rule configuration: the main ruleset, named anchors and the
/// default rule that governs packets nothing else matched.
///
/// Immutable after construction; a reload builds a new engine and swaps it in.
#[derive(Debug)]
pub struct RuleEngine {
    pub(super) main: Ruleset,
    pub(super) anchors: HashMap<String, Ruleset>,
    pub(super) default_rule: Arc<Rule>,
    generation: u64,
    checksum: u64,
}

impl RuleEngine {
    /// Empty ruleset with a stateless pass-all default.
    pub fn new() -> Self {
        Self {
            main: Ruleset::default(),
            anchors: HashMap::new(),
            default_rule: Arc::new(Rule {
                nr: DEFAULT_RULE_NR,
                ..Rule::default()
            }),
            generation: 0,
            checksum: 0,
        }
    }

    /// Compile a complete configuration. Every anchor referenced by a rule
    /// must be supplied; duplicate anchor names are rejected.
    pub fn load(
        main: Vec<Rule>,
        anchors: Vec<(String, Vec<Rule>)>,
        default_action: RuleAction,
        generation: u64,
    ) -> Result<Self, DomainError> {
        let base = generation.wrapping_mul(UIDS_PER_RULESET * 1024);
        let main = Ruleset::compile("", main, base)?;

        let mut compiled = HashMap::with_capacity(anchors.len());
        for (i, (name, rules)) in anchors.into_iter().enumerate() {
            if compiled.contains_key(&name) {
                return Err(FirewallError::DuplicateAnchor { name }.into());
            }
            let uid_base = base.wrapping_add((i as u64 + 1) * UIDS_PER_RULESET);
            let ruleset = Ruleset::compile(&name, rules, uid_base)?;
            compiled.insert(name, ruleset);
        }

        let referenced = std::iter::once(&main)
            .chain(compiled.values())
            .flat_map(|rs| rs.rules().iter())
            .filter_map(|r| r.anchor.as_ref());
        for name in referenced {
            if !compiled.contains_key(name) {
                return Err(FirewallError::AnchorNotFound { name: name.clone() }.into());
            }
        }

        let default_rule = Arc::new(Rule {
            action: match default_action {
                RuleAction::Block => RuleAction::Block,
                _ => RuleAction::Pass,
            },
            keep_state: KeepState::None,
            nr: DEFAULT_RULE_NR,
            uid: base.wrapping_add(UIDS_PER_RULESET * 1023),
            ..Rule::default()
        });

        let mut engine = Self {
            main,
            anchors: compiled,
            default_rule,
            generation,
            checksum: 0,
        };
        engine.checksum = engine.compute_checksum();
        Ok(engine)
    }

    pub fn main(&self) -> &Ruleset {
        &self.main
    }

    pub fn anchor(&self, name: &str) -> Option<&Ruleset> {
        self.anchors.get(name)
    }

    pub fn anchor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.anchors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn default_rule(&self) -> &Arc<Rule> {
        &self.default_rule
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fingerprint of the rule layout, compared when importing replicated
    /// states so rule numbers are only trusted between identical rulesets.
    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    /// Rule by ruleset name (`""` for main) and number.
    pub fn rule(&self, ruleset: &str, nr: u32) -> Option<Arc<Rule>> {
        let rs = if ruleset.is_empty() {
            &self.main
        } else {
            self.anchors.get(ruleset)?
        };
        rs.get(nr).cloned()
    }

    /// Total rules across main and anchors.
    pub fn rule_count(&self) -> usize {
        self.main.len() + self.anchors.values().map(Ruleset::len).sum::<usize>()
    }

    /// Every ruleset, main first, anchors in name order.
    pub fn rulesets(&self) -> Vec<&Ruleset> {
        let mut out = vec![&self.main];
        let mut anchors: Vec<&Ruleset> = self.anchors.values().collect();
        anchors.sort_by(|a, b| a.name().cmp(b.name()));
        out.extend(anchors);
        out
    }

    fn compute_checksum(&self) -> u64 {
        let mut hash = Fnv64::new();
        for rs in self.rulesets() {
            hash.write(rs.name().as_bytes());
            for rule in rs.rules() {
                hash.write(rule_fingerprint(rule).as_bytes());
            }
        }
        hash.finish()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn rule_fingerprint(r: &Rule) -> String {
    format!(
        "{:?}|{:?}|{}|{:?}|{}|{:?}|{:?}|{:?}|{:?}|{:?}|{}/{}|{:?}|{:?}",
        r.action,
        r.direction,
        r.quick,
        r.interface,
        r.ifnot,
        r.af,
        r.proto,
        r.src,
        r.dst,
        r.keep_state,
        r.flags,
        r.flagset,
        r.anchor,
        r.label,
    )
}

/// 64-bit FNV-1a.
pub(crate) struct Fnv64(u64);

impl Fnv64 {
    pub(crate) fn new() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= u64::from(b);
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
    }

    pub(crate) fn finish(&self) -> u64 {
        self.0
    }
}
