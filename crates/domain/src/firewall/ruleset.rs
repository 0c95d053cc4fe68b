use std::sync::Arc;

use tracing::warn;

use crate::common::entity::Direction;
use crate::nat::entity::{Pool, PoolAddr, PoolType};

use super::entity::{AddrMatch, AddrSpec, Rule};
use super::error::FirewallError;
use super::skip::compute_skip_steps;

/// Ordered, compiled list of rules. Immutable once built.
#[derive(Debug, Default)]
pub struct Ruleset {
    name: String,
    rules: Vec<Arc<Rule>>,
}

impl Ruleset {
    /// Validate, expand `binat-to`, number the rules and compute skip steps.
    ///
    /// `uid_base` must be unique per ruleset within a generation so that
    /// source nodes never confuse rules of different loads.
    pub fn compile(name: &str, rules: Vec<Rule>, uid_base: u64) -> Result<Self, FirewallError> {
        for rule in &rules {
            rule.validate()?;
        }

        let mut expanded = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.binat.is_some() {
                expanded.extend(expand_binat(rule));
            } else {
                expanded.push(rule);
            }
        }

        for (nr, rule) in expanded.iter_mut().enumerate() {
            rule.nr = u32::try_from(nr).unwrap_or(u32::MAX);
            rule.uid = uid_base + nr as u64;
        }
        compute_skip_steps(&mut expanded);

        Ok(Self {
            name: name.to_string(),
            rules: expanded.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn get(&self, nr: u32) -> Option<&Arc<Rule>> {
        self.rules.get(nr as usize)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// `binat-to` is a `nat-to` on the way out plus the mirrored `rdr-to` on the
/// way in, both using bitmask mapping.
fn expand_binat(mut rule: Rule) -> Vec<Rule> {
    let Some(pool) = rule.binat.take() else {
        return vec![rule];
    };
    let AddrMatch::Network(inside) = rule.src.addr else {
        return vec![rule];
    };
    let outside = pool.addrs.iter().find_map(|a| match a {
        PoolAddr::Network(net) => Some(*net),
        PoolAddr::Interface(_) => None,
    });

    let reverse = outside.map(|outside| Rule {
        direction: Some(Direction::In),
        src: AddrSpec {
            addr: rule.dst.addr.clone(),
            neg: rule.dst.neg,
            port: None,
        },
        dst: AddrSpec::net(outside),
        nat: None,
        rdr: Some(Arc::new(Pool::new(
            vec![PoolAddr::Network(inside)],
            PoolType::Bitmask,
        ))),
        ..rule.clone()
    });
    if reverse.is_none() {
        warn!(
            pool = ?pool.addrs,
            "binat-to pool has no network entry, inbound mapping skipped"
        );
    }

    rule.direction = Some(Direction::Out);
    rule.nat = Some(pool);
    let mut out = vec![rule];
    out.extend(reverse);
    out
}
