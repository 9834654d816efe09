//! Isolation policy resolution.
//!
//! Maps an operation category `(resource_type, operation_type, context)` to
//! a concurrency strategy. Rules are ranked by priority, then by how many
//! selectors they pin down, then by insertion order. When nothing matches the
//! resolver fails closed to a pessimistic lock with the shortest configured
//! timeout.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::Duration;
use tce_common::prelude::*;

/// Outcome of a policy lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPolicy {
    pub strategy: StrategyKind,
    /// Lease (and wait bound) for pessimistic locks
    #[serde(with = "tce_common::config::humantime_serde")]
    pub lock_timeout: Duration,
    /// Name of the matching rule; `None` for the fail-closed default
    pub rule: Option<String>,
}

/// Rule-based strategy resolver. Construction is the only mutation.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    rules: Vec<PolicyRule>,
    default_lease: Duration,
    fallback: ResolvedPolicy,
}

impl PolicyResolver {
    pub fn new(config: &PolicyConfig, locks: &LockConfig) -> Self {
        let shortest = config
            .rules
            .iter()
            .filter(|r| r.strategy == StrategyKind::PessimisticLock)
            .filter_map(|r| r.lock_timeout)
            .min()
            .unwrap_or(locks.min_lease);

        Self {
            rules: config.rules.clone(),
            default_lease: locks.default_lease,
            fallback: ResolvedPolicy {
                strategy: StrategyKind::PessimisticLock,
                lock_timeout: shortest,
                rule: None,
            },
        }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// The fail-closed policy applied when no rule matches.
    pub fn fallback(&self) -> &ResolvedPolicy {
        &self.fallback
    }

    pub fn resolve(
        &self,
        resource_type: &str,
        operation_type: &str,
        attributes: &BTreeMap<String, Payload>,
    ) -> ResolvedPolicy {
        let best = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| matches(rule, resource_type, operation_type, attributes))
            .min_by_key(|(index, rule)| (Reverse(rule.priority), Reverse(specificity(rule)), *index));

        match best {
            Some((_, rule)) => {
                trace!(
                    rule = %rule.name,
                    resource_type,
                    operation_type,
                    strategy = %rule.strategy,
                    "policy rule matched"
                );
                ResolvedPolicy {
                    strategy: rule.strategy,
                    lock_timeout: rule.lock_timeout.unwrap_or(self.default_lease),
                    rule: Some(rule.name.clone()),
                }
            }
            None => {
                debug!(resource_type, operation_type, "no policy rule matched, failing closed");
                self.fallback.clone()
            }
        }
    }
}

fn matches(
    rule: &PolicyRule,
    resource_type: &str,
    operation_type: &str,
    attributes: &BTreeMap<String, Payload>,
) -> bool {
    rule.resource_type.as_deref().map_or(true, |t| t == resource_type)
        && rule.operation_type.as_deref().map_or(true, |o| o == operation_type)
        && rule
            .predicates
            .iter()
            .all(|(name, expected)| attributes.get(name) == Some(expected))
}

fn specificity(rule: &PolicyRule) -> usize {
    rule.resource_type.is_some() as usize
        + rule.operation_type.is_some() as usize
        + rule.predicates.len()
}
