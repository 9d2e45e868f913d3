// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Pure-function governance policy evaluation."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! A policy is a small signed document; evaluation is a pure function of
//! the policy and the observed run facts. No I/O, no clock: the same
//! `(policy, facts)` pair always yields the same verdict, which is what
//! lets verdicts be recorded in capsules and re-derived during audit.

use reach_core::{ErrorKind, ReachError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Governance policy document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Policy {
    /// Policy document version.
    pub version: u32,
    /// Runs must execute under the deterministic clock.
    pub require_deterministic: bool,
    /// Runs must carry a signature.
    pub require_signed: bool,
    /// Ceiling on external dependencies a pack may declare.
    pub max_external_deps: u32,
    /// Plugins must be pinned by content hash.
    pub require_plugin_pinned: bool,
    /// Floor on the run's reproducibility score.
    pub min_reproducibility: f64,
    /// Chaos injection is forbidden on the main branch.
    pub forbid_chaos_on_main: bool,
}

impl Policy {
    /// A conservative default: determinism on, signatures off, no chaos on
    /// main.
    #[must_use]
    pub fn baseline() -> Self {
        Self {
            version: 1,
            require_deterministic: true,
            require_signed: false,
            max_external_deps: 16,
            require_plugin_pinned: true,
            min_reproducibility: 0.0,
            forbid_chaos_on_main: true,
        }
    }

    /// Canonical fingerprint of this policy.
    ///
    /// # Errors
    ///
    /// Fails if the policy cannot be serialized (non-finite
    /// `min_reproducibility` values are the only way there).
    pub fn fingerprint(&self) -> Result<String, ReachError> {
        reach_hash::fixed_float(self.min_reproducibility)
            .map_err(|e| ReachError::new(ErrorKind::ValidationFailure, e.to_string()))?;
        Ok(reach_hash::hash_canonical(self)?)
    }
}

/// Observed facts about a run, gathered by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunFacts {
    /// The run executed under a fixed clock and seeded randomness.
    pub deterministic: bool,
    /// The run carries a verifiable signature.
    pub signed: bool,
    /// External dependencies declared by the pack.
    pub external_deps: u32,
    /// Every plugin capability is pinned by content hash.
    pub plugins_pinned: bool,
    /// Measured reproducibility score in `[0, 1]`.
    pub reproducibility: f64,
    /// Branch the run targets.
    pub branch: String,
    /// Chaos injection was enabled.
    pub chaos_enabled: bool,
}

/// Evaluation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum Verdict {
    /// The run satisfies the policy.
    Allow,
    /// The run violates the policy; every failed rule is listed.
    Deny {
        /// Human-readable reasons, one per failed rule.
        reasons: Vec<String>,
    },
}

impl Verdict {
    /// Returns `true` for [`Verdict::Allow`].
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Evaluate a run against a policy.
///
/// All rules are checked; a deny lists every violated rule, not just the
/// first.
#[must_use]
pub fn evaluate(policy: &Policy, facts: &RunFacts) -> Verdict {
    let mut reasons = Vec::new();
    if policy.require_deterministic && !facts.deterministic {
        reasons.push("run is not deterministic".to_string());
    }
    if policy.require_signed && !facts.signed {
        reasons.push("run is not signed".to_string());
    }
    if facts.external_deps > policy.max_external_deps {
        reasons.push(format!(
            "pack declares {} external dependencies (max {})",
            facts.external_deps, policy.max_external_deps
        ));
    }
    if policy.require_plugin_pinned && !facts.plugins_pinned {
        reasons.push("plugins are not pinned".to_string());
    }
    if facts.reproducibility < policy.min_reproducibility {
        reasons.push(format!(
            "reproducibility {} is below the floor {}",
            facts.reproducibility, policy.min_reproducibility
        ));
    }
    if policy.forbid_chaos_on_main && facts.chaos_enabled && facts.branch == "main" {
        reasons.push("chaos injection is forbidden on main".to_string());
    }
    if reasons.is_empty() {
        Verdict::Allow
    } else {
        Verdict::Deny { reasons }
    }
}

/// The error a caller raises when enforcing a deny verdict.
#[must_use]
pub fn denial_error(reasons: &[String]) -> ReachError {
    ReachError::new(
        ErrorKind::PolicyDenied,
        format!("policy denied the run: {}", reasons.join("; ")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_facts() -> RunFacts {
        RunFacts {
            deterministic: true,
            signed: true,
            external_deps: 2,
            plugins_pinned: true,
            reproducibility: 1.0,
            branch: "main".into(),
            chaos_enabled: false,
        }
    }

    #[test]
    fn clean_run_is_allowed() {
        assert_eq!(evaluate(&Policy::baseline(), &clean_facts()), Verdict::Allow);
    }

    #[test]
    fn deny_lists_every_violated_rule() {
        let policy = Policy {
            require_signed: true,
            ..Policy::baseline()
        };
        let facts = RunFacts {
            deterministic: false,
            signed: false,
            ..clean_facts()
        };
        match evaluate(&policy, &facts) {
            Verdict::Deny { reasons } => {
                assert_eq!(reasons.len(), 2);
                assert!(reasons[0].contains("deterministic"));
                assert!(reasons[1].contains("signed"));
            }
            Verdict::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn external_dep_ceiling_applies() {
        let policy = Policy {
            max_external_deps: 1,
            ..Policy::baseline()
        };
        let facts = RunFacts {
            external_deps: 3,
            ..clean_facts()
        };
        assert!(!evaluate(&policy, &facts).is_allow());
    }

    #[test]
    fn chaos_on_main_is_denied_but_ok_elsewhere() {
        let policy = Policy::baseline();
        let on_main = RunFacts {
            chaos_enabled: true,
            ..clean_facts()
        };
        assert!(!evaluate(&policy, &on_main).is_allow());
        let on_branch = RunFacts {
            chaos_enabled: true,
            branch: "feature/x".into(),
            ..clean_facts()
        };
        assert!(evaluate(&policy, &on_branch).is_allow());
    }

    #[test]
    fn reproducibility_floor_applies() {
        let policy = Policy {
            min_reproducibility: 0.9,
            ..Policy::baseline()
        };
        let facts = RunFacts {
            reproducibility: 0.5,
            ..clean_facts()
        };
        assert!(!evaluate(&policy, &facts).is_allow());
    }

    #[test]
    fn evaluation_is_pure() {
        let policy = Policy::baseline();
        let facts = clean_facts();
        assert_eq!(evaluate(&policy, &facts), evaluate(&policy, &facts));
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = Policy::baseline().fingerprint().unwrap();
        let b = Policy::baseline().fingerprint().unwrap();
        assert_eq!(a, b);
        let changed = Policy {
            version: 2,
            ..Policy::baseline()
        };
        assert_ne!(changed.fingerprint().unwrap(), a);
    }

    #[test]
    fn non_finite_floor_fails_fingerprint() {
        let bad = Policy {
            min_reproducibility: f64::NAN,
            ..Policy::baseline()
        };
        assert!(bad.fingerprint().is_err());
    }

    #[test]
    fn denial_error_is_policy_denied() {
        let err = denial_error(&["nope".into()]);
        assert_eq!(err.kind, ErrorKind::PolicyDenied);
        assert_eq!(err.kind.exit_code(), 1);
    }
}
