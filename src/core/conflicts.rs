//! Static analysis of rule chains
//!
//! Finds two classes of structural mistakes without evaluating any traffic:
//!
//! - **CONFLICT**: two rules with the same match criteria but different
//!   targets. Only the earlier one can ever decide.
//! - **UNREACHABLE**: a match-all `DROP`/`REJECT` that is followed by more
//!   rules. Nothing after it can match.
//!
//! Analysis is read-only and runs on every `stats` request, so the warning
//! count always reflects the live rule set.

use super::firewall::{ChainName, Rule, RuleChainEngine, Target};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of structural warning
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum WarningKind {
    Conflict,
    Unreachable,
}

/// One finding, with 1-based rule indices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictWarning {
    #[serde(rename = "type")]
    pub kind: WarningKind,
    pub chain: ChainName,
    /// Both rules for a CONFLICT, the blocking rule for UNREACHABLE
    pub rules: Vec<usize>,
    pub message: String,
}

impl fmt::Display for ConflictWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Same source, destination, protocol and destination port
fn same_criteria(a: &Rule, b: &Rule) -> bool {
    a.source == b.source
        && a.destination == b.destination
        && a.protocol == b.protocol
        && a.dport == b.dport
}

fn blocks_everything(rule: &Rule) -> bool {
    matches!(rule.target, Target::Drop | Target::Reject) && rule.is_match_all()
}

fn analyze_chain(name: ChainName, rules: &[Rule], warnings: &mut Vec<ConflictWarning>) {
    for (i, first) in rules.iter().enumerate() {
        for (j, second) in rules.iter().enumerate().skip(i + 1) {
            if same_criteria(first, second) && first.target != second.target {
                warnings.push(ConflictWarning {
                    kind: WarningKind::Conflict,
                    chain: name,
                    rules: vec![i + 1, j + 1],
                    message: format!("Rules {} and {} in {name} chain conflict", i + 1, j + 1),
                });
            }
        }
    }

    // One warning per chain is enough: everything after the first
    // match-all block is dead, whatever it contains.
    if let Some(i) = rules
        .iter()
        .position(blocks_everything)
        .filter(|&i| i + 1 < rules.len())
    {
        warnings.push(ConflictWarning {
            kind: WarningKind::Unreachable,
            chain: name,
            rules: vec![i + 1],
            message: format!(
                "Rules after rule {} in {name} are unreachable (DROP/REJECT ALL)",
                i + 1
            ),
        });
    }
}

/// Analyzes every chain of the engine, in INPUT, OUTPUT, FORWARD order.
pub fn analyze(engine: &RuleChainEngine) -> Vec<ConflictWarning> {
    let mut warnings = Vec::new();
    for (name, chain) in engine.chains() {
        analyze_chain(name, chain.rules(), &mut warnings);
    }
    warnings
}
