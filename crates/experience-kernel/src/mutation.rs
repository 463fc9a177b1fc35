//! Mutation operations and their deterministic application to a bank.
//!
//! [`MutationResolver::apply`] is the single writer of experience state. It
//! takes a bank by reference, applies operations in the order received against
//! an evolving copy, and returns the new bank together with one
//! [`OpOutcome`] per operation. The input bank is never touched.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::experience::{Experience, ExperienceBank, ExperienceId, Namespace};

/// A proposed change to the experience bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "option", rename_all = "snake_case")]
pub enum MutationOp {
    /// Introduce a new entry under a freshly allocated ID.
    Add { text: String },
    /// Replace the text of an existing entry, keeping its ID.
    Modify { target: ExperienceId, text: String },
    /// Remove every source entry and insert one new entry in their place.
    Merge {
        sources: Vec<ExperienceId>,
        text: String,
    },
}

impl MutationOp {
    /// Short name of the variant, for logging and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Modify { .. } => "modify",
            Self::Merge { .. } => "merge",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Add { text } | Self::Modify { text, .. } | Self::Merge { text, .. } => text,
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add { .. } => write!(f, "add"),
            Self::Modify { target, .. } => write!(f, "modify {target}"),
            Self::Merge { sources, .. } => {
                let ids: Vec<&str> = sources.iter().map(|id| id.as_str()).collect();
                write!(f, "merge [{}]", ids.join(", "))
            }
        }
    }
}

/// Why an operation left the bank unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Modify/Merge referenced IDs that are not visible to the operation.
    DanglingReference { missing: Vec<ExperienceId> },
    /// Merge carried no source IDs at all.
    EmptyMerge,
}

/// Result of applying a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OpOutcome {
    Added {
        id: ExperienceId,
    },
    Modified {
        id: ExperienceId,
    },
    Merged {
        id: ExperienceId,
        removed: Vec<ExperienceId>,
        /// Source IDs that were referenced but not present.
        ignored: Vec<ExperienceId>,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl OpOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Skipped { .. })
    }
}

/// A new bank plus the per-operation audit trail that produced it.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub bank: ExperienceBank,
    pub outcomes: Vec<OpOutcome>,
}

impl Resolution {
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_applied()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.applied()
    }
}

/// Applies mutation operations to experience banks.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationResolver;

impl MutationResolver {
    pub fn new() -> Self {
        Self
    }

    /// Apply `ops` in order to a copy of `snapshot`.
    ///
    /// New IDs come from the generated namespace, starting one past the highest
    /// generated index already present; the counter only moves forward, so an
    /// ID removed by a merge is never handed out again within the call.
    /// Modify and Merge may reference entries added earlier in the same call.
    pub fn apply(&self, snapshot: &ExperienceBank, ops: &[MutationOp]) -> Resolution {
        self.resolve(snapshot, ops, Scope::Evolving)
    }

    /// Like [`apply`](Self::apply), but Modify and Merge only see IDs that
    /// exist in `snapshot` itself.
    ///
    /// For operations proposed independently against the same snapshot: an
    /// ID allocated by one proposer's Add is invisible to every other
    /// proposer, so a reference to it counts as dangling.
    pub fn apply_independent(&self, snapshot: &ExperienceBank, ops: &[MutationOp]) -> Resolution {
        self.resolve(snapshot, ops, Scope::Snapshot)
    }

    fn resolve(&self, snapshot: &ExperienceBank, ops: &[MutationOp], scope: Scope) -> Resolution {
        let mut bank = snapshot.clone();
        let mut next_index = snapshot
            .max_index(Namespace::Generated)
            .map_or(0, |idx| idx + 1);
        let mut outcomes = Vec::with_capacity(ops.len());
        let visible = |id: &ExperienceId| match scope {
            Scope::Evolving => true,
            Scope::Snapshot => snapshot.contains(id),
        };

        for op in ops {
            let outcome = match op {
                MutationOp::Add { text } => {
                    let id = allocate(&bank, &mut next_index);
                    bank.push(Experience::new(id.clone(), text.clone()));
                    OpOutcome::Added { id }
                }
                MutationOp::Modify { target, text } => {
                    if visible(target) && bank.replace_text(target, text) {
                        OpOutcome::Modified { id: target.clone() }
                    } else {
                        OpOutcome::Skipped {
                            reason: SkipReason::DanglingReference {
                                missing: vec![target.clone()],
                            },
                        }
                    }
                }
                MutationOp::Merge { sources, text } => {
                    merge(&mut bank, sources, text, &mut next_index, visible)
                }
            };

            match &outcome {
                OpOutcome::Skipped { reason } => {
                    warn!(op = %op, reason = ?reason, "Mutation skipped");
                }
                applied => debug!(op = %op, outcome = ?applied, "Mutation applied"),
            }
            outcomes.push(outcome);
        }

        Resolution { bank, outcomes }
    }
}

/// Which IDs a Modify or Merge may reference.
#[derive(Debug, Clone, Copy)]
enum Scope {
    /// The evolving bank, including entries added earlier in the call.
    Evolving,
    /// Only the entries of the input snapshot.
    Snapshot,
}

fn merge(
    bank: &mut ExperienceBank,
    sources: &[ExperienceId],
    text: &str,
    next_index: &mut usize,
    visible: impl Fn(&ExperienceId) -> bool,
) -> OpOutcome {
    if sources.is_empty() {
        return OpOutcome::Skipped {
            reason: SkipReason::EmptyMerge,
        };
    }

    let mut seen = HashSet::new();
    let (present, missing): (Vec<ExperienceId>, Vec<ExperienceId>) = sources
        .iter()
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .partition(|id| visible(id) && bank.contains(id));

    if present.is_empty() {
        return OpOutcome::Skipped {
            reason: SkipReason::DanglingReference { missing },
        };
    }

    for id in &present {
        bank.remove(id);
    }
    let id = allocate(bank, next_index);
    bank.push(Experience::new(id.clone(), text));

    OpOutcome::Merged {
        id,
        removed: present,
        ignored: missing,
    }
}

fn allocate(bank: &ExperienceBank, next_index: &mut usize) -> ExperienceId {
    loop {
        let id = ExperienceId::generated(*next_index);
        *next_index += 1;
        if !bank.contains(&id) {
            return id;
        }
    }
}
