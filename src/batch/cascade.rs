//! Per-job cascade state: which references to skip and which bare
//! references to substitute by their resolved form.
//!
//! Both collections only grow while a job is drained and only affect rows
//! processed after the decision. The state belongs to one job; the scheduler
//! loads it when it claims the job and passes it through every step.

use std::collections::{BTreeMap, BTreeSet};

use super::reference::ReferenceId;
use super::types::CascadeSignal;

/// What the cascade says about an entry before it is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeDecision {
    /// Check the entry as it is.
    Proceed,
    /// Its reference failed earlier in this job.
    Skip,
    /// Check the rewritten entry instead.
    Substitute { entry: String, resolved: String },
}

/// Decisions produced by one row, to be persisted with its completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeUpdate {
    pub skip: Option<String>,
    pub substitution: Option<(String, String)>,
}

impl CascadeUpdate {
    pub fn is_empty(&self) -> bool {
        self.skip.is_none() && self.substitution.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeState {
    skip: BTreeSet<String>,
    substitutions: BTreeMap<String, String>,
}

impl CascadeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_skipped(&self, base: &str) -> bool {
        self.skip.contains(base)
    }

    pub fn substitution_for(&self, base: &str) -> Option<&str> {
        self.substitutions.get(base).map(String::as_str)
    }

    pub fn skip_count(&self) -> usize {
        self.skip.len()
    }

    pub fn substitution_count(&self) -> usize {
        self.substitutions.len()
    }

    /// Decide how to treat an entry that refers to `reference`.
    /// Skips apply to every version of a base; substitutions only to bare ones.
    pub fn decide(&self, entry: &str, reference: &ReferenceId) -> CascadeDecision {
        if self.is_skipped(&reference.base) {
            return CascadeDecision::Skip;
        }
        if reference.is_bare() {
            if let Some(resolved) = self.substitution_for(&reference.base) {
                return CascadeDecision::Substitute {
                    entry: reference.rewrite(entry, resolved),
                    resolved: resolved.to_string(),
                };
            }
        }
        CascadeDecision::Proceed
    }

    /// Turn a checker signal into the update it implies. Decisions already in
    /// force produce no update.
    pub fn update_for(&self, signal: &CascadeSignal) -> CascadeUpdate {
        match signal {
            CascadeSignal::None => CascadeUpdate::default(),
            CascadeSignal::ProvisionalSubstitution { base, resolved } => {
                if self.substitutions.contains_key(base) {
                    CascadeUpdate::default()
                } else {
                    CascadeUpdate {
                        skip: None,
                        substitution: Some((base.clone(), resolved.clone())),
                    }
                }
            }
            CascadeSignal::TerminalFailure { base } => {
                if self.skip.contains(base) {
                    CascadeUpdate::default()
                } else {
                    CascadeUpdate {
                        skip: Some(base.clone()),
                        substitution: None,
                    }
                }
            }
        }
    }

    /// Record a persisted update. Existing substitutions are never overwritten.
    pub fn apply(&mut self, update: &CascadeUpdate) {
        if let Some(base) = &update.skip {
            self.skip.insert(base.clone());
        }
        if let Some((base, resolved)) = &update.substitution {
            self.substitutions
                .entry(base.clone())
                .or_insert_with(|| resolved.clone());
        }
    }

    pub(crate) fn insert_skip(&mut self, base: String) {
        self.skip.insert(base);
    }

    pub(crate) fn insert_substitution(&mut self, base: String, resolved: String) {
        self.substitutions.entry(base).or_insert(resolved);
    }
}
