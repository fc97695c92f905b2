//! Primary selection among peers sharing one logical session.
//!
//! Every peer runs the same pure computation over the same membership view,
//! so they agree on a single primary without exchanging messages.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Privilege tier required to hold the connection by default.
pub const PRIMARY_TIER: u8 = 4;

/// One participant in the shared session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub tier: u8,
    pub active: bool,
}

impl Candidate {
    pub fn new(id: impl Into<String>, tier: u8, active: bool) -> Self {
        Self {
            id: id.into(),
            tier,
            active,
        }
    }
}

/// Role requirement a candidate must meet to be considered at all.
#[derive(Clone)]
pub struct Eligibility(Arc<dyn Fn(&Candidate) -> bool + Send + Sync>);

impl Eligibility {
    pub fn new(predicate: impl Fn(&Candidate) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Only candidates at exactly `tier` qualify.
    pub fn tier(tier: u8) -> Self {
        Self::new(move |c| c.tier == tier)
    }

    pub fn allows(&self, candidate: &Candidate) -> bool {
        (self.0)(candidate)
    }
}

impl Default for Eligibility {
    fn default() -> Self {
        Self::tier(PRIMARY_TIER)
    }
}

impl fmt::Debug for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Eligibility(..)")
    }
}

/// Ordered eligible ids and the one selected as primary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeadershipView {
    pub eligible: BTreeSet<String>,
    pub primary: Option<String>,
}

impl LeadershipView {
    /// Active, eligible candidates ordered by id. Duplicate entries collapse.
    pub fn compute(candidates: &[Candidate], eligibility: &Eligibility) -> Self {
        let eligible: BTreeSet<String> = candidates
            .iter()
            .filter(|c| c.active && eligibility.allows(c))
            .map(|c| c.id.clone())
            .collect();
        let primary = eligible.first().cloned();
        Self { eligible, primary }
    }
}

/// Lexicographically smallest active eligible id, if any.
pub fn select_primary(candidates: &[Candidate], eligibility: &Eligibility) -> Option<String> {
    LeadershipView::compute(candidates, eligibility).primary
}

/// What the local peer should do after a membership change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadershipChange {
    /// Became primary: open the connection.
    Promoted,
    /// Lost primary: close the connection.
    Demoted,
    Unchanged,
}

/// Tracks whether the local peer is primary across membership changes.
#[derive(Debug)]
pub struct LeadershipArbiter {
    local_id: String,
    eligibility: Eligibility,
    is_primary: bool,
    view: LeadershipView,
}

impl LeadershipArbiter {
    pub fn new(local_id: impl Into<String>, eligibility: Eligibility) -> Self {
        Self {
            local_id: local_id.into(),
            eligibility,
            is_primary: false,
            view: LeadershipView::default(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn view(&self) -> &LeadershipView {
        &self.view
    }

    /// Recompute from the full candidate set and report the transition.
    pub fn reevaluate(&mut self, candidates: &[Candidate]) -> LeadershipChange {
        self.view = LeadershipView::compute(candidates, &self.eligibility);
        let now_primary = self.view.primary.as_deref() == Some(self.local_id.as_str());
        let was_primary = std::mem::replace(&mut self.is_primary, now_primary);

        match (was_primary, now_primary) {
            (false, true) => {
                info!(local_id = %self.local_id, "promoted to primary");
                LeadershipChange::Promoted
            }
            (true, false) => {
                info!(
                    local_id = %self.local_id,
                    primary = ?self.view.primary,
                    "no longer primary"
                );
                LeadershipChange::Demoted
            }
            _ => LeadershipChange::Unchanged,
        }
    }
}
