//! Task generators: policy objects that propose new work from catalog
//! state.
//!
//! A generator is a pure function of the view it is given plus its own
//! bookkeeping; it never mutates the catalog. The [`ClaimedInputs`]
//! helper provides the idempotence contract: proposing twice against an
//! unchanged view must not duplicate tasks for already-claimed inputs.

use std::collections::HashSet;
use std::sync::Arc;

use shared_types::{Artifact, ArtifactId, GeneratorId, TaskSpec};

use crate::bundle::Bundle;

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    /// Proposed tasks reference inputs already claimed by another
    /// generator; the brain rejects the batch rather than merging.
    #[error("inputs already claimed elsewhere: {0:?}")]
    DoubleClaim(Vec<ArtifactId>),

    #[error("generator policy error: {0}")]
    Policy(String),
}

/// Contract for adaptive work proposal.
///
/// Variants (trajectory extension, analysis, ...) differ only in the
/// tasks they emit - a capability set, not an inheritance hierarchy.
pub trait TaskGenerator: Send {
    fn id(&self) -> GeneratorId;

    /// Propose zero or more tasks against the given view. Must not
    /// duplicate proposals for inputs this instance already claimed.
    fn propose(&mut self, view: &Bundle) -> Result<Vec<TaskSpec>, GeneratorError>;

    /// Once true, the brain stops re-arming this generator's condition.
    fn exhausted(&self) -> bool {
        false
    }
}

/// Idempotence bookkeeping: which catalog handles this generator has
/// already turned into proposals.
#[derive(Debug, Default)]
pub struct ClaimedInputs {
    claimed: HashSet<ArtifactId>,
}

impl ClaimedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matching artifacts not yet claimed, in view order
    pub fn unclaimed(&self, view: &Bundle) -> Vec<Arc<Artifact>> {
        view.iter()
            .filter(|a| !self.claimed.contains(&a.id))
            .cloned()
            .collect()
    }

    /// Returns false when the input was already claimed
    pub fn claim(&mut self, id: &ArtifactId) -> bool {
        self.claimed.insert(id.clone())
    }

    pub fn is_claimed(&self, id: &ArtifactId) -> bool {
        self.claimed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared_types::TaskId;

    fn view_with(n: usize) -> Bundle {
        let producer = TaskId::new();
        let items: Vec<Arc<Artifact>> = (0..n)
            .map(|i| {
                Arc::new(Artifact {
                    id: ArtifactId::new(),
                    slot: "out".into(),
                    kind: "trajectory".into(),
                    location: format!("/data/{i}"),
                    size: 1,
                    producer: producer.clone(),
                    supersedes: None,
                    seq: i as u64 + 1,
                    recorded_at: Utc::now(),
                })
            })
            .collect();
        Bundle::new(Arc::new(items), n as u64)
    }

    #[test]
    fn claims_are_sticky_across_identical_views() {
        let view = view_with(3);
        let mut claims = ClaimedInputs::new();

        let first = claims.unclaimed(&view);
        assert_eq!(first.len(), 3);
        for artifact in &first {
            assert!(claims.claim(&artifact.id));
        }

        // Same view again: nothing new to claim
        assert!(claims.unclaimed(&view).is_empty());
        assert!(!claims.claim(&first[0].id));
    }
}
