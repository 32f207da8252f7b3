//! Bundle: a lazy, read-only view over a catalog snapshot.
//!
//! A bundle never owns artifact data; it shares the snapshot arena via
//! `Arc` and stacks filter predicates that compose by intersection.
//! Iteration evaluates the filters lazily, so chaining views is cheap
//! regardless of catalog size.

use std::fmt;
use std::sync::Arc;

use shared_types::{Artifact, ArtifactId, TaskId};

type ArtifactFilter = Arc<dyn Fn(&Artifact) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct Bundle {
    /// Snapshot arena in catalog sequence order
    items: Arc<Vec<Arc<Artifact>>>,
    filters: Vec<ArtifactFilter>,
    /// Catalog sequence counter at snapshot time
    seq: u64,
}

impl Bundle {
    pub(crate) fn new(items: Arc<Vec<Arc<Artifact>>>, seq: u64) -> Self {
        Self {
            items,
            filters: Vec::new(),
            seq,
        }
    }

    /// Empty view, useful as a neutral element in tests and generators
    pub fn empty() -> Self {
        Self::new(Arc::new(Vec::new()), 0)
    }

    /// Catalog sequence counter at the instant this view was taken
    pub fn snapshot_seq(&self) -> u64 {
        self.seq
    }

    /// Narrow the view with an additional predicate (intersection)
    pub fn filter(&self, pred: impl Fn(&Artifact) -> bool + Send + Sync + 'static) -> Bundle {
        let mut narrowed = self.clone();
        narrowed.filters.push(Arc::new(pred));
        narrowed
    }

    pub fn of_kind(&self, kind: &str) -> Bundle {
        let kind = kind.to_string();
        self.filter(move |a| a.kind == kind)
    }

    pub fn produced_by(&self, task: &TaskId) -> Bundle {
        let task = task.clone();
        self.filter(move |a| a.producer == task)
    }

    /// Artifacts recorded after the given sequence number
    pub fn since_seq(&self, seq: u64) -> Bundle {
        self.filter(move |a| a.seq > seq)
    }

    fn matches(&self, artifact: &Artifact) -> bool {
        self.filters.iter().all(|f| f(artifact))
    }

    /// Lazy iteration in catalog sequence order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Artifact>> + '_ {
        self.items.iter().filter(|a| self.matches(a.as_ref()))
    }

    /// Dereference a handle through this view; `None` when the artifact
    /// was never recorded or is filtered out.
    pub fn get(&self, id: &ArtifactId) -> Option<Arc<Artifact>> {
        self.iter().find(|a| &a.id == id).cloned()
    }

    pub fn handles(&self) -> Vec<ArtifactId> {
        self.iter().map(|a| a.id.clone()).collect()
    }

    /// Matching artifacts, materialized in explicit sequence order
    pub fn sorted_by_seq(&self) -> Vec<Arc<Artifact>> {
        self.iter().cloned().collect()
    }

    /// Most recently recorded matching artifact
    pub fn latest(&self) -> Option<Arc<Artifact>> {
        self.iter().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("arena_len", &self.items.len())
            .field("filters", &self.filters.len())
            .field("seq", &self.seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn artifact(kind: &str, producer: &TaskId, seq: u64) -> Arc<Artifact> {
        Arc::new(Artifact {
            id: ArtifactId::new(),
            slot: "out".to_string(),
            kind: kind.to_string(),
            location: format!("/data/{seq}"),
            size: 1,
            producer: producer.clone(),
            supersedes: None,
            seq,
            recorded_at: Utc::now(),
        })
    }

    fn sample() -> (Bundle, TaskId, TaskId) {
        let t1 = TaskId::new();
        let t2 = TaskId::new();
        let items = Arc::new(vec![
            artifact("trajectory", &t1, 1),
            artifact("model", &t1, 2),
            artifact("trajectory", &t2, 3),
        ]);
        (Bundle::new(items, 3), t1, t2)
    }

    #[test]
    fn filters_intersect() {
        let (bundle, t1, _) = sample();
        assert_eq!(bundle.len(), 3);
        assert_eq!(bundle.of_kind("trajectory").len(), 2);
        assert_eq!(bundle.of_kind("trajectory").produced_by(&t1).len(), 1);
        assert!(bundle.of_kind("model").produced_by(&t1).len() == 1);
        assert!(bundle.of_kind("model").since_seq(2).is_empty());
    }

    #[test]
    fn views_share_the_arena() {
        let (bundle, _, _) = sample();
        let narrowed = bundle.of_kind("trajectory");
        assert!(Arc::ptr_eq(&bundle.items, &narrowed.items));
    }

    #[test]
    fn iteration_stays_in_seq_order() {
        let (bundle, _, _) = sample();
        let seqs: Vec<u64> = bundle.iter().map(|a| a.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(bundle.latest().map(|a| a.seq), Some(3));
    }

    #[test]
    fn get_respects_filters() {
        let (bundle, _, t2) = sample();
        let id = bundle.produced_by(&t2).handles().pop().expect("one handle");
        assert!(bundle.get(&id).is_some());
        assert!(bundle.of_kind("model").get(&id).is_none());
    }
}
