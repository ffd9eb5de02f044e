//! Ground-Truth Event Tracker (C12): turns operator "tag at reference"
//! events into store-backed ground-truth intervals (§4.8).
//!
//! Re-architected per the source's `Experiment.apply_ground_truth_info`,
//! which folds this state machine directly into the store object and
//! therefore has the tracker and the store call back into each other. Here
//! the tracker only remembers the pending interval's store id plus the
//! bookkeeping needed to decide the next transition, and drives the store
//! through its ordinary by-value operations — no cyclic coupling.

use std::collections::HashMap;

use lat_types::GroundTruthAction;

use crate::error::StoreError;
use crate::store::Store;

#[derive(Debug, Clone)]
struct Pending {
    id: u32,
    reference: String,
    action: GroundTruthAction,
}

#[derive(Default)]
pub struct GroundTruthTracker {
    pending: HashMap<u32, Pending>,
}

impl GroundTruthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one `(tag_id, reference_point, action)` event, opening,
    /// finalizing, or cancelling the tag's pending interval as needed.
    pub async fn handle_event(
        &mut self,
        store: &Store,
        tag_id: u32,
        timestamp: f64,
        reference: &str,
        reference_point: (f64, f64),
        action: GroundTruthAction,
    ) -> Result<(), StoreError> {
        use GroundTruthAction::*;

        if let Some(pending) = self.pending.get(&tag_id).cloned() {
            let same_reference = pending.reference == reference;

            let arrived_then_leaving =
                pending.action == Arrived && matches!(action, Abandoned | Heading) && same_reference;
            let heading_or_passed_then_closing = matches!(pending.action, Heading | Passed)
                && matches!(action, Passed | Arrived)
                && !same_reference;

            if arrived_then_leaving {
                store.end_ground_truth(pending.id, timestamp, None, None).await?;
            } else if heading_or_passed_then_closing {
                let label = format!("{}>{}", pending.reference, reference);
                store
                    .end_ground_truth(pending.id, timestamp, Some(reference_point), Some(&label))
                    .await?;
            } else {
                store.cancel_ground_truth(pending.id).await?;
            }
            self.pending.remove(&tag_id);
        }

        if action != Abandoned {
            let id = store
                .start_ground_truth(tag_id, timestamp, reference, reference_point)
                .await?;
            self.pending.insert(
                tag_id,
                Pending {
                    id,
                    reference: reference.to_string(),
                    action,
                },
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        let file = tempfile::NamedTempFile::new().unwrap();
        crate::store::Store::open(file.path()).await.unwrap()
    }

    #[tokio::test]
    async fn arrived_then_abandoned_finalizes_static_interval() {
        let store = memory_store().await;
        let mut tracker = GroundTruthTracker::new();
        tracker
            .handle_event(&store, 1, 0.0, "A", (0.0, 0.0), GroundTruthAction::Arrived)
            .await
            .unwrap();
        tracker
            .handle_event(&store, 1, 5.0, "A", (0.0, 0.0), GroundTruthAction::Abandoned)
            .await
            .unwrap();
        // Abandoned does not open a new pending interval.
        assert!(tracker.pending.get(&1).is_none());
        let point = store.ground_truth(1, 2.0).await.unwrap();
        assert_eq!(point, Some((0.0, 0.0)));
    }

    #[tokio::test]
    async fn heading_then_arrived_elsewhere_finalizes_dynamic_interval() {
        let store = memory_store().await;
        let mut tracker = GroundTruthTracker::new();
        tracker
            .handle_event(&store, 1, 0.0, "A", (0.0, 0.0), GroundTruthAction::Heading)
            .await
            .unwrap();
        tracker
            .handle_event(&store, 1, 10.0, "B", (10.0, 0.0), GroundTruthAction::Arrived)
            .await
            .unwrap();
        let point = store.ground_truth(1, 5.0).await.unwrap();
        assert_eq!(point, Some((5.0, 0.0)));
        // Arrived re-opens a fresh pending interval at B.
        assert!(tracker.pending.get(&1).is_some());
    }

    #[tokio::test]
    async fn unrelated_transition_cancels_pending_interval() {
        let store = memory_store().await;
        let mut tracker = GroundTruthTracker::new();
        tracker
            .handle_event(&store, 1, 0.0, "A", (0.0, 0.0), GroundTruthAction::Arrived)
            .await
            .unwrap();
        // Arrived -> Passed at the *same* reference matches neither
        // transition rule, so the pending interval is cancelled.
        tracker
            .handle_event(&store, 1, 5.0, "A", (0.0, 0.0), GroundTruthAction::Passed)
            .await
            .unwrap();
        assert_eq!(store.ground_truth(1, 1.0).await.unwrap(), None);
    }
}
