//! Index reconciliation by chunk-id set difference.
//!
//! For one document, the authoritative chunk set (from the chunk store,
//! already embedded) is upserted by `chunk_id`, then every id the index
//! holds for that `doc_id` but the target set lacks is deleted. A removed
//! document reconciles against an empty target set.
//!
//! Callers must only reconcile a document whose full target set embedded
//! successfully; otherwise the delete phase could drop live chunks that
//! have no replacement.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::embedding::RetryPolicy;
use crate::error::SyncError;
use crate::index::VectorIndex;
use crate::models::IndexRecord;

/// What reconciliation will do for one document. Pure and order-independent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub upsert_ids: BTreeSet<String>,
    pub delete_ids: BTreeSet<String>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.upsert_ids.is_empty() && self.delete_ids.is_empty()
    }
}

pub fn plan(target_ids: &BTreeSet<String>, current_ids: &BTreeSet<String>) -> ReconcilePlan {
    ReconcilePlan {
        upsert_ids: target_ids.clone(),
        delete_ids: current_ids.difference(target_ids).cloned().collect(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub upserted: usize,
    pub deleted: usize,
}

pub struct Reconciler {
    index: Arc<dyn VectorIndex>,
    policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(index: Arc<dyn VectorIndex>, policy: RetryPolicy) -> Self {
        Self { index, policy }
    }

    /// Make the index hold exactly `target` for `doc_id`.
    ///
    /// Upserts always precede deletes; index write failures are retried
    /// with the same policy as embedding batches.
    pub async fn reconcile(
        &self,
        doc_id: &str,
        target: &[IndexRecord],
    ) -> Result<ReconcileOutcome, SyncError> {
        if let Some(stray) = target.iter().find(|r| r.metadata.doc_id != doc_id) {
            return Err(SyncError::IndexWrite(format!(
                "record {} belongs to {}, not {}",
                stray.chunk_id, stray.metadata.doc_id, doc_id
            )));
        }

        let current = self
            .policy
            .run("index list", || self.index.list_ids(doc_id))
            .await?;
        let target_ids: BTreeSet<String> = target.iter().map(|r| r.chunk_id.clone()).collect();
        let plan = plan(&target_ids, &current);

        let mut outcome = ReconcileOutcome::default();
        if !target.is_empty() {
            outcome.upserted = self
                .policy
                .run("index upsert", || self.index.upsert(target))
                .await?;
        }
        if !plan.delete_ids.is_empty() {
            let ids: Vec<String> = plan.delete_ids.iter().cloned().collect();
            outcome.deleted = self
                .policy
                .run("index delete", || self.index.delete(&ids))
                .await?;
        }

        tracing::debug!(
            doc_id,
            upserted = outcome.upserted,
            deleted = outcome.deleted,
            "reconciled"
        );
        Ok(outcome)
    }
}
