//! Controllers for ManagedCluster records
//!
//! [`reconciler`] holds the per-provider state machine; [`cluster`] adapts it
//! to the kube-runtime controller loop.

mod cluster;
mod reconciler;

pub use cluster::{
    error_policy, reconcile, retry_delay, Context, ContextBuilder, CONFLICT_RETRY,
    INVARIANT_RETRY, NOT_YET_AVAILABLE_RETRY,
};
pub use reconciler::{ClusterReconciler, ReconcileCluster, Reconciled, ReconcilerDeps};

#[cfg(test)]
pub use reconciler::MockReconcileCluster;
