//! Background task feeding membership snapshots into a [`CachedLocator`].
//!
//! One task per locator. It waits on a [`MembershipSubscription`], which
//! only ever holds the latest snapshot, so a burst of membership changes
//! collapses into a single reconciliation pass. A failed pass is retried
//! after `retry_interval`, or earlier if a newer snapshot arrives.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::locator::{CachedLocator, Reconciliation};
use crate::membership::{MembershipSnapshot, MembershipSubscription};

/// Handle to a running reconciliation task.
#[derive(Debug)]
pub struct MembershipReconciler {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MembershipReconciler {
    /// Spawn the task on the current tokio runtime.
    ///
    /// The snapshot already held by `subscription` is applied first.
    pub fn spawn(
        locator: Arc<CachedLocator>,
        subscription: MembershipSubscription,
        retry_interval: Duration,
    ) -> Self {
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(run(locator, subscription, retry_interval, stopped));
        Self {
            stop: Some(stop),
            handle,
        }
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task and wait for it to exit.
    ///
    /// A pass already in progress completes first.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            tracing::warn!(error = %e, "Reconciler: task ended abnormally");
        }
    }
}

impl Drop for MembershipReconciler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(
    locator: Arc<CachedLocator>,
    mut subscription: MembershipSubscription,
    retry_interval: Duration,
    mut stopped: oneshot::Receiver<()>,
) {
    let latest = subscription.latest();
    let mut failed = if latest.version > locator.last_applied_version() {
        reconcile(&locator, latest).await
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            next = subscription.next() => match next {
                Some(snapshot) => failed = reconcile(&locator, snapshot).await,
                None => {
                    tracing::debug!("Reconciler: membership feed closed");
                    break;
                }
            },
            _ = tokio::time::sleep(retry_interval), if failed.is_some() => {
                if let Some(snapshot) = failed.take() {
                    failed = reconcile(&locator, snapshot).await;
                }
            }
        }
    }
}

/// Apply one snapshot; returns it back if the pass has to be retried.
async fn reconcile(
    locator: &CachedLocator,
    snapshot: Arc<MembershipSnapshot>,
) -> Option<Arc<MembershipSnapshot>> {
    match locator.apply_membership(snapshot.clone()).await {
        Ok(Reconciliation::Applied { .. }) => None,
        Ok(Reconciliation::Stale { .. }) => None,
        Err(e) => {
            tracing::warn!(
                version = %snapshot.version,
                error = %e,
                "Reconciler: pass failed, will retry"
            );
            Some(snapshot)
        }
    }
}
