#![forbid(unsafe_code)]

use super::{CycleReport, PullFailure, SyncEngine};
use crate::auth::AuthProvider;
use crate::remote::RemoteClient;
use tk_core::EntityKind;
use tk_storage::{Backend, LocalStore, StoreError};

impl<S, R, A> SyncEngine<S, R, A>
where
    S: Backend + Send,
    R: RemoteClient,
    A: AuthProvider,
{
    /// Categories, then tasks. A kind whose listing fails keeps its checkpoint and is retried
    /// next cycle.
    pub(super) fn pull_phase(&self, report: &mut CycleReport) -> Result<(), StoreError> {
        for kind in EntityKind::ALL {
            if self.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            let since = self.lock_store()?.checkpoint(kind)?;
            let (listed, refreshed) = self.call_remote(|credential| {
                self.remote
                    .list_changes(credential, kind, since.as_deref())
            });
            if refreshed {
                report.auth_refreshes += 1;
            }
            let batch = match listed {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(kind = kind.as_str(), error = %err, "pull failed");
                    report.pull_errors.push(PullFailure {
                        kind,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            if batch.entities.iter().any(|remote| remote.kind() != kind) {
                tracing::warn!(kind = kind.as_str(), "pull batch mixes entity kinds");
                report.pull_errors.push(PullFailure {
                    kind,
                    message: "server returned another entity kind".to_string(),
                });
                continue;
            }

            let now_ms = self.now_ms();
            let applied = self.lock_store()?.apply_pull_batch(
                kind,
                &batch.entities,
                batch.checkpoint.as_deref(),
                now_ms,
            )?;
            tracing::debug!(
                kind = kind.as_str(),
                full_resync = since.is_none(),
                received = batch.entities.len(),
                applied = applied.applied,
                removed = applied.removed,
                deferred = applied.deferred,
                "pull batch applied"
            );
            report.record_pull(applied);
        }
        Ok(())
    }
}
