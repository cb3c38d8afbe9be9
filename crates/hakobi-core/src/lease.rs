//! Claim, renewal and loss of unit leases.
//!
//! The claim is the store's single conditional update; this layer only adds
//! the time arithmetic and the renew-while-working loop. Reclamation is
//! implicit: an expired lease makes the unit eligible again, so another
//! worker picks it up through the ordinary poll path. No sweeper exists.

use std::sync::Arc;

use futures::{FutureExt as _, StreamExt as _};

use crate::clock::Clock;
use crate::error::UnitError;
use crate::model::{ClaimedUnit, InputId, WorkerId};
use crate::store::{Store, StoreError};
use crate::utils::Ticker;

#[derive(Clone)]
pub struct LeaseManager<S> {
    store: S,
    worker: WorkerId,
    lease: std::time::Duration,
    clock: Arc<dyn Clock>,
}

impl<S> LeaseManager<S>
where
    S: Store + Sync,
{
    pub fn new(
        store: S,
        worker: WorkerId,
        lease_seconds: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            worker,
            lease: std::time::Duration::from_secs(lease_seconds),
            clock,
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// One shot at the unit. `None` means another worker won; skip it.
    pub async fn try_claim(&self, input_id: InputId) -> Result<Option<ClaimedUnit>, StoreError> {
        let now = self.clock.now();
        let lease_until = now + self.lease_duration();
        self.store.claim(input_id, &self.worker, lease_until, now).await
    }

    /// Extend the lease; `false` means ownership was lost.
    pub async fn renew(&self, input_id: InputId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let lease_until = now + self.lease_duration();
        self.store.renew_lease(input_id, &self.worker, lease_until).await
    }

    /// Drive `work` to completion, renewing the lease at half-lease cadence.
    ///
    /// A renewal that reports lost ownership aborts the work: some other
    /// worker is executing this unit now, and any further mutation from this
    /// side would race it.
    pub async fn run_with_renewal<T>(
        &self,
        input_id: InputId,
        work: impl Future<Output = Result<T, UnitError>>,
    ) -> Result<T, UnitError> {
        let ticker = Ticker::new(self.lease / 2).fuse();
        futures::pin_mut!(ticker);
        let work = work.fuse();
        futures::pin_mut!(work);

        loop {
            futures::select! {
                out = work => return out,
                _ = ticker.next() => {
                    match self.renew(input_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(input_id = %input_id, worker = %self.worker, "lease lost during execution");
                            return Err(UnitError::LeaseLost);
                        }
                        Err(error) => {
                            // The lease may still hold; keep working and let
                            // the guarded terminal mutation settle ownership.
                            tracing::warn!(error = %error, input_id = %input_id, "lease renewal failed");
                        }
                    }
                }
            }
        }
    }
}
