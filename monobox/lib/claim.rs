//! Claiming warm sandboxes out of pools.
//!
//! Claiming is a compare-and-swap loop, not a lock: every claimer lists the
//! pool, picks the first warm member and writes the claimed label conditioned
//! on the member's resource version. Losing a race against another claimer
//! shows up as a conflict, after which the loop re-lists and tries the next
//! candidate. Two claimers can therefore never walk away with the same
//! sandbox, no matter how many controller or client replicas are running.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::resource::{pool_selector, Sandbox, CLAIMED_LABEL};
use crate::store::ResourceStore;
use crate::utils::with_backoff;
use crate::MonoboxError;
use crate::MonoboxResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Hands warm pool members to callers, one winner per sandbox.
pub struct ClaimCoordinator<S> {
    store: Arc<S>,
    config: ControllerConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S> ClaimCoordinator<S>
where
    S: ResourceStore,
{
    /// Creates a coordinator over the given store.
    pub fn new(store: Arc<S>, config: ControllerConfig) -> Self {
        Self { store, config }
    }

    /// Claims a warm sandbox from `pool`, optionally attaching a shared
    /// volume claim to its spec.
    ///
    /// Returns [`MonoboxError::NoSandboxAvailable`] when the pool has no
    /// warm member left; the caller can fall back to creating a cold
    /// sandbox or retry after the pool replenishes.
    pub async fn claim(
        &self,
        namespace: &str,
        pool: &str,
        volume: Option<&str>,
    ) -> MonoboxResult<Sandbox> {
        let selector = pool_selector(pool);
        let attempts = *self.config.get_claim_attempts();
        let mut last_conflict = None;

        for attempt in 1..=attempts {
            let members = with_backoff(
                "list pool members",
                *self.config.get_retry_attempts(),
                *self.config.get_retry_base_delay(),
                || self.store.list_sandboxes(namespace, Some(&selector)),
            )
            .await?;

            let Some(candidate) = members.iter().find(|member| member.is_warm()) else {
                return Err(MonoboxError::NoSandboxAvailable(pool.to_string()));
            };

            let mut claimed = candidate.clone();
            claimed
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(CLAIMED_LABEL.to_string(), "true".to_string());
            if let Some(claim_name) = volume {
                claimed.spec.volume = Some(claim_name.to_string());
            }

            // The update carries the resource version we listed at, so a
            // concurrent claimer winning first turns this into a conflict.
            match self.store.update_sandbox(namespace, &claimed).await {
                Ok(updated) => {
                    info!(
                        %namespace,
                        %pool,
                        sandbox = %updated.name_any(),
                        "claimed sandbox from pool"
                    );
                    return Ok(updated);
                }
                Err(error) if error.is_conflict() => {
                    debug!(%pool, attempt, "lost claim race, relisting");
                    last_conflict = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_conflict.unwrap_or_else(|| MonoboxError::conflict("Sandbox", pool)))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
