//! Create-or-update of a single managed object

use crate::client::ResourceClient;
use crate::diff::{is_derivative_of, merge_onto};
use crate::error::{OperatorError, Result};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Number of replace attempts before giving up on a conflicting object
pub const CONFLICT_RETRY_STEPS: u32 = 4;
/// Delay before the first conflict retry
pub const CONFLICT_RETRY_BASE: Duration = Duration::from_millis(10);
/// Growth of the delay between conflict retries
pub const CONFLICT_RETRY_FACTOR: u32 = 5;

/// What [`sync_resource`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Delay before conflict retry `attempt` (0-based)
fn conflict_backoff(attempt: u32) -> Duration {
    CONFLICT_RETRY_BASE * CONFLICT_RETRY_FACTOR.saturating_pow(attempt)
}

/// Converge one object towards `desired`.
///
/// The cached copy decides between create and update. An existing object is
/// only written when `desired` is not already derivative of it, and then as
/// the observed object with the desired fields laid over it, so fields the
/// platform filled in (cluster IPs, node ports, defaulted pod fields) are
/// kept. Stale caches surface as 409 Conflict on replace, which is retried
/// against a fresh read.
pub async fn sync_resource<K>(
    client: &dyn ResourceClient<K>,
    namespace: &str,
    desired: &K,
) -> Result<SyncOutcome>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    let name = desired.meta().name.clone().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} manifest without a name", K::kind(&())))
    })?;

    let Some(mut observed) = client.cached(namespace, &name) else {
        info!(kind = %K::kind(&()), name = %name, namespace = %namespace, "Creating resource");
        client.create(namespace, desired).await?;
        return Ok(SyncOutcome::Created);
    };

    let mut attempt = 0;
    loop {
        if is_derivative_of(desired, &observed)? {
            if attempt == 0 {
                debug!(kind = %K::kind(&()), name = %name, "Resource up to date");
                return Ok(SyncOutcome::Unchanged);
            }
            // A fresh read already carries the desired state
            return Ok(SyncOutcome::Updated);
        }

        let merged = merge_onto(&observed, desired)?;
        match client.replace(namespace, &name, &merged).await {
            Ok(_) => {
                info!(kind = %K::kind(&()), name = %name, namespace = %namespace, "Updated resource");
                return Ok(SyncOutcome::Updated);
            }
            Err(e) if e.is_conflict() => {
                attempt += 1;
                if attempt >= CONFLICT_RETRY_STEPS {
                    return Err(OperatorError::ConflictRetriesExhausted {
                        kind: K::kind(&()).to_string(),
                        name,
                        attempts: attempt,
                    });
                }

                let delay = conflict_backoff(attempt - 1);
                warn!(
                    kind = %K::kind(&()),
                    name = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Update conflicted, retrying against a fresh read"
                );
                tokio::time::sleep(delay).await;

                observed = match client.get(namespace, &name).await? {
                    Some(live) => live,
                    None => {
                        info!(kind = %K::kind(&()), name = %name, "Resource vanished, recreating");
                        client.create(namespace, desired).await?;
                        return Ok(SyncOutcome::Created);
                    }
                };
            }
            Err(e) => return Err(e),
        }
    }
}
