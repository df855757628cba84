//! Status persistence with retry on optimistic-concurrency conflicts.

use metrics::counter;
use rudder_api::ServingStack;
use rudder_core::Result;
use rudder_kubehub::StackClient;
use tracing::{debug, warn};

pub const MAX_STATUS_ATTEMPTS: usize = 5;

/// Write the status of `stack` and replace `stack` with the accepted copy.
///
/// A conflict means someone else changed the object since it was read. The
/// latest copy is fetched, the computed status is laid over it and the write
/// is tried again, up to [`MAX_STATUS_ATTEMPTS`] times in total.
pub async fn update_status<S: StackClient + ?Sized>(client: &S, stack: &mut ServingStack) -> Result<()> {
    let desired = stack.status.clone();
    let key = stack.key();
    let mut attempt = 1;
    loop {
        match client.update_stack_status(stack).await {
            Ok(accepted) => {
                debug!(stack = %key, attempt, "status persisted");
                *stack = accepted;
                return Ok(());
            }
            Err(e) if e.is_conflict() && attempt < MAX_STATUS_ATTEMPTS => {
                counter!("status_conflicts_total", 1u64);
                warn!(stack = %key, attempt, error = %e, "status conflict, retrying on latest copy");
                let mut latest = client.get_stack(&key).await?;
                latest.status = desired.clone();
                *stack = latest;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
