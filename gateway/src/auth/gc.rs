//! Background sweep of expired tokens.
//!
//! The sweep task holds a `Weak` reference to the token manager's state:
//! - the manager owns the task handle and aborts it on drop
//! - if the task wakes after the manager is gone, `Weak::upgrade()` returns
//!   `None` and the task exits

use std::sync::Weak;
use std::time::Duration;

use super::manager::{TokenManager, TokenManagerState};

/// Spawn the periodic sweep.
///
/// The first sweep happens one full `interval` after spawning.
///
/// # Returns
/// A `JoinHandle` that can be used to await the task or cancel it on shutdown.
pub fn spawn_gc_task(
    state: Weak<TokenManagerState>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        gc_loop(state, interval).await;
    })
}

async fn gc_loop(state: Weak<TokenManagerState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick of a tokio interval completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(state) = state.upgrade() else {
            tracing::debug!("token manager dropped, stopping token sweep");
            break;
        };

        // GC errors shouldn't crash the task; the next tick retries.
        if let Err(e) = TokenManager::from_state(state).sweep() {
            tracing::warn!("token sweep failed: {e}");
        }
    }
}
