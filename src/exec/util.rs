//! Small helpers shared by the block and plan machines.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `delay`, returning `false` if `cancel` fires first instead of
/// the timer. Used for a block's entrance/exit delay and Cont's iteration
/// wait.
pub(crate) async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
