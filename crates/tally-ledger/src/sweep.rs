//! Periodic expiry sweep driver.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::QuotaLedger;

/// Run the expiry sweep on an interval until cancelled.
///
/// Cancellation aborts the next iteration; an in-flight sweep runs to
/// completion. The sweep itself is idempotent, so overlapping workers on
/// other hosts are safe.
pub async fn run_expiry_sweep<L: QuotaLedger + Sync>(
    ledger: Arc<L>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("expiry sweep stopping");
                break;
            }
            _ = ticker.tick() => {
                match ledger.expire_quotas().await {
                    Ok(summary) if summary.expired_records > 0 => {
                        info!(
                            records = summary.expired_records,
                            amount = summary.expired_amount,
                            "expired quota records"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "expiry sweep failed"),
                }
            }
        }
    }
}
