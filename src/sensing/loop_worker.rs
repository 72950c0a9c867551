use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backend::SensorBackend;
use super::sensor::{SampleListener, SampleOutcome, SamplingTask};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

// Import the logging macros (exported at crate root)
use crate::{log_debug, log_info, log_warn};

fn new_ticker(period: Duration) -> Interval {
    // The first sample is taken by `activate`, so the first tick is one period out.
    let mut ticker = interval_at(Instant::now() + period, period);
    // A slow read skips ticks instead of bunching them up.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

pub(crate) async fn sampling_loop<B, L>(
    task: SamplingTask<B, L>,
    epoch: u64,
    cancel_token: CancellationToken,
) where
    B: SensorBackend,
    L: SampleListener,
{
    let mut period = task.interval();
    let mut ticker = new_ticker(period);
    log_debug!("sampling loop started (epoch {}, interval {:?})", epoch, period);

    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                log_info!("sampling loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let started = Instant::now();
                if let SampleOutcome::Discarded = task.sample(Some(epoch)).await {
                    break;
                }

                let elapsed = started.elapsed();
                if elapsed > period {
                    log_warn!("ambient light read took {:?}, longer than the {:?} interval", elapsed, period);
                }

                let next = task.interval();
                if next != period {
                    log_info!("sampling interval changed from {:?} to {:?}", period, next);
                    period = next;
                    ticker = new_ticker(period);
                }
            }
        }
    }
}
