//! Purpose: Drive the repeated long-poll loop behind `pollflag watch`.
//! Exports: `WatchConfig`, `WatchEvent`, `WatchSummary`, `watch_loop`.
//! Role: Keep loop policy (retry delay, check budget) separate from HTTP and output.
//! Invariants: A failed check never ends the loop; it is reported and followed by a delay.
//! Invariants: A check that times out is followed immediately by the next check.
//! Invariants: With `max_checks = Some(n)` exactly `n` checks are attempted.
//! Invariants: The loop only returns when a check budget is set; the caller reports the summary.
use std::time::Duration;

use pollflag::api::Error;

#[derive(Clone, Copy, Debug)]
pub(super) struct WatchConfig {
    pub(super) max_checks: Option<u64>,
    pub(super) retry_delay: Duration,
}

#[derive(Debug)]
pub(super) enum WatchEvent {
    NewOrders,
    CheckFailed(Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct WatchSummary {
    pub(super) checks: u64,
    pub(super) notifications: u64,
    pub(super) failures: u64,
}

pub(super) fn watch_loop<C, E, P>(
    config: WatchConfig,
    mut check: C,
    mut emit: E,
    mut pause: P,
) -> WatchSummary
where
    C: FnMut() -> Result<bool, Error>,
    E: FnMut(WatchEvent),
    P: FnMut(Duration),
{
    let mut summary = WatchSummary::default();
    loop {
        if let Some(max) = config.max_checks {
            if summary.checks >= max {
                return summary;
            }
        }
        summary.checks += 1;
        match check() {
            Ok(true) => {
                summary.notifications += 1;
                emit(WatchEvent::NewOrders);
            }
            Ok(false) => {}
            Err(err) => {
                summary.failures += 1;
                emit(WatchEvent::CheckFailed(err));
                pause(config.retry_delay);
            }
        }
    }
}
