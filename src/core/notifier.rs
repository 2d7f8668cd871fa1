//! Purpose: Bounded long-poll notifications over a shared pending flag.
//! Exports: `Notifier`, `WaitOptions`, `WaitOutcome`, default timing constants.
//! Role: Producer `signal` and consumer `await_signal` on top of any `FlagStore`.
//! Invariants: Check-then-sleep; a wait returns within `timeout + interval`.
//! Invariants: Clear-on-read; one signal is consumed by at most one waiter.
//! Invariants: Suspension only happens at the timer step and never blocks a thread.
//! Notes: Signals are collapsed, not counted; a burst within one TTL is one notification.

use std::sync::Arc;
use std::time::Duration;

use crate::core::channel::validate_channel;
use crate::core::error::{Error, ErrorKind};
use crate::core::store::FlagStore;

pub const DEFAULT_FLAG_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

impl WaitOutcome {
    pub fn is_signaled(self) -> bool {
        matches!(self, WaitOutcome::Signaled)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitOptions {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn from_secs(timeout_secs: u64, interval_secs: u64) -> Self {
        Self::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(interval_secs),
        )
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.timeout.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("wait timeout must be greater than zero")
                .with_hint("Use a positive timeout like 15 seconds."));
        }
        if self.interval.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("poll interval must be greater than zero")
                .with_hint("Use a positive interval like 1 second."));
        }
        Ok(())
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

// Elapsed time advances by whole intervals, not by wall clock.
struct PollSession {
    elapsed: Duration,
    interval: Duration,
    timeout: Duration,
    polls: u32,
}

impl PollSession {
    fn new(options: WaitOptions) -> Self {
        Self {
            elapsed: Duration::ZERO,
            interval: options.interval,
            timeout: options.timeout,
            polls: 0,
        }
    }

    fn active(&self) -> bool {
        self.elapsed < self.timeout
    }

    fn record_poll(&mut self) {
        self.polls += 1;
    }

    fn advance(&mut self) {
        self.elapsed = self.elapsed.saturating_add(self.interval);
    }
}

#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn FlagStore>,
    ttl: Duration,
}

impl Notifier {
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_FLAG_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Marks `channel` as pending, renewing the expiry if it is already set.
    pub fn signal(&self, channel: &str) -> Result<(), Error> {
        validate_channel(channel)?;
        if self.ttl.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("flag ttl must be greater than zero")
                .with_channel(channel));
        }
        self.store
            .set_with_ttl(channel, self.ttl)
            .map_err(|err| with_channel(err, channel))?;
        tracing::debug!(channel, ttl_secs = self.ttl.as_secs(), "signal set");
        Ok(())
    }

    /// Waits until `channel` is signaled (consuming the flag) or the timeout elapses.
    ///
    /// Dropping the returned future stops polling at the next timer step. The
    /// get-and-clear itself runs inline, so a dropped wait never swallows a signal.
    pub async fn await_signal(
        &self,
        channel: &str,
        options: WaitOptions,
    ) -> Result<WaitOutcome, Error> {
        validate_channel(channel)?;
        options.validate().map_err(|err| err.with_channel(channel))?;

        let mut session = PollSession::new(options);
        while session.active() {
            session.record_poll();
            if self
                .store
                .take(channel)
                .map_err(|err| with_channel(err, channel))?
            {
                tracing::debug!(channel, polls = session.polls, "signal consumed");
                return Ok(WaitOutcome::Signaled);
            }
            tokio::time::sleep(session.interval).await;
            session.advance();
        }
        tracing::debug!(channel, polls = session.polls, "wait timed out");
        Ok(WaitOutcome::TimedOut)
    }

    /// Reports whether `channel` has an unexpired pending flag, without consuming it.
    pub fn pending(&self, channel: &str) -> Result<bool, Error> {
        validate_channel(channel)?;
        self.store
            .get(channel)
            .map_err(|err| with_channel(err, channel))
    }

    pub fn clear(&self, channel: &str) -> Result<(), Error> {
        validate_channel(channel)?;
        self.store
            .delete(channel)
            .map_err(|err| with_channel(err, channel))
    }
}

fn with_channel(err: Error, channel: &str) -> Error {
    if err.channel().is_some() {
        err
    } else {
        err.with_channel(channel)
    }
}
