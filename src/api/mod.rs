//! Purpose: Define the public Rust API boundary for pollflag.
//! Exports: Notifier, flag stores, wait types, errors, and the HTTP `RemoteClient`.
//! Role: Additive-only surface used by the CLI, the server, and embedders.
//! Invariants: This module is the supported path to core types.

mod remote;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::channel::{NEW_ORDER_CHANNEL, validate_channel};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::notifier::{
    DEFAULT_FLAG_TTL, DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT, Notifier, WaitOptions,
    WaitOutcome,
};
pub use crate::core::store::{FileFlagStore, FlagStore, MemoryFlagStore};
pub use remote::RemoteClient;
