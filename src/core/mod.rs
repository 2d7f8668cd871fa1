// Core modules implementing the pending-flag store, the notifier, and error modeling.
pub mod channel;
pub mod error;
pub mod notifier;
pub mod store;
