//! Purpose: Shared library crate used by the `pollflag` CLI, server, and tests.
//! Exports: `core` (flag stores, notifier, errors), `api` (public surface + remote client), `notice`.
//! Role: Library backing the binary; embedders should prefer the `api` module.
//! Invariants: Pending flags live in a `FlagStore`, never in process-wide variables.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod notice;
