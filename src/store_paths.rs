//! Purpose: Local flag-store directory resolution.
//! Exports: `default_store_dir`.
//! Role: Keep the CLI and `pollflag serve` pointed at the same default directory.
//! Invariants: Default store directory remains `~/.pollflag/flags`.

use std::path::PathBuf;

pub(crate) fn default_store_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".pollflag").join("flags")
}
