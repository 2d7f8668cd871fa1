//! Purpose: Keep per-channel pending flags with a time-to-live in a shared store.
//! Exports: `FlagStore`, `FileFlagStore`, `MemoryFlagStore`, `FLAG_FILE_SUFFIX`.
//! Role: Backing state for the notifier; the file store is shared by every process on a host.
//! Invariants: An expired flag reads as absent; expiry always wins over presence.
//! Invariants: `take` is the only get-and-clear path and is atomic per store.
//! Invariants: Store failures surface as errors and are never retried here.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::channel::validate_channel;
use crate::core::error::{Error, ErrorKind};

pub const FLAG_FILE_SUFFIX: &str = ".flag";

const MAGIC: [u8; 4] = *b"PFLG";
const VERSION: u32 = 1;
const RECORD_SIZE: usize = 16;
const MAX_MEMORY_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub trait FlagStore: Send + Sync {
    /// Reports whether an unexpired flag is set, without clearing it.
    fn get(&self, channel: &str) -> Result<bool, Error>;

    /// Sets the flag so that it expires `ttl` from now, replacing any previous expiry.
    fn set_with_ttl(&self, channel: &str, ttl: Duration) -> Result<(), Error>;

    fn delete(&self, channel: &str) -> Result<(), Error>;

    /// Atomically reads and clears the flag. Returns true only for an unexpired flag.
    fn take(&self, channel: &str) -> Result<bool, Error>;
}

/// Directory of fixed-size flag records guarded by advisory file locks.
#[derive(Clone, Debug)]
pub struct FileFlagStore {
    dir: PathBuf,
}

impl FileFlagStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, channel: &str) -> Result<PathBuf, Error> {
        validate_channel(channel)?;
        Ok(self.dir.join(format!("{channel}{FLAG_FILE_SUFFIX}")))
    }

    fn open_existing(&self, channel: &str) -> Result<Option<(File, PathBuf)>, Error> {
        let path = self.record_path(channel)?;
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Ok(Some((file, path))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::new(io_error_kind(&err))
                .with_message("failed to open flag record")
                .with_channel(channel)
                .with_path(&path)
                .with_source(err)),
        }
    }

    fn open_or_create(&self, channel: &str) -> Result<(File, PathBuf), Error> {
        let path = self.record_path(channel)?;
        std::fs::create_dir_all(&self.dir).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to create flag store directory")
                .with_path(&self.dir)
                .with_source(err)
        })?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                Error::new(io_error_kind(&err))
                    .with_message("failed to open flag record")
                    .with_channel(channel)
                    .with_path(&path)
                    .with_source(err)
            })?;
        Ok((file, path))
    }
}

impl FlagStore for FileFlagStore {
    fn get(&self, channel: &str) -> Result<bool, Error> {
        let Some((file, path)) = self.open_existing(channel)? else {
            return Ok(false);
        };
        let _lock = RecordLock::shared(&file, &path)?;
        let expires_at = read_record(&file, &path)?;
        Ok(expires_at > now_unix_ns())
    }

    fn set_with_ttl(&self, channel: &str, ttl: Duration) -> Result<(), Error> {
        let (file, path) = self.open_or_create(channel)?;
        let _lock = RecordLock::exclusive(&file, &path)?;
        let expires_at = now_unix_ns().saturating_add(duration_ns(ttl));
        write_record(&file, &path, expires_at)
    }

    fn delete(&self, channel: &str) -> Result<(), Error> {
        let Some((file, path)) = self.open_existing(channel)? else {
            return Ok(());
        };
        let _lock = RecordLock::exclusive(&file, &path)?;
        write_record(&file, &path, 0)
    }

    fn take(&self, channel: &str) -> Result<bool, Error> {
        let Some((file, path)) = self.open_existing(channel)? else {
            return Ok(false);
        };
        let _lock = RecordLock::exclusive(&file, &path)?;
        let expires_at = read_record(&file, &path)?;
        if expires_at == 0 {
            return Ok(false);
        }
        write_record(&file, &path, 0)?;
        Ok(expires_at > now_unix_ns())
    }
}

struct RecordLock<'a> {
    file: &'a File,
}

impl<'a> RecordLock<'a> {
    fn shared(file: &'a File, path: &Path) -> Result<Self, Error> {
        file.lock_shared().map_err(|err| lock_error(err, path))?;
        Ok(Self { file })
    }

    fn exclusive(file: &'a File, path: &Path) -> Result<Self, Error> {
        file.lock_exclusive().map_err(|err| lock_error(err, path))?;
        Ok(Self { file })
    }
}

impl Drop for RecordLock<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_error(err: io::Error, path: &Path) -> Error {
    Error::new(io_error_kind(&err))
        .with_message("failed to lock flag record")
        .with_path(path)
        .with_source(err)
}

fn io_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

// A zero-length record is a file created by a writer that has not written yet.
fn read_record(mut file: &File, path: &Path) -> Result<u64, Error> {
    let mut buf = Vec::with_capacity(RECORD_SIZE);
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut buf))
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read flag record")
                .with_path(path)
                .with_source(err)
        })?;
    if buf.is_empty() {
        return Ok(0);
    }
    decode_record(&buf).map_err(|err| err.with_path(path))
}

fn write_record(mut file: &File, path: &Path, expires_at: u64) -> Result<(), Error> {
    let buf = encode_record(expires_at);
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.write_all(&buf))
        .and_then(|_| file.set_len(RECORD_SIZE as u64))
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write flag record")
                .with_path(path)
                .with_source(err)
        })
}

fn encode_record(expires_at: u64) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    buf[0..4].copy_from_slice(&MAGIC);
    buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&expires_at.to_le_bytes());
    buf
}

fn decode_record(buf: &[u8]) -> Result<u64, Error> {
    if buf.len() != RECORD_SIZE {
        return Err(Error::new(ErrorKind::Corrupt).with_message("flag record has wrong length"));
    }
    if buf[0..4] != MAGIC {
        return Err(Error::new(ErrorKind::Corrupt).with_message("bad flag record magic"));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&buf[4..8]);
    if u32::from_le_bytes(version) != VERSION {
        return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported flag record version"));
    }
    let mut expires_at = [0u8; 8];
    expires_at.copy_from_slice(&buf[8..16]);
    Ok(u64::from_le_bytes(expires_at))
}

fn now_unix_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_ns)
        .unwrap_or_default()
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// In-process store. Flags are invisible to other processes, so use it only for
/// single-process embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    flags: Mutex<HashMap<String, Instant>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_flags<T>(&self, f: impl FnOnce(&mut HashMap<String, Instant>) -> T) -> Result<T, Error> {
        let mut guard = self
            .flags
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("flag store lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

impl FlagStore for MemoryFlagStore {
    fn get(&self, channel: &str) -> Result<bool, Error> {
        let now = Instant::now();
        self.with_flags(|flags| flags.get(channel).is_some_and(|expires| *expires > now))
    }

    fn set_with_ttl(&self, channel: &str, ttl: Duration) -> Result<(), Error> {
        let now = Instant::now();
        self.with_flags(|flags| {
            flags.insert(channel.to_string(), now + ttl.min(MAX_MEMORY_TTL));
        })
    }

    fn delete(&self, channel: &str) -> Result<(), Error> {
        self.with_flags(|flags| {
            flags.remove(channel);
        })
    }

    fn take(&self, channel: &str) -> Result<bool, Error> {
        let now = Instant::now();
        self.with_flags(|flags| {
            flags
                .remove(channel)
                .is_some_and(|expires| expires > now)
        })
    }
}
