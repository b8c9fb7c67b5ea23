//! Lock-file lifecycle.
//!
//! The sentinel at `<temp-dir>/.lock` signals "ready to accept traffic" to an
//! exec-style health probe: a sibling invocation of the watchdog binary with
//! `--run-healthcheck` exits 0 iff the file is present. Contents are
//! insignificant; only existence matters.

use crate::health::ReadyState;
use std::io;
use std::path::PathBuf;

/// Path of the sentinel file.
pub fn path() -> PathBuf {
    std::env::temp_dir().join(".lock")
}

/// Write the sentinel and flip the ready state. Returns the path written so
/// callers can log it.
pub fn create(ready: &ReadyState) -> io::Result<PathBuf> {
    let path = path();
    std::fs::write(&path, b"")?;
    ready.mark_ready();
    Ok(path)
}

/// True iff the sentinel exists.
pub fn present() -> bool {
    path().exists()
}

/// Remove the sentinel. Not finding it is not an error.
pub fn remove() -> io::Result<()> {
    match std::fs::remove_file(path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
