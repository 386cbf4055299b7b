//! Unlink-on-drop guard for temp sinks.

use std::path::PathBuf;

/// Removes the guarded path on drop unless defused.
///
/// A failed receive can abandon a half-written temp sink; the guard keeps
/// the synchronized directory free of stale `.tmp.` files on every exit
/// path. Call [`defuse`](TempFileGuard::defuse) once the file has been
/// renamed into place or removed deliberately.
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
