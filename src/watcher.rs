//! Filesystem watcher for the client.
//!
//! Produces `(name, updated|removed)` events for regular files directly
//! contained in the watched directory. On startup every existing regular
//! file is emitted once as `Updated`, so a freshly started server converges
//! from nothing. The notify backend runs on its own blocking thread and is
//! bridged into a bounded tokio queue; a slow transport backpressures all
//! the way into this thread.
//!
//! The watcher is the only source of change signal: an unrecoverable
//! watcher error is fatal for the client.

use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::sync::channel::{self, WatchEvent, WatchKind};

/// Start watching `root` on a dedicated blocking thread. The returned task
/// resolves only on watcher failure or when the event queue is dropped.
pub fn spawn(root: impl AsRef<Path>) -> (mpsc::Receiver<WatchEvent>, JoinHandle<Result<()>>) {
    let root = root.as_ref().to_path_buf();
    let (tx, rx) = channel::event_queue();
    let handle = tokio::task::spawn_blocking(move || watch_blocking(&root, tx));
    (rx, handle)
}

fn watch_blocking(root: &Path, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
    let (notify_tx, notify_rx) = std_mpsc::channel();

    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = notify_tx.send(res);
    })
    .context("failed to create filesystem watcher")?;

    watcher
        .watch(root, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;

    // Bootstrap reseed: every regular file already present counts as
    // updated, before any live event is forwarded.
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("failed to enumerate {}", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to enumerate {}", root.display()))?;
        if let Some(name) = user_file_name(&entry.path()) {
            debug!(file = %name, "seeding existing file");
            if send(&tx, name, WatchKind::Updated).is_err() {
                return Ok(());
            }
        }
    }

    loop {
        // The timeout only exists to notice that the orchestrator hung up.
        if tx.is_closed() {
            return Ok(());
        }
        let event = match notify_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => return Err(e).context("filesystem watcher failed"),
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        };

        for (name, kind) in map_event(&event) {
            debug!(file = %name, ?kind, "watch event");
            if send(&tx, name, kind).is_err() {
                return Ok(());
            }
        }
    }
}

fn send(
    tx: &mpsc::Sender<WatchEvent>,
    name: String,
    kind: WatchKind,
) -> Result<(), mpsc::error::SendError<WatchEvent>> {
    tx.blocking_send(WatchEvent { name, kind })
}

/// Translate one notify event into zero or more watch events. Directories,
/// symlinks, hidden-prefix names and metadata-only changes are dropped.
fn map_event(event: &Event) -> Vec<(String, WatchKind)> {
    // A paired rename is a removal of the old name and an appearance of
    // the new one.
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if event.paths.len() == 2 {
            let mut out = Vec::new();
            if let Some(name) = visible_name(&event.paths[0]) {
                out.push((name, WatchKind::Removed));
            }
            if let Some(name) = user_file_name(&event.paths[1]) {
                out.push((name, WatchKind::Updated));
            }
            return out;
        }
    }

    let kind = match event.kind {
        EventKind::Create(_) => WatchKind::Updated,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
            WatchKind::Updated
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => WatchKind::Removed,
        EventKind::Modify(ModifyKind::Name(_)) => WatchKind::Updated,
        EventKind::Remove(_) => WatchKind::Removed,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter_map(|path| match kind {
            WatchKind::Updated => user_file_name(path),
            // The path is already gone; all we can check is the name.
            WatchKind::Removed => visible_name(path),
        })
        .map(|name| (name, kind))
        .collect()
}

/// The flat name of a path, if it is a visible (non-hidden) entry.
fn visible_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    Some(name.to_string())
}

/// The flat name of a path, if it currently is a visible regular file.
/// `symlink_metadata` keeps symlinks from masquerading as their targets.
fn user_file_name(path: &Path) -> Option<String> {
    let name = visible_name(path)?;
    let meta = std::fs::symlink_metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::Receiver<WatchEvent>) -> WatchEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for watch event")
            .expect("event queue closed")
    }

    #[tokio::test]
    async fn seeds_existing_regular_files_only() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), b"seed").unwrap();
        fs::write(tmp.path().join(".hidden"), b"no").unwrap();
        fs::create_dir(tmp.path().join("subdir")).unwrap();

        let (mut rx, _task) = spawn(tmp.path());

        let event = next_event(&mut rx).await;
        assert_eq!(
            event,
            WatchEvent {
                name: "a.txt".to_string(),
                kind: WatchKind::Updated,
            }
        );
    }

    #[tokio::test]
    async fn reports_creation_and_removal() {
        let tmp = TempDir::new().unwrap();
        let (mut rx, _task) = spawn(tmp.path());

        fs::write(tmp.path().join("b.txt"), b"fresh").unwrap();
        loop {
            let event = next_event(&mut rx).await;
            assert_eq!(event.name, "b.txt");
            if event.kind == WatchKind::Updated {
                break;
            }
        }

        fs::remove_file(tmp.path().join("b.txt")).unwrap();
        loop {
            let event = next_event(&mut rx).await;
            if event.kind == WatchKind::Removed {
                assert_eq!(event.name, "b.txt");
                break;
            }
        }
    }

    #[test]
    fn rename_maps_to_removal_plus_update() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("new.txt"), b"x").unwrap();

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(tmp.path().join("old.txt"))
            .add_path(tmp.path().join("new.txt"));

        let mapped = map_event(&event);
        assert_eq!(
            mapped,
            vec![
                ("old.txt".to_string(), WatchKind::Removed),
                ("new.txt".to_string(), WatchKind::Updated),
            ]
        );
    }

    #[test]
    fn metadata_only_events_are_ignored() {
        let event = Event::new(EventKind::Modify(ModifyKind::Metadata(
            notify::event::MetadataKind::Permissions,
        )))
        .add_path("/watched/a.txt".into());
        assert!(map_event(&event).is_empty());
    }
}
