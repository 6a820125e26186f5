//! Filesystem notifications for the rig's working directory.

use std::{
    path::{Path, PathBuf},
    thread::JoinHandle,
};

use anyhow::Result;
use tokio::sync::mpsc;

/// Watches each of `dirs` (relative to `root`) for finished writes and
/// renames, sending the changed file's path relative to `root`. Directories
/// missing at startup are watched once they are created. The root itself must
/// exist.
///
/// The thread blocks in `read`, so it exits on a read failure or on the first
/// event after the receiving side is dropped.
#[cfg(target_os = "linux")]
pub fn spawn_watch_thread(
    root: &Path,
    dirs: impl IntoIterator<Item = PathBuf>,
    changes: mpsc::UnboundedSender<PathBuf>,
) -> Result<JoinHandle<()>> {
    use anyhow::Context;
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    let watch_mask =
        AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_CREATE;
    let inotify = Inotify::init(InitFlags::IN_CLOEXEC).context("inotify init failed")?;

    let root = root.to_path_buf();
    let root_wd = inotify
        .add_watch(&root, watch_mask)
        .with_context(|| format!("cannot watch {}", root.display()))?;

    let mut watches = vec![(root_wd, PathBuf::new())];
    let mut missing = Vec::new();
    let mut report_root = false;
    for dir in dirs {
        if dir.as_os_str().is_empty() {
            report_root = true;
            continue;
        }
        let absolute = root.join(&dir);
        match inotify.add_watch(&absolute, watch_mask) {
            Ok(wd) => watches.push((wd, dir)),
            Err(err) => {
                log::warn!("{} not watchable yet: {}", absolute.display(), err);
                missing.push(dir);
            }
        }
    }

    let handle = std::thread::Builder::new()
        .name("nsbridge-inotify".into())
        .spawn(move || loop {
            let events = match inotify.read_events() {
                Ok(events) => events,
                Err(err) => {
                    log::error!("inotify read failed: {err}");
                    return;
                }
            };
            for event in events {
                if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                    log::warn!("inotify queue overflow, changes may be lost");
                    continue;
                }
                let Some(name) = event.name else {
                    continue;
                };
                let Some(path) = watches
                    .iter()
                    .find(|(wd, _)| *wd == event.wd)
                    .map(|(_, dir)| dir.join(&name))
                else {
                    continue;
                };

                if event.mask.contains(AddWatchFlags::IN_ISDIR) {
                    let Some(index) = missing.iter().position(|dir| *dir == path) else {
                        continue;
                    };
                    let dir = missing.swap_remove(index);
                    match inotify.add_watch(&root.join(&dir), watch_mask) {
                        Ok(wd) => {
                            log::info!("now watching {}", root.join(&dir).display());
                            watches.push((wd, dir));
                        }
                        Err(err) => {
                            log::warn!("{} not watchable yet: {}", root.join(&dir).display(), err);
                            missing.push(dir);
                        }
                    }
                    continue;
                }
                // A created file is reported when its writer closes it.
                if event.mask.contains(AddWatchFlags::IN_CREATE) {
                    continue;
                }
                if event.wd == root_wd && !report_root {
                    continue;
                }
                if changes.send(path).is_err() {
                    return;
                }
            }
        })
        .context("Failed to spawn inotify thread")?;
    Ok(handle)
}

#[cfg(not(target_os = "linux"))]
pub fn spawn_watch_thread(
    root: &Path,
    _dirs: impl IntoIterator<Item = PathBuf>,
    _changes: mpsc::UnboundedSender<PathBuf>,
) -> Result<JoinHandle<()>> {
    anyhow::bail!(
        "file watching under {} is only available on Linux",
        root.display()
    )
}
