//! Filesystem watcher for worker sockets and the configuration tree.
//!
//! Socket files appearing and disappearing drive add confirmation and
//! socket bookkeeping; JSON files changing under the config tree are
//! fanned out to running workers as `SET_*` commands.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moman_core::{Cmd, Command, WorkerKind, SUPERVISOR_SOCKET_NAME};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::connection::request;
use crate::manager::MonitorManager;

/// Repeated editor saves arrive as bursts; delivery for a file is
/// deferred until this long after its last event, then the file is
/// read once so the final write always wins.
const CONFIG_DEBOUNCE: Duration = Duration::from_millis(250);

pub fn spawn_watcher(
    manager: Arc<MonitorManager>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let socket_dir = manager.config().socket_dir.clone();
        let config_dir = manager.config().config_dir.clone();
        for dir in [&socket_dir, &config_dir] {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                error!(event = "watch_dir_create_failed", path = %dir.display(), error = %err);
                return;
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = match notify::recommended_watcher(move |res| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => {
                error!(event = "watch_error", error = %err);
            }
        }) {
            Ok(watcher) => watcher,
            Err(err) => {
                error!(event = "watcher_init_failed", error = %err);
                return;
            }
        };
        for (dir, mode) in [
            (&socket_dir, RecursiveMode::NonRecursive),
            (&config_dir, RecursiveMode::Recursive),
        ] {
            if let Err(err) = watcher.watch(dir, mode) {
                error!(event = "watch_failed", path = %dir.display(), error = %err);
                return;
            }
        }
        debug!(
            event = "watcher_started",
            sockets = %socket_dir.display(),
            configs = %config_dir.display(),
        );

        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        loop {
            let next_due = pending.values().min().copied();
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    handle_event(&manager, &socket_dir, &config_dir, &mut pending, event).await;
                }
                _ = deadline(next_due) => {
                    let now = Instant::now();
                    let due: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, at)| **at <= now)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in due {
                        pending.remove(&path);
                        handle_config_event(&manager, &config_dir, &path).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(event = "watcher_stopped");
    })
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

async fn handle_event(
    manager: &Arc<MonitorManager>,
    socket_dir: &Path,
    config_dir: &Path,
    pending: &mut HashMap<PathBuf, Instant>,
    event: Event,
) {
    for path in &event.paths {
        if path.starts_with(socket_dir) {
            handle_socket_event(manager, &event.kind, path).await;
        } else if path.starts_with(config_dir)
            && matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        {
            // Every new event pushes the deadline out; the file is
            // read once when the burst settles.
            pending.insert(path.clone(), Instant::now() + CONFIG_DEBOUNCE);
        }
    }
}

/// Splits a socket file name into its worker kind and class name.
/// Returns `None` for the supervisor's own socket or anything that
/// does not follow the `<Kind>.<class>` convention.
fn parse_socket_name(name: &str) -> Option<(WorkerKind, &str)> {
    if name == SUPERVISOR_SOCKET_NAME {
        return None;
    }
    for kind in WorkerKind::BOTH {
        if let Some(class_name) = name.strip_prefix(kind.socket_prefix()) {
            if !class_name.is_empty() {
                return Some((kind, class_name));
            }
        }
    }
    None
}

async fn handle_socket_event(manager: &Arc<MonitorManager>, kind: &EventKind, path: &Path) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let Some((worker_kind, class_name)) = parse_socket_name(name) else {
        return;
    };
    match kind {
        EventKind::Create(_) => {
            if !is_socket(path).await {
                return;
            }
            let manager = Arc::clone(manager);
            let class_name = class_name.to_string();
            let path = path.to_path_buf();
            // Probing the socket blocks on the worker, so it must not
            // hold up the event loop.
            tokio::spawn(async move {
                manager
                    .on_socket_created(worker_kind, &class_name, path)
                    .await;
            });
        }
        EventKind::Remove(_) => {
            manager.on_socket_removed(worker_kind, class_name).await;
        }
        _ => {}
    }
}

async fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata.file_type().is_socket(),
        Err(_) => false,
    }
}

/// The `SET_*` opcode a config file maps to, given its directory and
/// file stem. `common/` addresses every worker of both kinds with the
/// whole document; `monitors/` and `scrapers/` address one kind with
/// per-class sub-objects.
fn config_command(subdir: &str, stem: &str) -> Option<(Option<WorkerKind>, Command)> {
    let target = match subdir {
        "common" => None,
        "monitors" => Some(WorkerKind::Monitor),
        "scrapers" => Some(WorkerKind::Scraper),
        _ => return None,
    };
    let command = match (target.is_none(), stem) {
        (true, "configs") => Command::SetCommonConfig,
        (true, "webhooks") => Command::SetCommonWebhooks,
        (true, "blacklists") => Command::SetCommonBlacklist,
        (true, "whitelists") => Command::SetCommonWhitelist,
        (false, "configs") => Command::SetSpecificConfig,
        (false, "webhooks") => Command::SetSpecificWebhooks,
        (false, "blacklists") => Command::SetSpecificBlacklist,
        (false, "whitelists") => Command::SetSpecificWhitelist,
        _ => return None,
    };
    Some((target, command))
}

async fn handle_config_event(manager: &Arc<MonitorManager>, config_dir: &Path, path: &Path) {
    let relative = match path.strip_prefix(config_dir) {
        Ok(relative) => relative,
        Err(_) => return,
    };
    let mut components = relative.components();
    let Some(subdir) = components.next().and_then(|c| c.as_os_str().to_str()) else {
        return;
    };
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return;
    }
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return;
    };
    let Some((target, command)) = config_command(subdir, stem) else {
        return;
    };

    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "config_read_failed", path = %path.display(), error = %err);
            return;
        }
    };
    let doc: Value = match serde_json::from_str(&text) {
        Ok(doc) => doc,
        Err(err) => {
            warn!(event = "config_malformed", path = %path.display(), error = %err);
            return;
        }
    };
    if !doc.is_object() {
        warn!(event = "config_not_an_object", path = %path.display());
        return;
    }
    debug!(event = "config_changed", path = %path.display(), cmd = %command);

    match target {
        // Common documents go to every running worker verbatim.
        None => {
            for kind in WorkerKind::BOTH {
                for (class_name, endpoint) in manager.endpoints(kind).await {
                    deliver(manager, command, class_name, endpoint, doc.clone());
                }
            }
        }
        // Per-kind documents are keyed by class; only classes with a
        // running worker receive their slice.
        Some(kind) => {
            let entries = doc.as_object().cloned().unwrap_or_default();
            for (class_name, endpoint) in manager.endpoints(kind).await {
                if let Some(slice) = entries.get(&class_name) {
                    deliver(manager, command, class_name, endpoint, slice.clone());
                }
            }
        }
    }
}

/// Fire-and-forget delivery of one config update to one worker.
fn deliver(
    manager: &Arc<MonitorManager>,
    command: Command,
    class_name: String,
    endpoint: PathBuf,
    payload: Value,
) {
    let timeout = manager.config().worker_timeout;
    tokio::spawn(async move {
        let cmd = Cmd::with_payload(command, payload);
        match request(&endpoint, &cmd, timeout).await {
            Ok(resp) if resp.is_ok() => {
                debug!(event = "config_delivered", class = %class_name, cmd = %command);
            }
            Ok(resp) => {
                warn!(
                    event = "config_rejected",
                    class = %class_name,
                    cmd = %command,
                    error = resp.error,
                    info = resp.info.as_deref().unwrap_or(""),
                );
            }
            Err(err) => {
                warn!(
                    event = "config_delivery_failed",
                    class = %class_name,
                    cmd = %command,
                    error = %err,
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_names_follow_the_kind_prefix() {
        assert_eq!(
            parse_socket_name("Monitor.Footsites"),
            Some((WorkerKind::Monitor, "Footsites"))
        );
        assert_eq!(
            parse_socket_name("Scraper.Footsites"),
            Some((WorkerKind::Scraper, "Footsites"))
        );
        assert_eq!(parse_socket_name("MonitorManager"), None);
        assert_eq!(parse_socket_name("Monitor."), None);
        assert_eq!(parse_socket_name("random-file"), None);
    }

    #[test]
    fn config_paths_map_to_opcodes() {
        assert_eq!(
            config_command("common", "configs"),
            Some((None, Command::SetCommonConfig))
        );
        assert_eq!(
            config_command("monitors", "whitelists"),
            Some((Some(WorkerKind::Monitor), Command::SetSpecificWhitelist))
        );
        assert_eq!(
            config_command("scrapers", "webhooks"),
            Some((Some(WorkerKind::Scraper), Command::SetSpecificWebhooks))
        );
        assert_eq!(config_command("other", "configs"), None);
        assert_eq!(config_command("common", "notes"), None);
    }
}
