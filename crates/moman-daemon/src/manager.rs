//! The supervisor itself: worker tables, lifecycle handlers and the
//! exit reaper.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::FutureExt;
use moman_core::{Cmd, Command, ErrorCode, Response, WorkerKind};
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex, Notify, OnceCell};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::request;
use crate::process::{find_python, WorkerProcess};
use crate::registry::Registry;
use crate::server::{Handler, HandlerMap};

/// Book-keeping for one worker class. An entry exists while the class
/// has a live process, a published socket, or an operation in flight;
/// it is removed once both process and endpoint are gone.
#[derive(Default)]
struct WorkerEntry {
    process: Option<WorkerProcess>,
    endpoint: Option<PathBuf>,
    is_being_added: bool,
    is_being_stopped: bool,
    confirm_added: bool,
    confirm_signal: Option<Arc<Notify>>,
}

#[derive(Default)]
struct Tables {
    monitors: HashMap<String, WorkerEntry>,
    scrapers: HashMap<String, WorkerEntry>,
}

impl Tables {
    fn table_mut(&mut self, kind: WorkerKind) -> &mut HashMap<String, WorkerEntry> {
        match kind {
            WorkerKind::Monitor => &mut self.monitors,
            WorkerKind::Scraper => &mut self.scrapers,
        }
    }

    /// Drops the entry once it holds neither a process nor a socket.
    /// An entry with an add or stop in flight is never pruned; the
    /// operation re-prunes when it clears its flag.
    fn prune(&mut self, kind: WorkerKind, class_name: &str) {
        let table = self.table_mut(kind);
        if let Some(entry) = table.get(class_name) {
            if entry.process.is_none()
                && entry.endpoint.is_none()
                && !entry.is_being_added
                && !entry.is_being_stopped
            {
                table.remove(class_name);
            }
        }
    }
}

pub struct MonitorManager {
    config: Config,
    registry: Registry,
    tables: Mutex<Tables>,
    python: OnceCell<Option<PathBuf>>,
    shutdown: watch::Sender<bool>,
}

impl MonitorManager {
    pub fn new(config: Config) -> Arc<Self> {
        let registry = Registry::new(&config.registry_path);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry,
            tables: Mutex::new(Tables::default()),
            python: OnceCell::new(),
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    async fn interpreter(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config.interpreter {
            return Some(path.clone());
        }
        self.python.get_or_init(find_python).await.clone()
    }

    fn require_name(cmd: &Cmd) -> Result<String, Response> {
        let payload = match &cmd.payload {
            Some(payload) => payload,
            None => return Err(Response::from_error(ErrorCode::MissingPayload)),
        };
        match payload.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(Response::bad(
                ErrorCode::MissingPayloadArgs,
                "Missing payload arg: \"name\".",
            )),
        }
    }

    fn payload_args(cmd: &Cmd) -> Vec<String> {
        cmd.payload
            .as_ref()
            .and_then(|p| p.get("args"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn on_ping(&self, _cmd: Cmd) -> Response {
        Response::ok().with_info("Pong")
    }

    /// Launches a worker and waits for it to publish a responsive
    /// socket within the confirmation window. Three things can resolve
    /// the wait: the watcher verifying the socket, the process dying,
    /// or the window elapsing.
    pub async fn on_add(&self, kind: WorkerKind, cmd: Cmd) -> Response {
        let class_name = match Self::require_name(&cmd) {
            Ok(name) => name,
            Err(resp) => return resp,
        };
        let args = Self::payload_args(&cmd);

        // Reserve the entry so a concurrent add or stop of the same
        // class is turned away while this one is in flight.
        let signal = Arc::new(Notify::new());
        {
            let mut tables = self.tables.lock().await;
            let table = tables.table_mut(kind);
            if let Some(entry) = table.get(&class_name) {
                if entry.is_being_added {
                    return Response::bad(
                        kind.add_error(),
                        format!("{} still being processed.", kind.label()),
                    );
                }
                if entry.process.is_some() {
                    return Response::bad(
                        kind.add_error(),
                        format!("{} already started.", kind.label()),
                    );
                }
                if entry.is_being_stopped {
                    return Response::bad(
                        kind.add_error(),
                        format!("{} is being stopped.", kind.label()),
                    );
                }
            }
            let entry = table.entry(class_name.clone()).or_default();
            entry.is_being_added = true;
            entry.confirm_added = false;
            entry.confirm_signal = Some(Arc::clone(&signal));
        }

        let interpreter = match self.interpreter().await {
            Some(path) => path,
            None => {
                self.abandon_add(kind, &class_name).await;
                return Response::bad(
                    kind.add_error(),
                    "Could not find a correct python version.",
                );
            }
        };

        let registered = match self.registry.lookup(kind, &class_name).await {
            Ok(Some(registered)) => registered,
            Ok(None) => {
                self.abandon_add(kind, &class_name).await;
                return Response::from_error(kind.not_registered_error());
            }
            Err(err) => {
                self.abandon_add(kind, &class_name).await;
                return Response::bad(kind.add_error(), err.to_string());
            }
        };

        let process = match WorkerProcess::spawn(&interpreter, &registered.path, &class_name, &args)
        {
            Ok(process) => process,
            Err(err) => {
                self.abandon_add(kind, &class_name).await;
                return Response::bad(kind.add_error(), err.to_string());
            }
        };
        info!(
            event = "worker_starting",
            kind = kind.label(),
            class = %class_name,
            pid = process.pid,
        );
        {
            let mut tables = self.tables.lock().await;
            let entry = tables.table_mut(kind).entry(class_name.clone()).or_default();
            entry.process = Some(process);
        }

        // The notify permit is stored if the watcher confirms before
        // this wait begins, so the race with a fast worker is safe.
        let confirmed = tokio::time::timeout(self.config.add_confirm_window, signal.notified())
            .await
            .is_ok();

        let mut tables = self.tables.lock().await;
        let entry = match tables.table_mut(kind).get_mut(&class_name) {
            Some(entry) => entry,
            None => {
                return Response::bad(
                    kind.add_error(),
                    format!("{} vanished while being added.", kind.label()),
                )
            }
        };
        entry.is_being_added = false;
        entry.confirm_signal = None;

        if confirmed && entry.confirm_added {
            info!(event = "worker_added", kind = kind.label(), class = %class_name);
            return Response::ok();
        }

        match entry.process.as_mut().map(WorkerProcess::try_exit_code) {
            Some(Ok(Some(code))) => {
                entry.process = None;
                tables.prune(kind, &class_name);
                Response::bad(
                    kind.add_error(),
                    format!("Process exited too soon. Exit code: {}.", code.unwrap_or(-1)),
                )
            }
            _ => {
                // The process is alive but never produced a responsive
                // socket. Report failure and leave it running; a later
                // socket will be absorbed by the watcher.
                warn!(
                    event = "add_unconfirmed",
                    kind = kind.label(),
                    class = %class_name,
                );
                Response::bad(
                    kind.add_error(),
                    format!(
                        "{} started but never opened a responsive socket.",
                        kind.label()
                    ),
                )
            }
        }
    }

    /// Rolls back an add reservation that failed before spawning.
    async fn abandon_add(&self, kind: WorkerKind, class_name: &str) {
        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables.table_mut(kind).get_mut(class_name) {
            entry.is_being_added = false;
            entry.confirm_signal = None;
        }
        tables.prune(kind, class_name);
    }

    /// Asks a worker to stop over its own socket and relays its reply.
    /// The stored socket is forgotten either way; the reaper collects
    /// the process once it exits.
    pub async fn on_stop(&self, kind: WorkerKind, cmd: Cmd) -> Response {
        let class_name = match Self::require_name(&cmd) {
            Ok(name) => name,
            Err(resp) => return resp,
        };

        let endpoint = {
            let mut tables = self.tables.lock().await;
            let entry = match tables.table_mut(kind).get_mut(&class_name) {
                Some(entry) => entry,
                None => {
                    return Response::bad(
                        ErrorCode::SocketDoesntExist,
                        format!(
                            "{} {} not present in available sockets.",
                            kind.label(),
                            class_name
                        ),
                    )
                }
            };
            if entry.is_being_added {
                return Response::bad(
                    kind.stop_error(),
                    format!("{} still being processed.", kind.label()),
                );
            }
            if entry.is_being_stopped {
                return Response::bad(
                    kind.stop_error(),
                    format!("{} {} is already being stopped.", kind.label(), class_name),
                );
            }
            let endpoint = match &entry.endpoint {
                Some(endpoint) => endpoint.clone(),
                None => {
                    return Response::bad(
                        ErrorCode::SocketDoesntExist,
                        format!(
                            "{} {} not present in available sockets.",
                            kind.label(),
                            class_name
                        ),
                    )
                }
            };
            entry.is_being_stopped = true;
            endpoint
        };

        let result = request(
            &endpoint,
            &Cmd::new(Command::Stop),
            self.config.worker_timeout,
        )
        .await;

        let response = match result {
            Ok(worker_reply) => {
                info!(event = "worker_stopping", kind = kind.label(), class = %class_name);
                worker_reply
            }
            Err(err) => Response::bad(
                kind.stop_error(),
                format!("Failed to send the STOP command: {err}"),
            ),
        };

        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables.table_mut(kind).get_mut(&class_name) {
            entry.endpoint = None;
            entry.is_being_stopped = false;
        }
        tables.prune(kind, &class_name);
        response
    }

    pub async fn on_get_status(&self, kind: WorkerKind, _cmd: Cmd) -> Response {
        let mut tables = self.tables.lock().await;
        let table = tables.table_mut(kind);
        let mut processes = Map::new();
        let mut sockets = Map::new();
        for (class_name, entry) in table.iter() {
            if let Some(process) = &entry.process {
                processes.insert(class_name.clone(), process.status_json());
            }
            if let Some(endpoint) = &entry.endpoint {
                sockets.insert(
                    class_name.clone(),
                    Value::String(endpoint.display().to_string()),
                );
            }
        }
        Response::ok().with_payload(json!({
            "monitored_processes": processes,
            "monitored_sockets": sockets,
        }))
    }

    pub async fn on_add_pair(self: &Arc<Self>, cmd: Cmd) -> Response {
        let (first, second) = tokio::join!(
            self.on_add(WorkerKind::Monitor, cmd.clone()),
            self.on_add(WorkerKind::Scraper, cmd),
        );
        merge_responses(&first, &second, ErrorCode::MmCouldntAddMonitorScraper)
    }

    pub async fn on_stop_pair(self: &Arc<Self>, cmd: Cmd) -> Response {
        let (first, second) = tokio::join!(
            self.on_stop(WorkerKind::Monitor, cmd.clone()),
            self.on_stop(WorkerKind::Scraper, cmd),
        );
        merge_responses(&first, &second, ErrorCode::MmCouldntStopMonitorScraper)
    }

    pub async fn on_get_status_pair(self: &Arc<Self>, cmd: Cmd) -> Response {
        let (first, second) = tokio::join!(
            self.on_get_status(WorkerKind::Monitor, cmd.clone()),
            self.on_get_status(WorkerKind::Scraper, cmd),
        );
        let payload = json!({
            "monitors": first.payload.clone().unwrap_or_else(|| json!({})),
            "scrapers": second.payload.clone().unwrap_or_else(|| json!({})),
        });
        merge_responses(&first, &second, ErrorCode::OtherError).with_payload(payload)
    }

    /// Kills every tracked worker and flips the shutdown channel. The
    /// caller's reply goes out while teardown completes.
    pub async fn on_shutdown(&self, _cmd: Cmd) -> Response {
        info!(event = "supervisor_stopping");
        let mut tables = self.tables.lock().await;
        {
            // Reborrow so the per-kind borrows split across fields.
            let tables = &mut *tables;
            for (kind, table) in [
                (WorkerKind::Monitor, &mut tables.monitors),
                (WorkerKind::Scraper, &mut tables.scrapers),
            ] {
                for (class_name, entry) in table.iter_mut() {
                    if let Some(process) = entry.process.as_mut() {
                        if let Err(err) = process.kill() {
                            warn!(
                                event = "worker_kill_failed",
                                kind = kind.label(),
                                class = %class_name,
                                error = %err,
                            );
                        }
                    }
                }
            }
        }
        drop(tables);
        let _ = self.shutdown.send(true);
        Response::ok()
    }

    /// Records a socket that appeared in the socket directory. During
    /// a pending add the socket is probed with PING before the add is
    /// confirmed; unsolicited sockets are recorded as-is.
    pub async fn on_socket_created(&self, kind: WorkerKind, class_name: &str, path: PathBuf) {
        let pending = {
            let mut tables = self.tables.lock().await;
            let entry = tables
                .table_mut(kind)
                .entry(class_name.to_string())
                .or_default();
            entry.endpoint = Some(path.clone());
            entry.is_being_added && !entry.confirm_added
        };
        debug!(event = "socket_appeared", kind = kind.label(), class = class_name);
        if !pending {
            return;
        }

        let alive = request(&path, &Cmd::new(Command::Ping), self.config.worker_timeout)
            .await
            .map(|resp| resp.is_ok())
            .unwrap_or(false);
        if !alive {
            warn!(
                event = "socket_unresponsive",
                kind = kind.label(),
                class = class_name,
            );
            return;
        }

        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables.table_mut(kind).get_mut(class_name) {
            if entry.is_being_added {
                entry.confirm_added = true;
                if let Some(signal) = &entry.confirm_signal {
                    signal.notify_one();
                }
            }
        }
    }

    pub async fn on_socket_removed(&self, kind: WorkerKind, class_name: &str) {
        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables.table_mut(kind).get_mut(class_name) {
            entry.endpoint = None;
        }
        tables.prune(kind, class_name);
        debug!(event = "socket_vanished", kind = kind.label(), class = class_name);
    }

    /// Published sockets for one kind, for the config fan-out.
    pub async fn endpoints(&self, kind: WorkerKind) -> Vec<(String, PathBuf)> {
        let mut tables = self.tables.lock().await;
        tables
            .table_mut(kind)
            .iter()
            .filter_map(|(name, entry)| {
                entry
                    .endpoint
                    .as_ref()
                    .map(|endpoint| (name.clone(), endpoint.clone()))
            })
            .collect()
    }

    /// Periodic scan for workers that died without being stopped.
    /// Entries in the middle of an add are skipped so the add's own
    /// resolution can report the exit code.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown = manager.subscribe_shutdown();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.reap_once().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn reap_once(&self) {
        let mut tables = self.tables.lock().await;
        let tables = &mut *tables;
        for (kind, table) in [
            (WorkerKind::Monitor, &mut tables.monitors),
            (WorkerKind::Scraper, &mut tables.scrapers),
        ] {
            let mut dead = Vec::new();
            for (class_name, entry) in table.iter_mut() {
                if entry.is_being_added {
                    continue;
                }
                let exited = entry
                    .process
                    .as_mut()
                    .and_then(|p| p.try_exit_code().ok().flatten());
                if let Some(code) = exited {
                    if code == Some(0) {
                        info!(
                            event = "worker_exited",
                            kind = kind.label(),
                            class = %class_name,
                        );
                    } else {
                        warn!(
                            event = "worker_exited",
                            kind = kind.label(),
                            class = %class_name,
                            code = code.unwrap_or(-1),
                        );
                    }
                    entry.process = None;
                    if entry.endpoint.is_none() {
                        dead.push(class_name.clone());
                    }
                }
            }
            for class_name in dead {
                table.remove(&class_name);
            }
        }
    }

    /// The full opcode table the command server dispatches over.
    pub fn handlers(self: &Arc<Self>) -> HandlerMap {
        let mut map = HandlerMap::default();
        map.insert(
            Command::Ping,
            handler(self, |m, cmd| async move { m.on_ping(cmd).await }),
        );
        map.insert(
            Command::MmAddMonitor,
            handler(self, |m, cmd| async move {
                m.on_add(WorkerKind::Monitor, cmd).await
            }),
        );
        map.insert(
            Command::MmAddScraper,
            handler(self, |m, cmd| async move {
                m.on_add(WorkerKind::Scraper, cmd).await
            }),
        );
        map.insert(
            Command::MmAddMonitorScraper,
            handler(self, |m, cmd| async move { m.on_add_pair(cmd).await }),
        );
        map.insert(
            Command::MmStopMonitor,
            handler(self, |m, cmd| async move {
                m.on_stop(WorkerKind::Monitor, cmd).await
            }),
        );
        map.insert(
            Command::MmStopScraper,
            handler(self, |m, cmd| async move {
                m.on_stop(WorkerKind::Scraper, cmd).await
            }),
        );
        map.insert(
            Command::MmStopMonitorScraper,
            handler(self, |m, cmd| async move { m.on_stop_pair(cmd).await }),
        );
        map.insert(
            Command::MmGetMonitorStatus,
            handler(self, |m, cmd| async move {
                m.on_get_status(WorkerKind::Monitor, cmd).await
            }),
        );
        map.insert(
            Command::MmGetScraperStatus,
            handler(self, |m, cmd| async move {
                m.on_get_status(WorkerKind::Scraper, cmd).await
            }),
        );
        map.insert(
            Command::MmGetMonitorScraperStatus,
            handler(self, |m, cmd| async move { m.on_get_status_pair(cmd).await }),
        );
        map.insert(
            Command::MmStopMonitorManager,
            handler(self, |m, cmd| async move { m.on_shutdown(cmd).await }),
        );
        map
    }
}

fn handler<F, Fut>(manager: &Arc<MonitorManager>, f: F) -> Handler
where
    F: Fn(Arc<MonitorManager>, Cmd) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let manager = Arc::clone(manager);
    Arc::new(move |cmd| f(Arc::clone(&manager), cmd).boxed())
}

/// Collapses the two halves of a paired operation into one reply.
/// Any failing side contributes its error name (and info, if any) to
/// the combined `info`.
fn merge_responses(first: &Response, second: &Response, combined: ErrorCode) -> Response {
    if first.is_ok() && second.is_ok() {
        return Response::ok();
    }
    let mut info = String::new();
    for side in [first, second] {
        if !side.is_ok() {
            info.push_str(&ErrorCode::name_of(side.error));
            match &side.info {
                Some(text) if !text.is_empty() => {
                    info.push_str(": ");
                    info.push_str(text);
                    info.push(' ');
                }
                _ => info.push_str("; "),
            }
        }
    }
    Response::bad(combined, info)
}
