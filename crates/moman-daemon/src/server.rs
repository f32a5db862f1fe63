//! Command server: a Unix socket accept loop dispatching requests to
//! registered handlers.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use moman_core::{Cmd, Command, ErrorCode, Response};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;

/// An async command handler. Handlers receive the decoded request and
/// produce the reply; transport concerns stay out of them.
pub type Handler = Arc<dyn Fn(Cmd) -> BoxFuture<'static, Response> + Send + Sync>;

/// How long in-flight connections get to finish after shutdown flips.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Opcode to handler table, built once at startup and read-only after.
#[derive(Default)]
pub struct HandlerMap {
    handlers: HashMap<u32, Handler>,
}

impl HandlerMap {
    pub fn insert(&mut self, command: Command, handler: Handler) {
        self.handlers.insert(command.into(), handler);
    }

    fn get(&self, opcode: u32) -> Option<&Handler> {
        self.handlers.get(&opcode)
    }
}

pub struct CommandServer {
    listener: UnixListener,
    socket_path: PathBuf,
    read_timeout: Duration,
}

impl CommandServer {
    /// Creates the socket directory if needed, removes a stale socket
    /// file left by an unclean exit, binds and restricts permissions
    /// to the owning user.
    pub async fn bind(socket_path: &Path, read_timeout: Duration) -> io::Result<Self> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).await?;
        }
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => warn!(
                event = "stale_socket_removed",
                path = %socket_path.display(),
                "removed stale socket from previous run"
            ),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(socket_path)?;
        tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).await?;
        info!(event = "server_listening", path = %socket_path.display());
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            read_timeout,
        })
    }

    /// Accepts connections until the shutdown channel flips, serving
    /// each on its own tracked task. In-flight replies get a bounded
    /// drain before the socket is unlinked.
    pub async fn run(self, handlers: Arc<HandlerMap>, mut shutdown: watch::Receiver<bool>) {
        let mut connections = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let handlers = Arc::clone(&handlers);
                            let read_timeout = self.read_timeout;
                            connections.spawn(serve_connection(stream, handlers, read_timeout));
                        }
                        Err(err) => {
                            error!(event = "accept_failed", error = %err);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(event = "connections_aborted", remaining = connections.len());
            connections.abort_all();
        }
        if let Err(err) = tokio::fs::remove_file(&self.socket_path).await {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(event = "socket_unlink_failed", error = %err);
            }
        }
        info!(event = "server_stopped", path = %self.socket_path.display());
    }
}

async fn serve_connection(stream: UnixStream, handlers: Arc<HandlerMap>, read_timeout: Duration) {
    let mut conn = Connection::new(stream, read_timeout);
    let cmd = match conn.recv_cmd().await {
        Ok(cmd) => cmd,
        // A peer that never finishes writing gets dropped, not
        // answered; anything else undecodable earns an error reply.
        Err(err) if err.error_code() == ErrorCode::SocketTimeout => {
            debug!(event = "request_timed_out");
            return;
        }
        Err(err) => {
            debug!(event = "bad_request", error = %err);
            let resp = Response::bad(err.error_code(), err.to_string());
            let _ = conn.send_response(&resp).await;
            return;
        }
    };

    let response = match handlers.get(cmd.cmd) {
        Some(handler) => {
            debug!(event = "dispatch", cmd = cmd.cmd);
            handler(cmd).await
        }
        None => Response::from_error(ErrorCode::UnrecognizedCommand),
    };

    if let Err(err) = conn.send_response(&response).await {
        debug!(event = "reply_failed", error = %err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::request;
    use futures_util::FutureExt;
    use tokio::io::AsyncWriteExt;

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("moman-srv-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("MonitorManager")
    }

    fn ping_handlers() -> Arc<HandlerMap> {
        let mut map = HandlerMap::default();
        map.insert(
            Command::Ping,
            Arc::new(|_cmd| async { Response::ok().with_info("Pong") }.boxed()),
        );
        Arc::new(map)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatches_known_opcode() {
        let path = test_path("dispatch");
        let server = CommandServer::bind(&path, Duration::from_secs(1))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(ping_handlers(), rx));

        let resp = request(&path, &Cmd::new(Command::Ping), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.info.as_deref(), Some("Pong"));

        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_opcode_is_rejected() {
        let path = test_path("unknown");
        let server = CommandServer::bind(&path, Duration::from_secs(1))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(ping_handlers(), rx));

        let resp = request(&path, &Cmd::new(9999u32), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.error, u32::from(ErrorCode::UnrecognizedCommand));

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_request_gets_bad_payload() {
        let path = test_path("malformed");
        let server = CommandServer::bind(&path, Duration::from_secs(1))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(ping_handlers(), rx));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"this is not json").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut conn = Connection::new(stream, Duration::from_secs(1));
        let resp = conn.recv_response().await.unwrap();
        assert_eq!(resp.error, u32::from(ErrorCode::BadPayload));

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_in_flight_replies() {
        let path = test_path("drain");
        let server = CommandServer::bind(&path, Duration::from_secs(1))
            .await
            .unwrap();
        let mut map = HandlerMap::default();
        map.insert(
            Command::Ping,
            Arc::new(|_cmd| {
                async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Response::ok().with_info("Pong")
                }
                .boxed()
            }),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(Arc::new(map), rx));

        let client_path = path.clone();
        let client = tokio::spawn(async move {
            request(
                &client_path,
                &Cmd::new(Command::Ping),
                Duration::from_secs(2),
            )
            .await
            .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let resp = client.await.unwrap();
        assert_eq!(resp.info.as_deref(), Some("Pong"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_socket_is_replaced_on_bind() {
        let path = test_path("stale");
        std::fs::write(&path, b"").unwrap();
        let server = CommandServer::bind(&path, Duration::from_secs(1))
            .await
            .unwrap();
        drop(server);
        assert!(path.exists());
    }
}
