use std::path::PathBuf;
use std::time::Duration;

/// Runtime paths and timing knobs for the supervisor.
///
/// Everything lives under one base directory by default (`~/.moman`):
/// `sock/` for control sockets, `config/` for the watched fan-out
/// tree, `register.json` for the worker registry.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory where control sockets are created and watched.
    pub socket_dir: PathBuf,
    /// Root of the watched configuration tree.
    pub config_dir: PathBuf,
    /// Worker registry document.
    pub registry_path: PathBuf,
    /// How long a spawned worker gets to publish a responsive socket.
    pub add_confirm_window: Duration,
    /// Reaper scan interval for unexpected process exits.
    pub reap_interval: Duration,
    /// Per-read timeout on command connections.
    pub read_timeout: Duration,
    /// Timeout for outbound worker conversations (STOP relay, PING).
    pub worker_timeout: Duration,
    /// Interpreter used to launch worker scripts. `None` means probe
    /// the environment for a Python 3 at first use.
    pub interpreter: Option<PathBuf>,
}

impl Config {
    pub fn with_base_dir(base: PathBuf) -> Self {
        Self {
            socket_dir: base.join("sockets"),
            config_dir: base.join("config"),
            registry_path: base.join("register.json"),
            add_confirm_window: Duration::from_secs(2),
            reap_interval: Duration::from_millis(500),
            read_timeout: Duration::from_secs(1),
            worker_timeout: Duration::from_secs(3),
            interpreter: None,
        }
    }

    pub fn supervisor_socket_path(&self) -> PathBuf {
        self.socket_dir.join(moman_core::SUPERVISOR_SOCKET_NAME)
    }
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".moman");
        Self::with_base_dir(base)
    }
}
