pub mod config;
pub mod connection;
pub mod manager;
pub mod process;
pub mod registry;
pub mod server;
pub mod watcher;

pub use config::Config;
pub use manager::MonitorManager;
