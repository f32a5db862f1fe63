use std::fmt;
use std::str::FromStr;

pub mod msg;

pub use msg::{decode_cmd, decode_response, encode_cmd, encode_response, Cmd, CodecError, Response};

/// Name of the supervisor's own control socket inside the socket directory.
/// Workers publish theirs as `Monitor.<class>` / `Scraper.<class>` next to it.
pub const SUPERVISOR_SOCKET_NAME: &str = "MonitorManager";

/// Wire opcodes. The numeric values are an internal registry shared by the
/// supervisor, the workers and the CLI; only the symbolic names are part of
/// the portable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Ping = 1,
    Stop,
    SetSpecificConfig,
    SetSpecificWebhooks,
    SetSpecificBlacklist,
    SetSpecificWhitelist,
    SetCommonConfig,
    SetCommonWebhooks,
    SetCommonBlacklist,
    SetCommonWhitelist,
    MmAddMonitor,
    MmAddScraper,
    MmAddMonitorScraper,
    MmStopMonitor,
    MmStopScraper,
    MmStopMonitorScraper,
    MmStopMonitorManager,
    MmGetMonitorStatus,
    MmGetScraperStatus,
    MmGetMonitorScraperStatus,
}

const COMMANDS: &[(Command, &str)] = &[
    (Command::Ping, "PING"),
    (Command::Stop, "STOP"),
    (Command::SetSpecificConfig, "SET_SPECIFIC_CONFIG"),
    (Command::SetSpecificWebhooks, "SET_SPECIFIC_WEBHOOKS"),
    (Command::SetSpecificBlacklist, "SET_SPECIFIC_BLACKLIST"),
    (Command::SetSpecificWhitelist, "SET_SPECIFIC_WHITELIST"),
    (Command::SetCommonConfig, "SET_COMMON_CONFIG"),
    (Command::SetCommonWebhooks, "SET_COMMON_WEBHOOKS"),
    (Command::SetCommonBlacklist, "SET_COMMON_BLACKLIST"),
    (Command::SetCommonWhitelist, "SET_COMMON_WHITELIST"),
    (Command::MmAddMonitor, "MM_ADD_MONITOR"),
    (Command::MmAddScraper, "MM_ADD_SCRAPER"),
    (Command::MmAddMonitorScraper, "MM_ADD_MONITOR_SCRAPER"),
    (Command::MmStopMonitor, "MM_STOP_MONITOR"),
    (Command::MmStopScraper, "MM_STOP_SCRAPER"),
    (Command::MmStopMonitorScraper, "MM_STOP_MONITOR_SCRAPER"),
    (Command::MmStopMonitorManager, "MM_STOP_MONITOR_MANAGER"),
    (Command::MmGetMonitorStatus, "MM_GET_MONITOR_STATUS"),
    (Command::MmGetScraperStatus, "MM_GET_SCRAPER_STATUS"),
    (Command::MmGetMonitorScraperStatus, "MM_GET_MONITOR_SCRAPER_STATUS"),
];

impl Command {
    pub fn as_str(&self) -> &'static str {
        COMMANDS
            .iter()
            .find(|(cmd, _)| cmd == self)
            .map(|(_, name)| *name)
            .unwrap_or("UNKNOWN")
    }
}

impl From<Command> for u32 {
    fn from(cmd: Command) -> Self {
        cmd as u32
    }
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        COMMANDS
            .iter()
            .find(|(cmd, _)| *cmd as u32 == value)
            .map(|(cmd, _)| *cmd)
            .ok_or(value)
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        COMMANDS
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(cmd, _)| *cmd)
            .ok_or_else(|| format!("unknown command: {s}"))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol error taxonomy. `Ok` is zero; every other code travels on the
/// wire in `Response.error` together with an optional human `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,

    SocketDoesntExist,
    SocketCouldntConnect,
    SocketTimeout,

    MonitorDoesntExist,
    ScraperDoesntExist,
    MonitorNotRegistered,
    ScraperNotRegistered,

    UnrecognizedCommand,
    BadPayload,
    MissingPayload,
    MissingPayloadArgs,

    MmCouldntAddMonitor,
    MmCouldntAddScraper,
    MmCouldntAddMonitorScraper,
    MmCouldntStopMonitor,
    MmCouldntStopScraper,
    MmCouldntStopMonitorScraper,

    OtherError,
    UnknownError,
}

const ERRORS: &[(ErrorCode, &str)] = &[
    (ErrorCode::Ok, "OK"),
    (ErrorCode::SocketDoesntExist, "SOCKET_DOESNT_EXIST"),
    (ErrorCode::SocketCouldntConnect, "SOCKET_COULDNT_CONNECT"),
    (ErrorCode::SocketTimeout, "SOCKET_TIMEOUT"),
    (ErrorCode::MonitorDoesntExist, "MONITOR_DOESNT_EXIST"),
    (ErrorCode::ScraperDoesntExist, "SCRAPER_DOESNT_EXIST"),
    (ErrorCode::MonitorNotRegistered, "MONITOR_NOT_REGISTERED"),
    (ErrorCode::ScraperNotRegistered, "SCRAPER_NOT_REGISTERED"),
    (ErrorCode::UnrecognizedCommand, "UNRECOGNIZED_COMMAND"),
    (ErrorCode::BadPayload, "BAD_PAYLOAD"),
    (ErrorCode::MissingPayload, "MISSING_PAYLOAD"),
    (ErrorCode::MissingPayloadArgs, "MISSING_PAYLOAD_ARGS"),
    (ErrorCode::MmCouldntAddMonitor, "MM_COULDNT_ADD_MONITOR"),
    (ErrorCode::MmCouldntAddScraper, "MM_COULDNT_ADD_SCRAPER"),
    (
        ErrorCode::MmCouldntAddMonitorScraper,
        "MM_COULDNT_ADD_MONITOR_SCRAPER",
    ),
    (ErrorCode::MmCouldntStopMonitor, "MM_COULDNT_STOP_MONITOR"),
    (ErrorCode::MmCouldntStopScraper, "MM_COULDNT_STOP_SCRAPER"),
    (
        ErrorCode::MmCouldntStopMonitorScraper,
        "MM_COULDNT_STOP_MONITOR_SCRAPER",
    ),
    (ErrorCode::OtherError, "OTHER_ERROR"),
    (ErrorCode::UnknownError, "UNKNOWN_ERROR"),
];

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        ERRORS
            .iter()
            .find(|(err, _)| err == self)
            .map(|(_, name)| *name)
            .unwrap_or("UNKNOWN_ERROR")
    }

    /// Name for an arbitrary wire value, falling back to the numeric form
    /// for codes outside the registry.
    pub fn name_of(value: u32) -> String {
        match ErrorCode::try_from(value) {
            Ok(code) => code.as_str().to_string(),
            Err(_) => value.to_string(),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(err: ErrorCode) -> Self {
        err as u32
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        ERRORS
            .iter()
            .find(|(err, _)| *err as u32 == value)
            .map(|(err, _)| *err)
            .ok_or(value)
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ERRORS
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(err, _)| *err)
            .ok_or_else(|| format!("unknown error code: {s}"))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminator between the two worker families a class name can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Monitor,
    Scraper,
}

impl WorkerKind {
    pub const BOTH: [WorkerKind; 2] = [WorkerKind::Monitor, WorkerKind::Scraper];

    pub fn label(&self) -> &'static str {
        match self {
            WorkerKind::Monitor => "Monitor",
            WorkerKind::Scraper => "Scraper",
        }
    }

    /// Prefix workers of this kind use when publishing their control socket.
    pub fn socket_prefix(&self) -> &'static str {
        match self {
            WorkerKind::Monitor => "Monitor.",
            WorkerKind::Scraper => "Scraper.",
        }
    }

    pub fn add_error(&self) -> ErrorCode {
        match self {
            WorkerKind::Monitor => ErrorCode::MmCouldntAddMonitor,
            WorkerKind::Scraper => ErrorCode::MmCouldntAddScraper,
        }
    }

    pub fn stop_error(&self) -> ErrorCode {
        match self {
            WorkerKind::Monitor => ErrorCode::MmCouldntStopMonitor,
            WorkerKind::Scraper => ErrorCode::MmCouldntStopScraper,
        }
    }

    pub fn not_registered_error(&self) -> ErrorCode {
        match self {
            WorkerKind::Monitor => ErrorCode::MonitorNotRegistered,
            WorkerKind::Scraper => ErrorCode::ScraperNotRegistered,
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_u32_and_name() {
        for (cmd, name) in COMMANDS {
            assert_eq!(Command::try_from(*cmd as u32), Ok(*cmd));
            assert_eq!(cmd.as_str(), *name);
            assert_eq!(name.parse::<Command>(), Ok(*cmd));
        }
    }

    #[test]
    fn unknown_command_value_is_rejected() {
        assert_eq!(Command::try_from(9999), Err(9999));
        assert!("MM_DO_THE_THING".parse::<Command>().is_err());
    }

    #[test]
    fn error_code_zero_is_ok() {
        assert_eq!(ErrorCode::Ok as u32, 0);
        assert_eq!(ErrorCode::try_from(0), Ok(ErrorCode::Ok));
    }

    #[test]
    fn error_name_falls_back_to_numeric() {
        assert_eq!(ErrorCode::name_of(3), "SOCKET_TIMEOUT");
        assert_eq!(ErrorCode::name_of(4242), "4242");
    }

    #[test]
    fn kind_scoped_codes() {
        assert_eq!(
            WorkerKind::Monitor.add_error(),
            ErrorCode::MmCouldntAddMonitor
        );
        assert_eq!(
            WorkerKind::Scraper.stop_error(),
            ErrorCode::MmCouldntStopScraper
        );
        assert_eq!(WorkerKind::Scraper.socket_prefix(), "Scraper.");
    }
}
