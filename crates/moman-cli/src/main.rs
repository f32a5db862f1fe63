use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use moman_core::{Cmd, Command, ErrorCode, Response, SUPERVISOR_SOCKET_NAME};
use moman_daemon::connection::request;
use serde_json::json;

/// Talk to a running momand supervisor.
#[derive(Parser, Debug)]
#[command(name = "moman", version, about)]
struct Args {
    /// Socket directory the supervisor listens in.
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Seconds to wait for a reply.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Target {
    Monitor,
    Scraper,
    Both,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Check that the supervisor is alive.
    Ping,
    /// Start a worker by registered class name.
    Add {
        #[arg(long, value_enum, default_value_t = Target::Monitor)]
        target: Target,
        name: String,
        /// Extra arguments passed to the worker script.
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Stop a running worker.
    Stop {
        #[arg(long, value_enum, default_value_t = Target::Monitor)]
        target: Target,
        name: String,
    },
    /// Show tracked processes and sockets.
    Status {
        #[arg(long, value_enum, default_value_t = Target::Both)]
        target: Target,
    },
    /// Stop the supervisor and every worker it tracks.
    Shutdown,
    /// Send a raw command by opcode name or number.
    Send {
        /// Opcode, e.g. MM_GET_MONITOR_STATUS or 18.
        opcode: String,
        /// JSON payload object.
        #[arg(long)]
        payload: Option<String>,
    },
}

fn build_cmd(command: &CliCommand) -> Result<Cmd> {
    let cmd = match command {
        CliCommand::Ping => Cmd::new(Command::Ping),
        CliCommand::Add { target, name, args } => {
            let opcode = match target {
                Target::Monitor => Command::MmAddMonitor,
                Target::Scraper => Command::MmAddScraper,
                Target::Both => Command::MmAddMonitorScraper,
            };
            let mut payload = json!({"name": name});
            if !args.is_empty() {
                payload["args"] = json!(args);
            }
            Cmd::with_payload(opcode, payload)
        }
        CliCommand::Stop { target, name } => {
            let opcode = match target {
                Target::Monitor => Command::MmStopMonitor,
                Target::Scraper => Command::MmStopScraper,
                Target::Both => Command::MmStopMonitorScraper,
            };
            Cmd::with_payload(opcode, json!({"name": name}))
        }
        CliCommand::Status { target } => Cmd::new(match target {
            Target::Monitor => Command::MmGetMonitorStatus,
            Target::Scraper => Command::MmGetScraperStatus,
            Target::Both => Command::MmGetMonitorScraperStatus,
        }),
        CliCommand::Shutdown => Cmd::new(Command::MmStopMonitorManager),
        CliCommand::Send { opcode, payload } => {
            let numeric = match opcode.parse::<u32>() {
                Ok(n) => n,
                Err(_) => opcode
                    .parse::<Command>()
                    .map(u32::from)
                    .map_err(|err| anyhow!(err))?,
            };
            match payload {
                Some(text) => {
                    let value = serde_json::from_str(text).context("payload is not valid JSON")?;
                    Cmd::with_payload(numeric, value)
                }
                None => Cmd::new(numeric),
            }
        }
    };
    Ok(cmd)
}

fn socket_path(args: &Args) -> PathBuf {
    let dir = args.socket_dir.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".moman")
            .join("sockets")
    });
    dir.join(SUPERVISOR_SOCKET_NAME)
}

fn print_response(response: &Response) {
    println!("error: {}", ErrorCode::name_of(response.error));
    if let Some(info) = &response.info {
        println!("info: {info}");
    }
    if let Some(payload) = &response.payload {
        println!(
            "{}",
            serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
        );
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let cmd = build_cmd(&args.command)?;
    let path = socket_path(&args);

    let response = request(&path, &cmd, Duration::from_secs(args.timeout))
        .await
        .with_context(|| format!("talking to supervisor at {}", path.display()))?;

    print_response(&response);
    Ok(if response.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_builds_the_right_opcode_and_payload() {
        let cmd = build_cmd(&CliCommand::Add {
            target: Target::Both,
            name: "Footsites".into(),
            args: vec!["--fast".into()],
        })
        .unwrap();
        assert_eq!(cmd.command(), Some(Command::MmAddMonitorScraper));
        assert_eq!(cmd.payload_str("name"), Some("Footsites"));
        assert_eq!(cmd.payload.unwrap()["args"], json!(["--fast"]));
    }

    #[test]
    fn send_accepts_names_and_numbers() {
        let by_name = build_cmd(&CliCommand::Send {
            opcode: "MM_GET_MONITOR_STATUS".into(),
            payload: None,
        })
        .unwrap();
        let by_number = build_cmd(&CliCommand::Send {
            opcode: u32::from(Command::MmGetMonitorStatus).to_string(),
            payload: None,
        })
        .unwrap();
        assert_eq!(by_name.cmd, by_number.cmd);

        assert!(build_cmd(&CliCommand::Send {
            opcode: "MM_NOPE".into(),
            payload: None,
        })
        .is_err());
    }

    #[test]
    fn send_rejects_bad_payload_json() {
        assert!(build_cmd(&CliCommand::Send {
            opcode: "PING".into(),
            payload: Some("{broken".into()),
        })
        .is_err());
    }
}
