//! The operator commands: ping, get, set, add, del. Each speaks to the
//! cloud frontend and exits non-zero with a readable error on any failure.

use std::io::Write as _;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use clap::Parser;
use termcolor::{Color, ColorSpec, StandardStream, WriteColor};
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use uuid::Uuid;

use crate::{
    access::AccessLevel,
    wire::{
        read_frame, write_frame, ConfigOp, ConfigQuery, FrontendEnvelope, FrontendRequest,
        FrontendResponse, OpType, ResponseCode,
    },
};

use super::GlobalOptions;

const CLI_SENDER: &str = "canopy.cli";

/// How long a queued write is polled before the CLI gives up.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
pub struct TargetOptions {
    /// Site UUID to operate on.
    #[clap(short = 'a', long = "appliance")]
    pub site: Uuid,

    /// Access level to present.
    #[clap(short = 'l', long, default_value = "admin")]
    pub level: AccessLevel,

    /// Cloud frontend to talk to.
    #[clap(long, default_value = "127.0.0.1:4740")]
    pub server: SocketAddr,
}

#[derive(Debug, Parser)]
pub struct PingCommand {
    #[clap(flatten)]
    pub target: TargetOptions,
}

impl PingCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let response = roundtrip(&self.target, FrontendRequest::Ping)?;
        if response.code != ResponseCode::Ok {
            bail!("ping failed: {}", describe(&response));
        }
        print_ok(global, "pong")
    }
}

#[derive(Debug, Parser)]
pub struct GetCommand {
    #[clap(flatten)]
    pub target: TargetOptions,

    /// Property path, e.g. @/network/vap/psk/ssid
    pub path: String,
}

impl GetCommand {
    pub fn run(self, _global: GlobalOptions) -> anyhow::Result<()> {
        let query = ConfigQuery::get(CLI_SENDER, self.target.level, &self.path);
        let response = submit_and_wait(&self.target, query)?;
        println!("{}", response.value.as_deref().unwrap_or("-"));
        Ok(())
    }
}

#[derive(Debug, Parser)]
pub struct SetCommand {
    #[clap(flatten)]
    pub target: TargetOptions,

    /// Property path.
    pub path: String,

    /// New value.
    pub value: String,

    /// Optional lifetime, e.g. 30m or 2h.
    pub duration: Option<humantime::Duration>,
}

impl SetCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        write_op(&self.target, global, OpType::Set, &self.path, &self.value, self.duration)
    }
}

#[derive(Debug, Parser)]
pub struct AddCommand {
    #[clap(flatten)]
    pub target: TargetOptions,

    /// Property path.
    pub path: String,

    /// New value.
    pub value: String,

    /// Optional lifetime, e.g. 30m or 2h.
    pub duration: Option<humantime::Duration>,
}

impl AddCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        write_op(&self.target, global, OpType::Create, &self.path, &self.value, self.duration)
    }
}

#[derive(Debug, Parser)]
pub struct DelCommand {
    #[clap(flatten)]
    pub target: TargetOptions,

    /// Property path.
    pub path: String,
}

impl DelCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let op = ConfigOp::new(OpType::Delete, &self.path);
        let query = ConfigQuery::new(CLI_SENDER, self.target.level, vec![op]);
        let response = submit_and_wait(&self.target, query)?;
        if response.code != ResponseCode::Ok {
            bail!("delete failed: {}", describe(&response));
        }
        print_ok(global, &format!("deleted {}", self.path))
    }
}

fn write_op(
    target: &TargetOptions,
    global: GlobalOptions,
    op_type: OpType,
    path: &str,
    value: &str,
    duration: Option<humantime::Duration>,
) -> anyhow::Result<()> {
    let expires = duration.map(|d| OffsetDateTime::now_utc() + time::Duration::try_from(*d)
        .unwrap_or(time::Duration::ZERO));
    let op = ConfigOp::new(op_type, path)
        .with_value(value)
        .with_expires(expires);
    let query = ConfigQuery::new(CLI_SENDER, target.level, vec![op]);

    let response = submit_and_wait(target, query)?;
    if response.code != ResponseCode::Ok {
        bail!("write failed: {}", describe(&response));
    }
    print_ok(global, &format!("{path} = {value}"))
}

/// Submits a query and, when it lands in the queue, polls until the
/// appliance completes it.
fn submit_and_wait(
    target: &TargetOptions,
    query: ConfigQuery,
) -> anyhow::Result<FrontendResponse> {
    let response = roundtrip(target, FrontendRequest::Submit { query })?;

    match response.code {
        ResponseCode::Ok => return Ok(response),
        ResponseCode::Queued => {}
        _ => bail!("submit failed: {}", describe(&response)),
    }

    let cmd_id = response
        .cmd_id
        .ok_or_else(|| anyhow!("queued response carried no command id"))?;
    let deadline = std::time::Instant::now() + COMPLETION_TIMEOUT;

    loop {
        std::thread::sleep(POLL_INTERVAL);
        let status = roundtrip(target, FrontendRequest::Status { cmd_id })?;
        match status.code {
            ResponseCode::Queued | ResponseCode::InProgress => {
                if std::time::Instant::now() >= deadline {
                    bail!("command {cmd_id} did not complete in time; poll again with status");
                }
            }
            ResponseCode::Ok => {
                // The stored payload is the appliance's ConfigResponse.
                let inner: Option<crate::wire::ConfigResponse> = status
                    .value
                    .as_deref()
                    .and_then(|raw| serde_json::from_str(raw).ok());
                return match inner {
                    Some(inner) if !inner.is_ok() => {
                        bail!(
                            "appliance rejected the command: {}",
                            inner.errmsg.unwrap_or_else(|| format!("{:?}", inner.code))
                        )
                    }
                    Some(inner) => Ok(FrontendResponse {
                        code: ResponseCode::Ok,
                        cmd_id: Some(cmd_id),
                        value: inner.value,
                        errmsg: None,
                    }),
                    None => Ok(status),
                };
            }
            _ => bail!("command {cmd_id} failed: {}", describe(&status)),
        }
    }
}

fn roundtrip(
    target: &TargetOptions,
    request: FrontendRequest,
) -> anyhow::Result<FrontendResponse> {
    let envelope = FrontendEnvelope {
        site: target.site,
        request,
    };
    let server = target.server;

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let mut stream = TcpStream::connect(server).await?;
        write_frame(&mut stream, &envelope).await?;
        read_frame::<FrontendResponse, _>(&mut stream)
            .await?
            .ok_or_else(|| anyhow!("connection closed before a response arrived"))
    })
}

fn describe(response: &FrontendResponse) -> String {
    match &response.errmsg {
        Some(errmsg) => format!("{:?}: {errmsg}", response.code),
        None => format!("{:?}", response.code),
    }
}

fn print_ok(global: GlobalOptions, message: &str) -> anyhow::Result<()> {
    let mut stdout = StandardStream::stdout(global.color.into());
    stdout.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
    write!(&mut stdout, "ok")?;
    stdout.reset()?;
    writeln!(&mut stdout, " {message}")?;
    Ok(())
}
