//! The RPC message envelope shared by the appliance server, the cloud
//! frontend, and the cloud backend, plus the length-prefixed JSON framing
//! both sides speak over their sockets.

use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::{access::AccessLevel, events::Event, tree::PropExport};

pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound on a single frame; a full-tree refresh fits comfortably.
const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Get,
    Set,
    Create,
    Delete,
    Ping,
    Test,
    #[serde(rename = "TESTEQ")]
    TestEq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOp {
    pub operation: OpType,
    pub property: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires: Option<OffsetDateTime>,
}

impl ConfigOp {
    pub fn new(operation: OpType, property: &str) -> ConfigOp {
        ConfigOp {
            operation,
            property: property.to_owned(),
            value: None,
            expires: None,
        }
    }

    pub fn with_value(mut self, value: &str) -> ConfigOp {
        self.value = Some(value.to_owned());
        self
    }

    pub fn with_expires(mut self, expires: Option<OffsetDateTime>) -> ConfigOp {
        self.expires = expires;
        self
    }
}

/// One batch of operations. The whole batch executes inside a single
/// changeset; the first failing op aborts and reverts everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigQuery {
    pub version: u32,
    pub timestamp: String,
    pub sender: String,
    pub level: AccessLevel,
    pub ops: Vec<ConfigOp>,
}

impl ConfigQuery {
    pub fn new(sender: &str, level: AccessLevel, ops: Vec<ConfigOp>) -> ConfigQuery {
        ConfigQuery {
            version: PROTOCOL_VERSION,
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .expect("current time formats as RFC 3339"),
            sender: sender.to_owned(),
            level,
            ops,
        }
    }

    pub fn ping(sender: &str, level: AccessLevel) -> ConfigQuery {
        ConfigQuery::new(sender, level, vec![ConfigOp::new(OpType::Ping, "")])
    }

    pub fn get(sender: &str, level: AccessLevel, property: &str) -> ConfigQuery {
        ConfigQuery::new(sender, level, vec![ConfigOp::new(OpType::Get, property)])
    }

    pub fn parse_timestamp(&self) -> Result<OffsetDateTime, time::error::Parse> {
        OffsetDateTime::parse(&self.timestamp, &Rfc3339)
    }

    /// True when this batch is a single full-tree GET, the query the cloud
    /// uses to refresh a diverged cache.
    pub fn is_full_tree_get(&self) -> bool {
        matches!(
            self.ops.as_slice(),
            [ConfigOp { operation: OpType::Get, property, .. }]
                if property.as_str() == "@/" || property.as_str() == "@"
        )
    }

    /// True when this batch is a single GET under the metrics side tree.
    pub fn is_metrics_get(&self) -> bool {
        matches!(
            self.ops.as_slice(),
            [ConfigOp { operation: OpType::Get, property, .. }]
                if property.as_str() == "@/metrics" || property.starts_with("@/metrics/")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    Failed,
    Unsupported,
    #[serde(rename = "NOPROP")]
    NoProp,
    #[serde(rename = "NOTEQUAL")]
    NotEqual,
    #[serde(rename = "BADVERSION")]
    BadVersion,
    #[serde(rename = "BADTIME")]
    BadTime,
    Expired,
    #[serde(rename = "NOTLEAF")]
    NotLeaf,
    #[serde(rename = "NOCMD")]
    NoCmd,
    Queued,
    #[serde(rename = "INPROGRESS")]
    InProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub sender: String,
    pub version: u32,
    pub code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl ConfigResponse {
    pub fn new(sender: &str, code: ResponseCode) -> ConfigResponse {
        ConfigResponse {
            timestamp: OffsetDateTime::now_utc(),
            sender: sender.to_owned(),
            version: PROTOCOL_VERSION,
            code,
            value: None,
            errmsg: None,
        }
    }

    pub fn with_value(mut self, value: String) -> ConfigResponse {
        self.value = Some(value);
        self
    }

    pub fn with_errmsg(mut self, errmsg: String) -> ConfigResponse {
        self.errmsg = Some(errmsg);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }
}

/// A queued command as fetched by the appliance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireCmd {
    pub cmd_id: i64,
    pub query: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdCompletion {
    pub cmd_id: i64,
    pub response: serde_json::Value,
}

/// Appliance-facing cloud RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendRequest {
    Hello {
        uuid: Uuid,
    },
    Update {
        uuid: Uuid,
        updates: Vec<Event>,
        hash: String,
    },
    FetchCmds {
        uuid: Uuid,
        last_cmd_id: i64,
        max: u32,
    },
    CompleteCmds {
        uuid: Uuid,
        completions: Vec<CmdCompletion>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendResponse {
    Ok,
    Cmds { cmds: Vec<WireCmd> },
    Error { message: String },
}

/// Operator-facing cloud RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrontendRequest {
    Ping,
    Submit { query: ConfigQuery },
    Cancel { cmd_id: i64 },
    Status { cmd_id: i64 },
    Monitor { since_hash: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendEnvelope {
    pub site: Uuid,
    pub request: FrontendRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendResponse {
    pub code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl FrontendResponse {
    pub fn new(code: ResponseCode) -> FrontendResponse {
        FrontendResponse {
            code,
            cmd_id: None,
            value: None,
            errmsg: None,
        }
    }
}

/// Frames on a Monitor stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorFrame {
    /// Full-state resync, sent first when the subscriber's hash diverges.
    Sync { hash: String, tree: PropExport },
    Updates { hash: String, updates: Vec<Event> },
}

pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload =
        serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum size",
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Reads one frame; `None` on clean EOF before a length prefix.
pub async fn read_frame<T, R>(reader: &mut R) -> io::Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum size",
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let message = serde_json::from_slice(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(message))
}
