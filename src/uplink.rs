//! The appliance's side of the appliance↔cloud link: say hello, stream
//! hash-stamped update batches upward, and execute queued commands
//! fetched from the cloud backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::{
    server::Appliance,
    wire::{
        read_frame, write_frame, BackendRequest, BackendResponse, CmdCompletion, ConfigQuery,
    },
};

/// How long one round waits for local change events before polling the
/// command queue again.
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Commands pulled per fetch round.
const FETCH_BATCH: u32 = 8;

/// Backoff after a broken session.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct Uplink {
    appliance: Arc<Appliance>,
    backend: SocketAddr,
}

impl Uplink {
    pub fn new(appliance: Arc<Appliance>, backend: SocketAddr) -> Uplink {
        Uplink { appliance, backend }
    }

    /// Runs forever, reconnecting with a delay whenever a session breaks.
    pub async fn run(&self) {
        loop {
            match self.session().await {
                Ok(()) => return,
                Err(err) => {
                    log::warn!("cloud session failed: {err:#}; reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn session(&self) -> anyhow::Result<()> {
        let uuid = self.site_uuid()?;
        let mut stream = TcpStream::connect(self.backend)
            .await
            .with_context(|| format!("connecting to cloud backend {}", self.backend))?;
        log::info!("connected to cloud backend {}", self.backend);

        self.transact(&mut stream, &BackendRequest::Hello { uuid })
            .await?;

        let mut sub = self.appliance.subscribe();
        let mut last_cmd_id = 0i64;

        loop {
            // Local commits since the last round, batched with the
            // post-batch root hash so the cloud can detect divergence.
            let (events, sub_back) = tokio::task::spawn_blocking(move || {
                let events = sub.recv_timeout(EVENT_DRAIN_TIMEOUT);
                (events, sub)
            })
            .await
            .map_err(|e| anyhow!("event drain task failed: {e}"))?;
            sub = sub_back;

            if !events.is_empty() {
                let hash = self.appliance.root_hash_hex();
                self.transact(
                    &mut stream,
                    &BackendRequest::Update {
                        uuid,
                        updates: events,
                        hash,
                    },
                )
                .await?;
            }

            let response = self
                .transact(
                    &mut stream,
                    &BackendRequest::FetchCmds {
                        uuid,
                        last_cmd_id,
                        max: FETCH_BATCH,
                    },
                )
                .await?;

            let BackendResponse::Cmds { cmds } = response else {
                continue;
            };
            if cmds.is_empty() {
                continue;
            }

            let mut completions = Vec::with_capacity(cmds.len());
            for cmd in cmds {
                last_cmd_id = last_cmd_id.max(cmd.cmd_id);
                let response = match serde_json::from_value::<ConfigQuery>(cmd.query) {
                    Ok(query) => self.appliance.execute(&query),
                    Err(err) => {
                        log::warn!("command {} carried a bad query: {err}", cmd.cmd_id);
                        continue;
                    }
                };
                completions.push(CmdCompletion {
                    cmd_id: cmd.cmd_id,
                    response: serde_json::to_value(&response)
                        .unwrap_or(serde_json::Value::Null),
                });
            }

            if !completions.is_empty() {
                self.transact(
                    &mut stream,
                    &BackendRequest::CompleteCmds { uuid, completions },
                )
                .await?;
            }
        }
    }

    async fn transact(
        &self,
        stream: &mut TcpStream,
        request: &BackendRequest,
    ) -> anyhow::Result<BackendResponse> {
        write_frame(stream, request).await?;
        let response = read_frame::<BackendResponse, _>(stream)
            .await?
            .ok_or_else(|| anyhow!("cloud backend hung up"))?;
        if let BackendResponse::Error { message } = &response {
            bail!("cloud backend rejected request: {message}");
        }
        Ok(response)
    }

    fn site_uuid(&self) -> anyhow::Result<Uuid> {
        let tree = self.appliance.tree();
        let path = tree.parse("@/uuid")?;
        let raw = tree.get_prop(&path, time::OffsetDateTime::now_utc())?;
        Uuid::parse_str(&raw).with_context(|| format!("bad @/uuid '{raw}'"))
    }
}
