//! The operator-facing half of the cloud service: Ping, Submit, Cancel,
//! Status, and the Monitor update stream.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpStream};

use crate::{
    server::execute_query,
    tree::hash_hex,
    wire::{
        read_frame, write_frame, ConfigQuery, FrontendEnvelope, FrontendRequest, FrontendResponse,
        MonitorFrame, OpType, ResponseCode,
    },
};

use super::{
    cmdqueue::{CancelOutcome, CmdState},
    mirror,
    site::{Site, SiteRegistry},
};

pub struct FrontendService {
    registry: Arc<SiteRegistry>,
}

impl FrontendService {
    pub fn new(registry: Arc<SiteRegistry>) -> FrontendService {
        FrontendService { registry }
    }

    pub async fn handle(&self, envelope: FrontendEnvelope) -> FrontendResponse {
        let site = match self.registry.site(envelope.site).await {
            Ok(site) => site,
            Err(err) => {
                return FrontendResponse {
                    code: ResponseCode::Failed,
                    cmd_id: None,
                    value: None,
                    errmsg: Some(err.to_string()),
                }
            }
        };

        match envelope.request {
            FrontendRequest::Ping => FrontendResponse::new(ResponseCode::Ok),
            FrontendRequest::Submit { query } => self.submit(&site, query).await,
            FrontendRequest::Cancel { cmd_id } => self.cancel(&site, cmd_id).await,
            FrontendRequest::Status { cmd_id } => self.status(&site, cmd_id).await,
            // Monitor never reaches handle(); the connection loop owns it.
            FrontendRequest::Monitor { .. } => FrontendResponse {
                code: ResponseCode::Failed,
                cmd_id: None,
                value: None,
                errmsg: Some("monitor is a streaming request".to_owned()),
            },
        }
    }

    /// Submit with the read fast path: a singleton GET is answered from
    /// the local cache without enqueueing.
    async fn submit(&self, site: &Site, query: ConfigQuery) -> FrontendResponse {
        // A fresh metrics cache answers metrics reads without a round
        // trip to the appliance.
        if query.is_metrics_get() {
            let metrics = site.metrics.lock().unwrap();
            if !metrics.is_stale(OffsetDateTime::now_utc()) {
                if let Some(export) = &metrics.export {
                    return FrontendResponse {
                        code: ResponseCode::Ok,
                        cmd_id: None,
                        value: serde_json::to_string(export).ok(),
                        errmsg: None,
                    };
                }
            }
        }

        if let [op] = query.ops.as_slice() {
            if op.operation == OpType::Get && !query.is_metrics_get() {
                let mut tree = site.tree.lock().unwrap();
                // The cache is read-only here; no schema, no hooks.
                let dispatch = crate::dispatch::Dispatch::new();
                let (response, _) =
                    execute_query(&mut tree, None, &dispatch, &query, mirror::CLOUD_SENDER);
                return FrontendResponse {
                    code: response.code,
                    cmd_id: None,
                    value: response.value,
                    errmsg: response.errmsg,
                };
            }
        }

        let value = match mirror::query_to_value(&query) {
            Ok(value) => value,
            Err(err) => {
                return FrontendResponse {
                    code: ResponseCode::Failed,
                    cmd_id: None,
                    value: None,
                    errmsg: Some(err.to_string()),
                }
            }
        };

        match site.cmdq.submit(value).await {
            Ok(cmd_id) => {
                let mut response = FrontendResponse::new(ResponseCode::Queued);
                response.cmd_id = Some(cmd_id);
                response
            }
            Err(err) => FrontendResponse {
                code: ResponseCode::Failed,
                cmd_id: None,
                value: None,
                errmsg: Some(err.to_string()),
            },
        }
    }

    async fn cancel(&self, site: &Site, cmd_id: i64) -> FrontendResponse {
        match site.cmdq.cancel(cmd_id).await {
            Ok(CancelOutcome::Canceled) => FrontendResponse::new(ResponseCode::Ok),
            Ok(CancelOutcome::InProgress) => {
                let mut response = FrontendResponse::new(ResponseCode::InProgress);
                response.errmsg = Some("command already sent to the appliance".to_owned());
                response
            }
            Ok(CancelOutcome::AlreadyDone) => {
                let mut response = FrontendResponse::new(ResponseCode::Failed);
                response.errmsg = Some("command already completed".to_owned());
                response
            }
            Ok(CancelOutcome::Unknown) => FrontendResponse::new(ResponseCode::NoCmd),
            Err(err) => {
                let mut response = FrontendResponse::new(ResponseCode::Failed);
                response.errmsg = Some(err.to_string());
                response
            }
        }
    }

    async fn status(&self, site: &Site, cmd_id: i64) -> FrontendResponse {
        match site.cmdq.status(cmd_id).await {
            Ok(None) => FrontendResponse::new(ResponseCode::NoCmd),
            Ok(Some(command)) => match command.state {
                CmdState::Enqd => FrontendResponse::new(ResponseCode::Queued),
                CmdState::Work => FrontendResponse::new(ResponseCode::InProgress),
                CmdState::Cncl => {
                    let mut response = FrontendResponse::new(ResponseCode::Failed);
                    response.errmsg = Some("command was cancelled".to_owned());
                    response
                }
                CmdState::Done => {
                    let mut response = FrontendResponse::new(ResponseCode::Ok);
                    response.cmd_id = Some(command.id);
                    response.value = command
                        .response
                        .as_ref()
                        .and_then(|r| serde_json::to_string(r).ok());
                    response
                }
            },
            Err(err) => {
                let mut response = FrontendResponse::new(ResponseCode::Failed);
                response.errmsg = Some(err.to_string());
                response
            }
        }
    }

    pub async fn serve(self: Arc<Self>, address: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(address).await?;
        log::info!("cloud frontend listening on {address}");

        loop {
            let (stream, peer) = listener.accept().await?;
            let service = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = service.serve_connection(stream).await {
                    log::error!("frontend connection from {peer} failed: {err}");
                }
            });
        }
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        while let Some(envelope) = read_frame::<FrontendEnvelope, _>(&mut stream).await? {
            let site_uuid = envelope.site;
            match envelope.request {
                FrontendRequest::Monitor { since_hash } => {
                    let site = match self.registry.site(site_uuid).await {
                        Ok(site) => site,
                        Err(err) => {
                            let mut response = FrontendResponse::new(ResponseCode::Failed);
                            response.errmsg = Some(err.to_string());
                            write_frame(&mut stream, &response).await?;
                            continue;
                        }
                    };
                    // The connection becomes an update stream.
                    return monitor_loop(site, since_hash, stream).await;
                }
                request => {
                    let envelope = FrontendEnvelope {
                        site: site_uuid,
                        request,
                    };
                    let response = self.handle(envelope).await;
                    write_frame(&mut stream, &response).await?;
                }
            }
        }
        Ok(())
    }
}

/// Streams updates for one subscriber. Starts with a full-state sync
/// frame unless the subscriber's hash already matches the cache.
async fn monitor_loop(
    site: Arc<Site>,
    since_hash: Option<String>,
    mut stream: TcpStream,
) -> io::Result<()> {
    // Subscribe before snapshotting so no update can fall between the two.
    let mut sub = site.updates.subscribe();

    let (hash, export) = {
        let tree = site.tree.lock().unwrap();
        (hash_hex(&tree.root_hash()), tree.export())
    };
    if since_hash.as_deref() != Some(hash.as_str()) {
        write_frame(&mut stream, &MonitorFrame::Sync { hash, tree: export }).await?;
    }

    loop {
        // The subscription's wake-up is a blocking wait; park it on the
        // blocking pool and take it back each round.
        let (events, sub_back) = tokio::task::spawn_blocking(move || {
            let events = sub.recv_timeout(Duration::from_secs(5));
            (events, sub)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        sub = sub_back;

        if events.is_empty() {
            continue;
        }

        let hash = site.root_hash_hex();
        log::trace!(
            "site {}: streaming {} updates at {}",
            site.uuid,
            events.len(),
            OffsetDateTime::now_utc()
        );
        write_frame(
            &mut stream,
            &MonitorFrame::Updates {
                hash,
                updates: events,
            },
        )
        .await?;
    }
}
