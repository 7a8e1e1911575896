//! The appliance-facing half of the cloud service: Hello, Update,
//! FetchCmds, and CompleteCmds over the same length-prefixed framing the
//! appliance speaks locally.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::wire::{read_frame, write_frame, BackendRequest, BackendResponse, WireCmd};

use super::{mirror, site::SiteRegistry};

pub struct BackendService {
    registry: Arc<SiteRegistry>,
}

impl BackendService {
    pub fn new(registry: Arc<SiteRegistry>) -> BackendService {
        BackendService { registry }
    }

    pub async fn handle(&self, request: BackendRequest) -> BackendResponse {
        match self.handle_inner(request).await {
            Ok(response) => response,
            Err(err) => BackendResponse::Error {
                message: err.to_string(),
            },
        }
    }

    async fn handle_inner(
        &self,
        request: BackendRequest,
    ) -> Result<BackendResponse, super::cmdqueue::CmdQueueError> {
        match request {
            BackendRequest::Hello { uuid } => {
                let site = self.registry.site(uuid).await?;
                if site.is_unseen() {
                    // First contact (or a cache we know nothing about):
                    // pull the whole tree from the appliance.
                    mirror::submit_refresh(&site).await?;
                }
                log::info!("appliance {uuid} said hello");
                Ok(BackendResponse::Ok)
            }

            BackendRequest::Update {
                uuid,
                updates,
                hash,
            } => {
                let site = self.registry.site(uuid).await?;
                mirror::apply_updates(&site, &updates, &hash).await?;
                Ok(BackendResponse::Ok)
            }

            BackendRequest::FetchCmds {
                uuid,
                last_cmd_id,
                max,
            } => {
                let site = self.registry.site(uuid).await?;
                let cmds = site.cmdq.fetch(last_cmd_id, max, false).await?;
                Ok(BackendResponse::Cmds {
                    cmds: cmds
                        .into_iter()
                        .map(|c| WireCmd {
                            cmd_id: c.id,
                            query: c.query,
                        })
                        .collect(),
                })
            }

            BackendRequest::CompleteCmds { uuid, completions } => {
                let site = self.registry.site(uuid).await?;
                for completion in completions {
                    match site
                        .cmdq
                        .complete(completion.cmd_id, completion.response)
                        .await?
                    {
                        Some(command) => mirror::apply_completion(&site, &command),
                        None => {
                            // Duplicate or unknown; already logged by the
                            // queue.
                        }
                    }
                }
                Ok(BackendResponse::Ok)
            }
        }
    }

    pub async fn serve(self: Arc<Self>, address: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(address).await?;
        log::info!("cloud backend listening on {address}");

        loop {
            let (stream, peer) = listener.accept().await?;
            let service = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = service.serve_connection(stream).await {
                    log::error!("backend connection from {peer} failed: {err}");
                }
            });
        }
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        while let Some(request) = read_frame::<BackendRequest, _>(&mut stream).await? {
            let response = self.handle(request).await;
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }
}
