use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::runtime::Runtime;
use uuid::Uuid;

use crate::{
    cloud::{emulator::Emulator, frontend::FrontendService, site::SiteRegistry},
    tree::PropExport,
};

/// Stand up a self-contained test environment: an in-memory cloud
/// frontend backed by a surrogate appliance, for driving the operator
/// CLI without real hardware.
#[derive(Debug, Parser)]
pub struct EmulateCommand {
    /// Site UUID to emulate; random when omitted.
    #[clap(short = 'a', long = "appliance")]
    pub site: Option<Uuid>,

    /// Seed tree (JSON export) for the emulated appliance.
    #[clap(long)]
    pub seed: Option<PathBuf>,

    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1")]
    pub address: IpAddr,

    /// Port for the operator-facing frontend.
    #[clap(long, default_value = "4740")]
    pub frontend_port: u16,
}

impl EmulateCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let site_uuid = self.site.unwrap_or_else(Uuid::new_v4);
        let seed = match &self.seed {
            Some(path) => {
                let raw = fs_err::read_to_string(path)?;
                Some(
                    serde_json::from_str::<PropExport>(&raw)
                        .with_context(|| format!("parsing seed tree {}", path.display()))?,
                )
            }
            None => None,
        };

        let frontend_addr = SocketAddr::new(self.address, self.frontend_port);

        let rt = Runtime::new()?;
        rt.block_on(async move {
            let registry = Arc::new(SiteRegistry::new_memory());
            let site = registry.site(site_uuid).await?;

            let emulator = Emulator::new(Arc::clone(&site), seed.as_ref())?;
            tokio::spawn(async move {
                if let Err(err) = emulator.run().await {
                    log::error!("emulator stopped: {err}");
                }
            });

            log::info!("emulating site {site_uuid} on {frontend_addr}");
            let frontend = Arc::new(FrontendService::new(registry));
            frontend.serve(frontend_addr).await?;
            Ok(())
        })
    }
}
