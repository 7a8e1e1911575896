use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::runtime::Runtime;

use crate::cloud::{
    site::{QueueBackend, SiteRegistry},
    CloudServer,
};

/// Run the cloud mirror service.
#[derive(Debug, Parser)]
pub struct CloudCommand {
    /// Directory for the command database and logs. Queues are in-memory
    /// when omitted.
    #[clap(long)]
    pub state: Option<PathBuf>,

    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1")]
    pub address: IpAddr,

    /// Port for the operator-facing frontend.
    #[clap(long, default_value = "4740")]
    pub frontend_port: u16,

    /// Port for the appliance-facing backend.
    #[clap(long, default_value = "4741")]
    pub backend_port: u16,
}

impl CloudCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let backend = match &self.state {
            Some(dir) => {
                fs_err::create_dir_all(dir)?;
                let db_path = dir.join("cl_cmds.db");
                // libsql's builder is async; stand up a throwaway runtime
                // for the open, the serve runtime takes over afterwards.
                let rt = Runtime::new()?;
                let database = rt
                    .block_on(libsql::Builder::new_local(&db_path).build())
                    .with_context(|| format!("opening command database {}", db_path.display()))?;
                QueueBackend::Db(Arc::new(database))
            }
            None => {
                log::warn!("no --state directory; command queues are not durable");
                QueueBackend::Memory
            }
        };

        let registry = Arc::new(SiteRegistry::new(backend));
        let frontend_addr = SocketAddr::new(self.address, self.frontend_port);
        let backend_addr = SocketAddr::new(self.address, self.backend_port);

        CloudServer::new(registry).start(frontend_addr, backend_addr)
    }
}
