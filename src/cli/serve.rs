use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use crate::{
    devices::DeviceDb,
    server::{Appliance, LiveServer},
    store::Store,
    uplink::Uplink,
};

/// Run the on-appliance authoritative configuration daemon.
#[derive(Debug, Parser)]
pub struct ServeCommand {
    /// Directory holding the persisted tree and logs.
    #[clap(long, default_value = "/var/lib/canopy")]
    pub state: PathBuf,

    /// Device identification database (JSON), read once at startup.
    #[clap(long)]
    pub devices: Option<PathBuf>,

    /// Address to listen on for local daemons.
    #[clap(long, default_value = "127.0.0.1")]
    pub address: IpAddr,

    /// Port to listen on.
    #[clap(long, default_value = "4730")]
    pub port: u16,

    /// Debounce between accepted commits and persistence writes.
    #[clap(long, default_value = "2s")]
    pub persist_every: humantime::Duration,

    /// Cloud backend to mirror to; standalone when omitted.
    #[clap(long)]
    pub cloud: Option<SocketAddr>,
}

impl ServeCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let devices = match &self.devices {
            Some(path) => DeviceDb::load(path)
                .with_context(|| format!("loading device database {}", path.display()))?,
            None => DeviceDb::default(),
        };

        let store = Store::new(&self.state);
        let appliance = Appliance::new(store, devices, *self.persist_every)
            .context("appliance startup failed")?;

        log::info!("appliance tree at hash {}", appliance.root_hash_hex());

        let appliance = Arc::new(appliance);

        if let Some(cloud) = self.cloud {
            let uplink = Uplink::new(Arc::clone(&appliance), cloud);
            std::thread::Builder::new()
                .name("cloud uplink".to_owned())
                .spawn(move || {
                    let rt = tokio::runtime::Runtime::new().expect("uplink runtime");
                    rt.block_on(uplink.run());
                })
                .context("spawning cloud uplink")?;
        }

        let address = SocketAddr::new(self.address, self.port);
        LiveServer::new(appliance).start(address)
    }
}
