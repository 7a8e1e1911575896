//! The cloud-side mirror service: per-site cached trees, the command
//! queue, the appliance-facing backend, the operator-facing frontend, and
//! the background maintenance loops.

pub mod backend;
pub mod cmdqueue;
pub mod dbqueue;
pub mod emulator;
pub mod frontend;
pub mod mirror;
pub mod site;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::runtime::Runtime;

use self::{backend::BackendService, frontend::FrontendService, site::SiteRegistry};

/// How often the queue garbage collector sweeps every site.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// How often the metrics scheduler looks for stale caches.
const METRICS_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Wires the frontend, backend, and maintenance loops onto one runtime.
pub struct CloudServer {
    registry: Arc<SiteRegistry>,
}

impl CloudServer {
    pub fn new(registry: Arc<SiteRegistry>) -> CloudServer {
        CloudServer { registry }
    }

    pub fn start(
        self,
        frontend_addr: SocketAddr,
        backend_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let rt = Runtime::new()?;
        rt.block_on(async move {
            let frontend = Arc::new(FrontendService::new(Arc::clone(&self.registry)));
            let backend = Arc::new(BackendService::new(Arc::clone(&self.registry)));

            let gc_registry = Arc::clone(&self.registry);
            tokio::spawn(gc_loop(gc_registry));
            let metrics_registry = Arc::clone(&self.registry);
            tokio::spawn(metrics_loop(metrics_registry));

            tokio::try_join!(frontend.serve(frontend_addr), backend.serve(backend_addr))?;
            Ok(())
        })
    }
}

async fn gc_loop(registry: Arc<SiteRegistry>) {
    let mut interval = tokio::time::interval(GC_INTERVAL);
    loop {
        interval.tick().await;
        for uuid in registry.uuids() {
            let Some(site) = registry.get(uuid) else {
                continue;
            };
            match site.cmdq.gc().await {
                Ok(0) => {}
                Ok(collected) => log::debug!("site {uuid}: collected {collected} commands"),
                Err(err) => log::warn!("site {uuid}: queue gc failed: {err}"),
            }
        }
    }
}

async fn metrics_loop(registry: Arc<SiteRegistry>) {
    let mut interval = tokio::time::interval(METRICS_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let now = OffsetDateTime::now_utc();
        for uuid in registry.uuids() {
            let Some(site) = registry.get(uuid) else {
                continue;
            };

            let due = {
                let mut metrics = site.metrics.lock().unwrap();
                if metrics.is_stale(now) {
                    // Push the deadline forward so a slow appliance is not
                    // asked again every sweep.
                    metrics.deadline = Some(now + site::METRICS_REFRESH_INTERVAL);
                    true
                } else {
                    false
                }
            };

            if due {
                if let Err(err) = mirror::submit_metrics_refresh(&site).await {
                    log::warn!("site {uuid}: metrics refresh submit failed: {err}");
                }
            }
        }
    }
}
