//! Per-site cloud state: the cached tree mirrored from the appliance, the
//! metrics cache with its refresh deadline, the command queue, and the
//! update subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    events::{Event, MessageQueue},
    tree::{hash_hex, PropExport, PropTree, MAIN_ROOT},
};

use super::{
    cmdqueue::{CmdQueue, CmdQueueError, MemQueue, DEFAULT_RETENTION},
    dbqueue::DbQueue,
};

/// How long a metrics snapshot stays fresh before the refresh scheduler
/// asks the appliance again.
pub const METRICS_REFRESH_INTERVAL: time::Duration = time::Duration::minutes(5);

#[derive(Default)]
pub struct MetricsCache {
    pub export: Option<PropExport>,
    pub refreshed: Option<OffsetDateTime>,
    pub deadline: Option<OffsetDateTime>,
}

impl MetricsCache {
    pub fn refresh(&mut self, export: PropExport) {
        let now = OffsetDateTime::now_utc();
        self.export = Some(export);
        self.refreshed = Some(now);
        self.deadline = Some(now + METRICS_REFRESH_INTERVAL);
    }

    pub fn is_stale(&self, now: OffsetDateTime) -> bool {
        self.deadline.map_or(true, |deadline| deadline <= now)
    }
}

pub struct Site {
    pub uuid: Uuid,
    pub tree: Mutex<PropTree>,
    pub metrics: Mutex<MetricsCache>,
    pub cmdq: Arc<dyn CmdQueue>,
    pub updates: Arc<MessageQueue<Event>>,
}

impl Site {
    fn new(uuid: Uuid, cmdq: Arc<dyn CmdQueue>) -> Site {
        Site {
            uuid,
            tree: Mutex::new(PropTree::new(MAIN_ROOT)),
            metrics: Mutex::new(MetricsCache::default()),
            cmdq,
            updates: Arc::new(MessageQueue::new()),
        }
    }

    pub fn root_hash_hex(&self) -> String {
        hash_hex(&self.tree.lock().unwrap().root_hash())
    }

    /// A cache holding nothing but its root has never been refreshed.
    pub fn is_unseen(&self) -> bool {
        self.tree.lock().unwrap().node_count() <= 1
    }
}

/// Which command-queue back-end new sites get.
#[derive(Clone)]
pub enum QueueBackend {
    Memory,
    Db(Arc<libsql::Database>),
}

/// All known sites, keyed by site UUID. Sites materialize on first
/// contact.
pub struct SiteRegistry {
    sites: Mutex<HashMap<Uuid, Arc<Site>>>,
    backend: QueueBackend,
    retention: usize,
}

impl SiteRegistry {
    pub fn new(backend: QueueBackend) -> SiteRegistry {
        SiteRegistry {
            sites: Mutex::new(HashMap::new()),
            backend,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn new_memory() -> SiteRegistry {
        SiteRegistry::new(QueueBackend::Memory)
    }

    pub fn with_retention(mut self, retention: usize) -> SiteRegistry {
        self.retention = retention;
        self
    }

    /// The site record for `uuid`, creating it (and its queue) on first
    /// sight.
    pub async fn site(&self, uuid: Uuid) -> Result<Arc<Site>, CmdQueueError> {
        if let Some(site) = self.get(uuid) {
            return Ok(site);
        }

        let cmdq: Arc<dyn CmdQueue> = match &self.backend {
            QueueBackend::Memory => Arc::new(MemQueue::new(self.retention)),
            QueueBackend::Db(db) => Arc::new(DbQueue::open(db, uuid, self.retention).await?),
        };

        let mut sites = self.sites.lock().unwrap();
        // Another task may have raced the creation; first insert wins.
        let site = sites
            .entry(uuid)
            .or_insert_with(|| Arc::new(Site::new(uuid, cmdq)));
        Ok(Arc::clone(site))
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<Site>> {
        self.sites.lock().unwrap().get(&uuid).cloned()
    }

    pub fn uuids(&self) -> Vec<Uuid> {
        self.sites.lock().unwrap().keys().copied().collect()
    }
}
