//! The on-appliance authoritative server: owns the live tree, executes
//! RPC batches from co-located daemons, streams change events, and keeps
//! the tree persisted through a debounced background writer.

mod exec;

pub use exec::execute_query;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Sender};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;

use crate::{
    access::AccessLevel,
    devices::{DeviceDb, DeviceOps},
    dispatch::Dispatch,
    events::{Event, MessageQueue, Subscription},
    expiry::{ExpiryDriver, RearmHandle},
    hooks,
    schema::Schema,
    store::Store,
    tree::{hash_hex, PropTree, METRICS_ROOT},
    upgrade,
    wire::{read_frame, write_frame, ConfigQuery, ConfigResponse, ResponseCode},
};

/// Consecutive transport failures tolerated before a connection drops.
const MAX_RECV_ERRORS: u32 = 5;

/// Default debounce between accepted commits and the tree hitting disk.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(2);

/// All of the state behind one appliance's RPC surface.
pub struct Appliance {
    tree: Arc<Mutex<PropTree>>,
    metrics: Arc<Mutex<PropTree>>,
    schema: Arc<Schema>,
    dispatch: Arc<Dispatch>,
    events: Arc<MessageQueue<Event>>,
    persist_tx: Sender<()>,
    rearm: RearmHandle,
    sender: String,

    /// Background workers; joined on drop.
    #[allow(unused)]
    persister: Persister,
    #[allow(unused)]
    expiry: ExpiryDriver,
}

impl Appliance {
    pub fn new(
        store: Store,
        devices: DeviceDb,
        persist_interval: Duration,
    ) -> anyhow::Result<Appliance> {
        let mut tree = store.load()?;
        upgrade::run(&mut tree, &store)?;
        tree.set_cacheable(true);

        let schema = Arc::new(Schema::load_default()?);

        let mut dispatch = Dispatch::new();
        dispatch.register_subtree(r"^@/devices(/|$)", Arc::new(DeviceOps::new(&devices)))?;
        hooks::register_standard(&mut dispatch)?;
        let dispatch = Arc::new(dispatch);

        let tree = Arc::new(Mutex::new(tree));
        let metrics = Arc::new(Mutex::new(PropTree::new(METRICS_ROOT)));
        let events = Arc::new(MessageQueue::new());
        let store = Arc::new(store);

        let (persister, persist_tx) =
            Persister::start(Arc::clone(&tree), Arc::clone(&store), persist_interval);
        let (expiry, rearm) = ExpiryDriver::start(
            Arc::clone(&tree),
            Arc::clone(&dispatch),
            Arc::clone(&events),
            Some(persist_tx.clone()),
        );

        Ok(Appliance {
            tree,
            metrics,
            schema,
            dispatch,
            events,
            persist_tx,
            rearm,
            sender: "canopyd".to_owned(),
            persister,
            expiry,
        })
    }

    pub fn tree_handle(&self) -> Arc<Mutex<PropTree>> {
        Arc::clone(&self.tree)
    }

    pub fn tree(&self) -> MutexGuard<'_, PropTree> {
        self.tree.lock().unwrap()
    }

    pub fn subscribe(&self) -> Subscription<Event> {
        self.events.subscribe()
    }

    pub fn root_hash_hex(&self) -> String {
        hash_hex(&self.tree.lock().unwrap().root_hash())
    }

    /// Executes one batch and publishes its events. Ops under `@/metrics`
    /// run against the side tree, without schema governance but gated to
    /// service level and above.
    pub fn execute(&self, query: &ConfigQuery) -> ConfigResponse {
        let metrics_ops = query
            .ops
            .iter()
            .filter(|op| {
                op.property == METRICS_ROOT
                    || op.property.starts_with("@/metrics/")
            })
            .count();

        let (response, events) = if metrics_ops > 0 {
            if metrics_ops < query.ops.len() {
                return ConfigResponse::new(&self.sender, ResponseCode::Unsupported)
                    .with_errmsg("cannot mix metrics and configuration ops".to_owned());
            }
            if query.level < AccessLevel::Service {
                return ConfigResponse::new(&self.sender, ResponseCode::Failed)
                    .with_errmsg("metrics tree requires service level".to_owned());
            }
            let mut metrics = self.metrics.lock().unwrap();
            execute_query(&mut metrics, None, &self.dispatch, query, &self.sender)
        } else {
            let mut tree = self.tree.lock().unwrap();
            execute_query(&mut tree, Some(&*self.schema), &self.dispatch, query, &self.sender)
        };

        if !events.is_empty() {
            self.events.push_messages(&events);
            let _ = self.persist_tx.try_send(());
            let _ = self.rearm.try_send(());
        }

        response
    }
}

/// The request/reply socket loop, one task per co-located daemon.
pub struct LiveServer {
    appliance: Arc<Appliance>,
}

impl LiveServer {
    pub fn new(appliance: Arc<Appliance>) -> LiveServer {
        LiveServer { appliance }
    }

    pub fn start(self, address: SocketAddr) -> anyhow::Result<()> {
        let rt = Runtime::new()?;
        rt.block_on(async move {
            let listener = TcpListener::bind(address).await?;
            log::info!("appliance server listening on {address}");

            loop {
                let (stream, peer) = listener.accept().await?;
                let appliance = Arc::clone(&self.appliance);

                tokio::spawn(async move {
                    log::debug!("daemon connected from {peer}");
                    if let Err(err) = serve_connection(appliance, stream).await {
                        log::error!("connection from {peer} failed: {err}");
                    }
                });
            }
        })
    }
}

async fn serve_connection(appliance: Arc<Appliance>, mut stream: TcpStream) -> io::Result<()> {
    let mut errors = 0u32;
    loop {
        match read_frame::<ConfigQuery, _>(&mut stream).await {
            Ok(Some(query)) => {
                errors = 0;
                let response = appliance.execute(&query);
                write_frame(&mut stream, &response).await?;
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                errors += 1;
                log::warn!("receive error ({errors}/{MAX_RECV_ERRORS}): {err}");
                if errors >= MAX_RECV_ERRORS {
                    return Err(err);
                }
            }
        }
    }
}

/// Debounced single-writer persistence worker. Commit signals coalesce;
/// the whole tree is written at most once per interval, and write errors
/// never fail the in-memory commit.
struct Persister {
    shutdown: Sender<()>,

    #[allow(unused)]
    job_thread: jod_thread::JoinHandle<()>,
}

impl Persister {
    fn start(
        tree: Arc<Mutex<PropTree>>,
        store: Arc<Store>,
        interval: Duration,
    ) -> (Persister, Sender<()>) {
        let (signal_tx, signal_rx) = bounded::<()>(1);
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let job_thread = jod_thread::Builder::new()
            .name("persistence writer".to_owned())
            .spawn(move || {
                log::trace!("persistence writer started");
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(signal_rx) -> msg => {
                            if msg.is_err() {
                                break;
                            }
                            // Absorb the burst, then write once.
                            let deadline = Instant::now() + interval;
                            while signal_rx.recv_deadline(deadline).is_ok() {}
                            write_tree(&tree, &store);
                        }
                    }
                }
                // One final write so a clean shutdown never loses a
                // signalled commit.
                write_tree(&tree, &store);
                log::trace!("persistence writer stopped");
            })
            .expect("failed to spawn persistence writer");

        (
            Persister {
                shutdown: shutdown_tx,
                job_thread,
            },
            signal_tx,
        )
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        let _ = self.shutdown.try_send(());
    }
}

fn write_tree(tree: &Arc<Mutex<PropTree>>, store: &Arc<Store>) {
    let json = {
        let tree = tree.lock().unwrap();
        match tree.to_json_pretty() {
            Ok(json) => json,
            Err(err) => {
                log::warn!("tree marshal for persistence failed: {err}");
                return;
            }
        }
    };
    if let Err(err) = store.save_json(&json) {
        log::warn!("persistence write failed: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::wire::{ConfigOp, OpType};
    use tempfile::tempdir;

    fn appliance() -> (Appliance, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let appliance = Appliance::new(
            Store::new(dir.path()),
            DeviceDb::default(),
            Duration::from_millis(50),
        )
        .unwrap();
        (appliance, dir)
    }

    #[test]
    fn executes_and_publishes_events() {
        let (appliance, _dir) = appliance();
        let sub = appliance.subscribe();

        let query = ConfigQuery::new(
            "test",
            AccessLevel::Admin,
            vec![ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid").with_value("newssid")],
        );
        let response = appliance.execute(&query);
        assert_eq!(response.code, ResponseCode::Ok);

        let events = sub.recv_timeout(Duration::from_secs(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Change);
        assert_eq!(events[0].property, "@/network/vap/psk/ssid");
        assert_eq!(events[0].value.as_deref(), Some("newssid"));

        assert!(appliance.tree().validate());
    }

    #[test]
    fn metrics_ops_do_not_mix_with_config_ops() {
        let (appliance, _dir) = appliance();
        let query = ConfigQuery::new(
            "test",
            AccessLevel::Service,
            vec![
                ConfigOp::new(OpType::Create, "@/metrics/health/uptime").with_value("5"),
                ConfigOp::new(OpType::Create, "@/site/name").with_value("home"),
            ],
        );
        let response = appliance.execute(&query);
        assert_eq!(response.code, ResponseCode::Unsupported);
    }

    #[test]
    fn metrics_tree_is_separate() {
        let (appliance, _dir) = appliance();

        let query = ConfigQuery::new(
            "test",
            AccessLevel::Service,
            vec![ConfigOp::new(OpType::Create, "@/metrics/health/uptime").with_value("5")],
        );
        assert!(appliance.execute(&query).is_ok());

        let query = ConfigQuery::get("test", AccessLevel::Service, "@/metrics/health/uptime");
        let response = appliance.execute(&query);
        assert!(response.is_ok());
        assert!(response.value.unwrap().contains('5'));

        // The main tree never saw a "metrics" child.
        let main = appliance.tree();
        assert!(main
            .lookup(&main.parse("@/metrics/health/uptime").unwrap())
            .is_none());
    }

    #[test]
    fn persistence_debouncer_writes_after_commit() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().to_path_buf();
        let appliance = Appliance::new(
            Store::new(&store_path),
            DeviceDb::default(),
            Duration::from_millis(20),
        )
        .unwrap();

        let query = ConfigQuery::new(
            "test",
            AccessLevel::Admin,
            vec![ConfigOp::new(OpType::Create, "@/site/name").with_value("home")],
        );
        assert!(appliance.execute(&query).is_ok());

        // Wait out the debounce interval.
        std::thread::sleep(Duration::from_millis(300));
        let on_disk = Store::new(&store_path).load().unwrap();
        let now = time::OffsetDateTime::now_utc();
        assert_eq!(
            on_disk
                .get_prop(&on_disk.parse("@/site/name").unwrap(), now)
                .unwrap(),
            "home"
        );
    }
}
