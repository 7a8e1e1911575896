pub mod cli;

pub mod access;
pub mod cloud;
pub mod devices;
pub mod dispatch;
pub mod events;
pub mod expiry;
pub mod hooks;
pub mod logging;
pub mod path;
pub mod schema;
pub mod server;
pub mod store;
pub mod tree;
pub mod upgrade;
pub mod uplink;
pub mod wire;

pub use access::AccessLevel;
pub use events::{Event, EventKind, MessageQueue, Subscription};
pub use path::PropPath;
pub use schema::{Schema, ValType};
pub use server::{Appliance, LiveServer};
pub use store::Store;
pub use tree::{hash_hex, NodeHash, NodeId, PropExport, PropNode, PropTree};
pub use wire::{ConfigOp, ConfigQuery, ConfigResponse, OpType, ResponseCode, PROTOCOL_VERSION};
