//! The property tree: the typed hierarchical store shared by the appliance
//! server (as the live authority) and the cloud mirror (as a per-site
//! cache).

mod marshal;
mod node;
#[allow(clippy::module_inception)]
mod tree;

pub use marshal::PropExport;
pub use node::{hash_from_hex, hash_hex, leaf_hash, NodeHash, NodeId, PropNode};
pub use tree::{PropTree, TreeError, MAIN_ROOT, METRICS_ROOT};
