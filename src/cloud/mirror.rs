//! Keeping a site's cached tree consistent with its appliance:
//! hash-checked incremental updates with full-refresh recovery, and
//! interpretation of completed commands that carry cache-refreshing
//! payloads.

use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    events::EventKind,
    tree::{hash_hex, PropExport},
    wire::{ConfigQuery, ConfigResponse},
};

use crate::access::AccessLevel;

use super::{
    cmdqueue::{CmdQueueError, Command},
    site::Site,
};

/// Sender string the cloud uses on synthetic queries.
pub const CLOUD_SENDER: &str = "canopy.cloud";

/// Applies one appliance update batch inside a changeset and checks the
/// post-condition root hash. On any mismatch the changeset is reverted and
/// a synthetic full-tree GET is enqueued; its completion replaces the
/// cache. Returns whether the batch applied cleanly.
pub async fn apply_updates(
    site: &Site,
    updates: &[crate::events::Event],
    expected_hash: &str,
) -> Result<bool, CmdQueueError> {
    let applied = {
        let mut tree = site.tree.lock().unwrap();
        tree.changeset_init();

        let mut ok = true;
        for update in updates {
            let Ok(path) = tree.parse(&update.property) else {
                ok = false;
                break;
            };
            let result = match update.kind {
                EventKind::Change => tree
                    .add(&path, update.value.as_deref().unwrap_or(""), update.expires)
                    .map(|_| ()),
                EventKind::Delete | EventKind::Expire => tree.delete(&path).map(|_| ()),
            };
            if let Err(err) = result {
                log::warn!("site {}: update {} failed: {err}", site.uuid, update.property);
                ok = false;
                break;
            }
        }

        if ok && hash_hex(&tree.root_hash()) != expected_hash {
            log::warn!(
                "site {}: root hash mismatch after update batch",
                site.uuid
            );
            ok = false;
        }

        if ok {
            let events = tree.changeset_commit(OffsetDateTime::now_utc());
            drop(tree);
            site.updates.push_messages(&events);
            true
        } else {
            tree.changeset_revert();
            false
        }
    };

    if !applied {
        submit_refresh(site).await?;
    }
    Ok(applied)
}

/// Enqueues the synthetic `GET @/` that repopulates a diverged cache.
pub async fn submit_refresh(site: &Site) -> Result<i64, CmdQueueError> {
    log::info!("site {}: requesting full tree refresh", site.uuid);
    let query = ConfigQuery::get(CLOUD_SENDER, AccessLevel::Internal, "@/");
    let query = serde_json::to_value(&query)
        .map_err(|e| CmdQueueError::Internal(format!("refresh query marshal failed: {e}")))?;
    site.cmdq.submit(query).await
}

/// Enqueues the synthetic metrics GET driven by the refresh scheduler.
pub async fn submit_metrics_refresh(site: &Site) -> Result<i64, CmdQueueError> {
    let query = ConfigQuery::get(CLOUD_SENDER, AccessLevel::Internal, "@/metrics");
    let query = serde_json::to_value(&query)
        .map_err(|e| CmdQueueError::Internal(format!("metrics query marshal failed: {e}")))?;
    site.cmdq.submit(query).await
}

/// Interprets a freshly completed command: a full-tree GET replaces the
/// cached tree, a metrics GET refreshes the metrics cache. Anything else
/// is just a stored response.
pub fn apply_completion(site: &Site, command: &Command) {
    let Ok(query) = serde_json::from_value::<ConfigQuery>(command.query.clone()) else {
        return;
    };
    let Some(response) = command.response.clone() else {
        return;
    };
    let Ok(response) = serde_json::from_value::<ConfigResponse>(response) else {
        return;
    };
    if !response.is_ok() {
        return;
    }
    let Some(value) = response.value else {
        return;
    };

    if query.is_full_tree_get() {
        match serde_json::from_str::<PropExport>(&value) {
            Ok(export) => {
                let mut tree = site.tree.lock().unwrap();
                match tree.replace_from_export(&export) {
                    Ok(()) => log::info!(
                        "site {}: cache replaced, hash {}",
                        site.uuid,
                        hash_hex(&tree.root_hash())
                    ),
                    Err(err) => {
                        log::error!("site {}: cache replacement failed: {err}", site.uuid)
                    }
                }
            }
            Err(err) => log::error!("site {}: bad full-tree response: {err}", site.uuid),
        }
    } else if query.is_metrics_get() {
        match serde_json::from_str::<PropExport>(&value) {
            Ok(export) => {
                site.metrics.lock().unwrap().refresh(export);
                log::debug!("site {}: metrics cache refreshed", site.uuid);
            }
            Err(err) => log::error!("site {}: bad metrics response: {err}", site.uuid),
        }
    }
}

/// Serde helper kept close to its only callers: commands travel the queue
/// as JSON values.
pub fn query_to_value(query: &ConfigQuery) -> Result<Value, CmdQueueError> {
    serde_json::to_value(query)
        .map_err(|e| CmdQueueError::Internal(format!("query marshal failed: {e}")))
}
