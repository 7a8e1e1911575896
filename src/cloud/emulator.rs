//! An in-memory surrogate appliance. Fetches commands one at a time from
//! its site's queue, executes them against a private tree with a little
//! random latency, and posts the responses back. Exists purely to drive
//! the frontend end-to-end in test environments.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::{
    dispatch::Dispatch,
    hooks,
    schema::Schema,
    server::execute_query,
    tree::{PropExport, PropTree, MAIN_ROOT},
    wire::{ConfigQuery, ConfigResponse, ResponseCode},
};

use super::{cmdqueue::CmdQueueError, mirror, site::Site};

pub struct Emulator {
    site: Arc<Site>,
    tree: Mutex<PropTree>,
    schema: Arc<Schema>,
    dispatch: Arc<Dispatch>,
}

impl Emulator {
    /// Builds an emulator for `site`, optionally seeding its tree.
    pub fn new(site: Arc<Site>, seed: Option<&PropExport>) -> anyhow::Result<Emulator> {
        let tree = match seed {
            Some(export) => PropTree::from_export(MAIN_ROOT, export)?,
            None => PropTree::new(MAIN_ROOT),
        };

        let schema = Arc::new(Schema::load_default()?);
        let mut dispatch = Dispatch::new();
        hooks::register_standard(&mut dispatch)?;

        Ok(Emulator {
            site,
            tree: Mutex::new(tree),
            schema,
            dispatch: Arc::new(dispatch),
        })
    }

    /// Runs until the surrounding task is dropped.
    pub async fn run(&self) -> Result<(), CmdQueueError> {
        log::info!("emulator for site {} started", self.site.uuid);
        let mut last_id = 0;

        loop {
            let commands = self.site.cmdq.fetch(last_id, 1, true).await?;
            for command in commands {
                last_id = command.id;

                // A realistic appliance is never instantaneous.
                let latency = rand::thread_rng().gen_range(5..50);
                tokio::time::sleep(Duration::from_millis(latency)).await;

                let response = self.execute(&command.query);
                let response = serde_json::to_value(&response)
                    .unwrap_or(Value::Null);
                if let Some(done) = self.site.cmdq.complete(command.id, response).await? {
                    mirror::apply_completion(&self.site, &done);
                }
            }
        }
    }

    fn execute(&self, query: &Value) -> ConfigResponse {
        let query: ConfigQuery = match serde_json::from_value(query.clone()) {
            Ok(query) => query,
            Err(err) => {
                return ConfigResponse::new("emulator", ResponseCode::Failed)
                    .with_errmsg(format!("unparsable query: {err}"))
            }
        };

        let mut tree = self.tree.lock().unwrap();
        let (response, _events) =
            execute_query(&mut tree, Some(&*self.schema), &self.dispatch, &query, "emulator");
        response
    }
}
