//! Batch execution: one `ConfigQuery` against one tree, inside a single
//! changeset. The first failing op stops execution, reverts everything,
//! and becomes the batch's response code.

use time::OffsetDateTime;

use crate::{
    access::AccessLevel,
    dispatch::{Dispatch, DispatchError},
    events::Event,
    schema::{Schema, SchemaError},
    tree::{PropTree, TreeError},
    wire::{ConfigOp, ConfigQuery, ConfigResponse, OpType, ResponseCode, PROTOCOL_VERSION},
};

/// An op failure, already shaped for the wire.
#[derive(Debug)]
pub struct OpError {
    pub code: ResponseCode,
    pub errmsg: String,
}

impl OpError {
    fn failed(errmsg: impl Into<String>) -> OpError {
        OpError {
            code: ResponseCode::Failed,
            errmsg: errmsg.into(),
        }
    }
}

impl From<TreeError> for OpError {
    fn from(err: TreeError) -> OpError {
        let code = match &err {
            TreeError::NoProp(_) => ResponseCode::NoProp,
            TreeError::Expired(_) => ResponseCode::Expired,
            TreeError::NotLeaf(_) => ResponseCode::NotLeaf,
            TreeError::NotDir(_) | TreeError::LeafConflict(_) | TreeError::Invalid(_) => {
                ResponseCode::Failed
            }
            TreeError::Path(_) => ResponseCode::Failed,
        };
        OpError {
            code,
            errmsg: err.to_string(),
        }
    }
}

impl From<SchemaError> for OpError {
    fn from(err: SchemaError) -> OpError {
        OpError::failed(err.to_string())
    }
}

impl From<DispatchError> for OpError {
    fn from(err: DispatchError) -> OpError {
        match err {
            DispatchError::Unsupported(path) => OpError {
                code: ResponseCode::Unsupported,
                errmsg: format!("operation not supported on {path}"),
            },
            DispatchError::Hook(reason) => OpError::failed(reason),
            DispatchError::Tree(err) => err.into(),
        }
    }
}

/// Executes a whole batch. The caller holds the tree lock; the schema is
/// `None` for trees that are not schema-governed (the metrics side tree,
/// the emulator's scratch tree).
pub fn execute_query(
    tree: &mut PropTree,
    schema: Option<&Schema>,
    dispatch: &Dispatch,
    query: &ConfigQuery,
    sender: &str,
) -> (ConfigResponse, Vec<Event>) {
    if query.version != PROTOCOL_VERSION {
        let resp = ConfigResponse::new(sender, ResponseCode::BadVersion).with_errmsg(format!(
            "protocol version {} != {PROTOCOL_VERSION}",
            query.version
        ));
        return (resp, Vec::new());
    }

    if query.parse_timestamp().is_err() {
        let resp = ConfigResponse::new(sender, ResponseCode::BadTime)
            .with_errmsg(format!("unparsable timestamp '{}'", query.timestamp));
        return (resp, Vec::new());
    }

    if query.ops.is_empty() {
        let resp = ConfigResponse::new(sender, ResponseCode::Failed)
            .with_errmsg("empty op list".to_owned());
        return (resp, Vec::new());
    }

    // GET returns a payload, so it cannot share a batch with other ops.
    let gets = query
        .ops
        .iter()
        .filter(|op| op.operation == OpType::Get)
        .count();
    if gets > 0 && query.ops.len() > 1 {
        let resp = ConfigResponse::new(sender, ResponseCode::Failed)
            .with_errmsg("GET must be the only op in its batch".to_owned());
        return (resp, Vec::new());
    }

    let now = OffsetDateTime::now_utc();
    tree.changeset_init();

    let mut get_value = None;
    for op in &query.ops {
        match run_op(tree, schema, dispatch, op, query.level, now) {
            Ok(Some(value)) => get_value = Some(value),
            Ok(None) => {}
            Err(err) => {
                tree.changeset_revert();
                let resp = ConfigResponse::new(sender, err.code).with_errmsg(err.errmsg);
                return (resp, Vec::new());
            }
        }
    }

    let events = tree.changeset_commit(OffsetDateTime::now_utc());
    let mut resp = ConfigResponse::new(sender, ResponseCode::Ok);
    if let Some(value) = get_value {
        resp = resp.with_value(value);
    }
    (resp, events)
}

fn run_op(
    tree: &mut PropTree,
    schema: Option<&Schema>,
    dispatch: &Dispatch,
    op: &ConfigOp,
    level: AccessLevel,
    now: OffsetDateTime,
) -> Result<Option<String>, OpError> {
    if op.operation == OpType::Ping {
        return Ok(None);
    }

    let path = tree.parse(&op.property).map_err(TreeError::from)?;

    match op.operation {
        OpType::Ping => unreachable!("handled above"),

        OpType::Get => {
            if let Some(schema) = schema {
                schema.validate_prop(&path)?;
            }
            let value = dispatch.ops_for(&op.property).get(tree, &path, now)?;
            Ok(Some(value))
        }

        OpType::Create | OpType::Set => {
            let value = op
                .value
                .as_deref()
                .ok_or_else(|| OpError::failed(format!("{} requires a value", op.property)))?;
            if let Some(schema) = schema {
                schema.validate_prop_val(&path, value, level)?;
            }
            let value = dispatch.run_set_hook(tree, &path, value, now)?;
            let create = op.operation == OpType::Create;
            dispatch
                .ops_for(&op.property)
                .set(tree, &path, &value, op.expires, create)?;
            Ok(None)
        }

        OpType::Delete => {
            if let Some(schema) = schema {
                schema.validate_prop_del(&path, level)?;
            }
            dispatch.ops_for(&op.property).delete(tree, &path)?;
            Ok(None)
        }

        OpType::Test => {
            tree.get_node(&path, now).map_err(OpError::from)?;
            Ok(None)
        }

        OpType::TestEq => {
            let expected = op
                .value
                .as_deref()
                .ok_or_else(|| OpError::failed(format!("{} requires a value", op.property)))?;
            let actual = tree.get_prop(&path, now)?;
            if actual != expected {
                return Err(OpError {
                    code: ResponseCode::NotEqual,
                    errmsg: format!("{} is '{actual}', not '{expected}'", op.property),
                });
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tree::MAIN_ROOT;

    fn setup() -> (PropTree, Schema, Dispatch) {
        let mut tree = PropTree::new(MAIN_ROOT);
        tree.changeset_init();
        for (path, value) in [
            ("@/network/vap/psk/ssid", "setme"),
            ("@/clients/64:9a:be:da:b1:9a/dhcp_name", "deskjet"),
        ] {
            let path = tree.parse(path).unwrap();
            tree.add(&path, value, None).unwrap();
        }
        tree.changeset_commit(OffsetDateTime::now_utc());

        let schema = Schema::load_default().unwrap();
        let mut dispatch = Dispatch::new();
        crate::hooks::register_standard(&mut dispatch).unwrap();
        (tree, schema, dispatch)
    }

    fn query(level: AccessLevel, ops: Vec<ConfigOp>) -> ConfigQuery {
        ConfigQuery::new("test", level, ops)
    }

    #[test]
    fn bad_version_is_rejected() {
        let (mut tree, schema, dispatch) = setup();
        let mut q = ConfigQuery::ping("test", AccessLevel::Admin);
        q.version = 99;
        let (resp, _) = execute_query(&mut tree, Some(&schema), &dispatch, &q, "srv");
        assert_eq!(resp.code, ResponseCode::BadVersion);
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let (mut tree, schema, dispatch) = setup();
        let mut q = ConfigQuery::ping("test", AccessLevel::Admin);
        q.timestamp = "yesterday-ish".to_owned();
        let (resp, _) = execute_query(&mut tree, Some(&schema), &dispatch, &q, "srv");
        assert_eq!(resp.code, ResponseCode::BadTime);
    }

    #[test]
    fn get_must_be_singleton() {
        let (mut tree, schema, dispatch) = setup();
        let q = query(
            AccessLevel::Admin,
            vec![
                ConfigOp::new(OpType::Get, "@/network"),
                ConfigOp::new(OpType::Ping, ""),
            ],
        );
        let (resp, _) = execute_query(&mut tree, Some(&schema), &dispatch, &q, "srv");
        assert_eq!(resp.code, ResponseCode::Failed);
    }

    #[test]
    fn batch_reverts_on_first_failure() {
        let (mut tree, schema, dispatch) = setup();
        let hash_before = tree.root_hash();

        let q = query(
            AccessLevel::Admin,
            vec![
                ConfigOp::new(OpType::Create, "@/clients/64:9a:be:da:b1:9a/dns_name")
                    .with_value("box1"),
                ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid")
                    .with_value("abcdefghijklmnopqrstuvwxyzabcdefghijkl"),
            ],
        );
        let (resp, events) = execute_query(&mut tree, Some(&schema), &dispatch, &q, "srv");

        assert_eq!(resp.code, ResponseCode::Failed);
        assert!(events.is_empty());
        assert_eq!(tree.root_hash(), hash_before);
        assert!(tree
            .lookup(&tree.parse("@/clients/64:9a:be:da:b1:9a/dns_name").unwrap())
            .is_none());
    }

    #[test]
    fn test_and_create_compound() {
        let (mut tree, schema, dispatch) = setup();
        let q = query(
            AccessLevel::Service,
            vec![
                ConfigOp::new(OpType::Test, "@/clients/64:9a:be:da:b1:9a/dhcp_name"),
                ConfigOp::new(OpType::Create, "@/clients/64:9a:be:da:b1:9a/dhcp_name")
                    .with_value("test1"),
            ],
        );
        let (resp, events) = execute_query(&mut tree, Some(&schema), &dispatch, &q, "srv");
        assert_eq!(resp.code, ResponseCode::Ok);
        assert_eq!(events.len(), 1);

        let now = OffsetDateTime::now_utc();
        let got = tree
            .get_prop(&tree.parse("@/clients/64:9a:be:da:b1:9a/dhcp_name").unwrap(), now)
            .unwrap();
        assert_eq!(got, "test1");

        // Against a tree without the test path, the same batch fails whole.
        let (mut tree, schema, dispatch) = setup();
        tree.changeset_init();
        tree.delete(&tree.parse("@/clients").unwrap()).unwrap();
        tree.changeset_commit(now);
        let hash_before = tree.root_hash();

        let (resp, _) = execute_query(&mut tree, Some(&schema), &dispatch, &q, "srv");
        assert_eq!(resp.code, ResponseCode::NoProp);
        assert_eq!(tree.root_hash(), hash_before);
    }

    #[test]
    fn testeq_mismatch_aborts() {
        let (mut tree, schema, dispatch) = setup();
        let q = query(
            AccessLevel::Admin,
            vec![
                ConfigOp::new(OpType::TestEq, "@/network/vap/psk/ssid").with_value("wrong"),
                ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid").with_value("next"),
            ],
        );
        let (resp, _) = execute_query(&mut tree, Some(&schema), &dispatch, &q, "srv");
        assert_eq!(resp.code, ResponseCode::NotEqual);

        let now = OffsetDateTime::now_utc();
        assert_eq!(
            tree.get_prop(&tree.parse("@/network/vap/psk/ssid").unwrap(), now)
                .unwrap(),
            "setme"
        );
    }

    #[test]
    fn writes_below_required_level_fail() {
        let (mut tree, schema, dispatch) = setup();
        let q = query(
            AccessLevel::User,
            vec![ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid").with_value("newssid")],
        );
        let (resp, _) = execute_query(&mut tree, Some(&schema), &dispatch, &q, "srv");
        assert_eq!(resp.code, ResponseCode::Failed);
    }

    #[test]
    fn unsupported_surfaces_from_subtree_ops() {
        let (mut tree, schema, mut dispatch) = setup();
        let db = crate::devices::DeviceDb::default();
        dispatch
            .register_subtree(
                r"^@/devices(/|$)",
                Arc::new(crate::devices::DeviceOps::new(&db)),
            )
            .unwrap();

        let q = query(
            AccessLevel::Service,
            vec![ConfigOp::new(OpType::Set, "@/devices/64:9a:be:da:b1:9a/kind")
                .with_value("printer")],
        );
        let (resp, _) = execute_query(&mut tree, Some(&schema), &dispatch, &q, "srv");
        assert_eq!(resp.code, ResponseCode::Unsupported);
    }
}
