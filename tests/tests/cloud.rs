//! Cloud mirror behavior: hash-checked updates, divergence recovery,
//! and the emulator driving the frontend end-to-end.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use libcanopy::{
    cloud::{
        backend::BackendService,
        emulator::Emulator,
        frontend::FrontendService,
        mirror,
        site::SiteRegistry,
    },
    events::{Event, EventKind},
    tree::{hash_hex, PropTree, MAIN_ROOT},
    wire::{
        BackendRequest, BackendResponse, CmdCompletion, ConfigOp, ConfigQuery, ConfigResponse,
        FrontendEnvelope, FrontendRequest, OpType, ResponseCode,
    },
    AccessLevel,
};

use crate::canopy_test::{fixture_tree, now, FIXTURE_JSON};

fn change(property: &str, value: &str) -> Event {
    Event {
        kind: EventKind::Change,
        property: property.to_owned(),
        value: Some(value.to_owned()),
        expires: None,
    }
}

/// The root hash a scratch tree lands on after applying `events`.
fn expected_hash(events: &[Event]) -> String {
    let mut tree = PropTree::new(MAIN_ROOT);
    tree.changeset_init();
    for event in events {
        let path = tree.parse(&event.property).unwrap();
        tree.add(&path, event.value.as_deref().unwrap(), None).unwrap();
    }
    tree.changeset_commit(now());
    hash_hex(&tree.root_hash())
}

#[tokio::test]
async fn matching_hash_applies_and_streams_updates() {
    let registry = SiteRegistry::new_memory();
    let site = registry.site(Uuid::new_v4()).await.unwrap();
    let sub = site.updates.subscribe();

    let events = vec![
        change("@/site/name", "home"),
        change("@/network/base_address", "192.168.0.1/24"),
    ];
    let hash = expected_hash(&events);

    let applied = mirror::apply_updates(&site, &events, &hash).await.unwrap();
    assert!(applied);
    assert_eq!(site.root_hash_hex(), hash);

    let streamed = sub.try_drain();
    assert_eq!(streamed.len(), 2);
    assert_eq!(streamed[0].property, "@/site/name");

    // Nothing was enqueued.
    assert!(site.cmdq.fetch(0, 10, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn hash_mismatch_reverts_and_requests_refresh() {
    let registry = SiteRegistry::new_memory();
    let site = registry.site(Uuid::new_v4()).await.unwrap();
    let empty_hash = site.root_hash_hex();

    let events = vec![change("@/site/name", "home")];
    let applied = mirror::apply_updates(&site, &events, "00112233445566778899aabbccddeeff")
        .await
        .unwrap();

    assert!(!applied);
    // The cache is untouched...
    assert_eq!(site.root_hash_hex(), empty_hash);

    // ...and a synthetic full-tree GET sits in the queue.
    let cmds = site.cmdq.fetch(0, 10, false).await.unwrap();
    assert_eq!(cmds.len(), 1);
    let query: ConfigQuery = serde_json::from_value(cmds[0].query.clone()).unwrap();
    assert!(query.is_full_tree_get());
}

#[tokio::test]
async fn completed_refresh_replaces_the_cached_tree() {
    let registry = Arc::new(SiteRegistry::new_memory());
    let site = registry.site(Uuid::new_v4()).await.unwrap();
    let backend = BackendService::new(Arc::clone(&registry));

    let cmd_id = mirror::submit_refresh(&site).await.unwrap();
    site.cmdq.fetch(0, 10, false).await.unwrap();

    // The "appliance" answers with the fixture tree.
    let fixture = fixture_tree();
    let mut response = ConfigResponse::new("appliance", ResponseCode::Ok);
    response.value = Some(fixture.to_json_pretty().unwrap());

    let reply = backend
        .handle(BackendRequest::CompleteCmds {
            uuid: site.uuid,
            completions: vec![CmdCompletion {
                cmd_id,
                response: serde_json::to_value(&response).unwrap(),
            }],
        })
        .await;
    assert!(matches!(reply, BackendResponse::Ok));

    assert_eq!(site.root_hash_hex(), hash_hex(&fixture.root_hash()));
}

#[tokio::test]
async fn hello_from_an_unseen_site_requests_the_tree() {
    let registry = Arc::new(SiteRegistry::new_memory());
    let backend = BackendService::new(Arc::clone(&registry));
    let uuid = Uuid::new_v4();

    let reply = backend.handle(BackendRequest::Hello { uuid }).await;
    assert!(matches!(reply, BackendResponse::Ok));

    let site = registry.site(uuid).await.unwrap();
    let cmds = site.cmdq.fetch(0, 10, false).await.unwrap();
    assert_eq!(cmds.len(), 1);
    let query: ConfigQuery = serde_json::from_value(cmds[0].query.clone()).unwrap();
    assert!(query.is_full_tree_get());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emulator_drives_the_frontend_end_to_end() {
    let registry = Arc::new(SiteRegistry::new_memory());
    let uuid = Uuid::new_v4();
    let site = registry.site(uuid).await.unwrap();
    let frontend = FrontendService::new(Arc::clone(&registry));

    let seed: libcanopy::PropExport = serde_json::from_str(FIXTURE_JSON).unwrap();
    let emulator = Emulator::new(Arc::clone(&site), Some(&seed)).unwrap();
    let emulator_task = tokio::spawn(async move {
        let _ = emulator.run().await;
    });

    // Prime the cache so the read fast path has something to serve.
    mirror::submit_refresh(&site).await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while site.is_unseen() {
        assert!(
            std::time::Instant::now() < deadline,
            "cache never refreshed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // A singleton GET is served from the cache, no queueing.
    let response = frontend
        .handle(FrontendEnvelope {
            site: uuid,
            request: FrontendRequest::Submit {
                query: ConfigQuery::get("op", AccessLevel::Admin, "@/network/vap/psk/ssid"),
            },
        })
        .await;
    assert_eq!(response.code, ResponseCode::Ok);
    assert!(response.value.unwrap().contains("setme"));

    // A write queues, the emulator completes it, status turns OK.
    let response = frontend
        .handle(FrontendEnvelope {
            site: uuid,
            request: FrontendRequest::Submit {
                query: ConfigQuery::new(
                    "op",
                    AccessLevel::Admin,
                    vec![ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid")
                        .with_value("newssid")],
                ),
            },
        })
        .await;
    assert_eq!(response.code, ResponseCode::Queued);
    let cmd_id = response.cmd_id.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        let status = frontend
            .handle(FrontendEnvelope {
                site: uuid,
                request: FrontendRequest::Status { cmd_id },
            })
            .await;
        match status.code {
            ResponseCode::Ok => {
                let inner: ConfigResponse =
                    serde_json::from_str(&status.value.unwrap()).unwrap();
                assert_eq!(inner.code, ResponseCode::Ok);
                break;
            }
            ResponseCode::Queued | ResponseCode::InProgress => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "command never completed"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    // Cancelling a finished command fails; an unknown id reports NOCMD.
    let response = frontend
        .handle(FrontendEnvelope {
            site: uuid,
            request: FrontendRequest::Cancel { cmd_id },
        })
        .await;
    assert_eq!(response.code, ResponseCode::Failed);

    let response = frontend
        .handle(FrontendEnvelope {
            site: uuid,
            request: FrontendRequest::Cancel { cmd_id: 424242 },
        })
        .await;
    assert_eq!(response.code, ResponseCode::NoCmd);

    let response = frontend
        .handle(FrontendEnvelope {
            site: uuid,
            request: FrontendRequest::Ping,
        })
        .await;
    assert_eq!(response.code, ResponseCode::Ok);

    emulator_task.abort();
}
